//! Manager settings and key system capability configuration.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default delay before a license response is submitted to its session.
pub const DEFAULT_LICENSE_DELAY: Duration = Duration::from_millis(10);

/// Per-manager settings, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Simulated license server latency in milliseconds.
    #[serde(default = "default_license_delay_ms")]
    pub license_delay_ms: u64,
    /// Server certificate location provisioned before each session.
    #[serde(default)]
    pub certificate_src: Option<String>,
}

fn default_license_delay_ms() -> u64 {
    DEFAULT_LICENSE_DELAY.as_millis() as u64
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            license_delay_ms: default_license_delay_ms(),
            certificate_src: None,
        }
    }
}

impl ManagerConfig {
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn license_delay(&self) -> Duration {
        Duration::from_millis(self.license_delay_ms)
    }
}

/// `MediaKeysRequirement` values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
    NotAllowed,
}

/// One audio or video capability entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCapability {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robustness: Option<String>,
}

impl MediaCapability {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            robustness: None,
        }
    }

    #[must_use]
    pub fn with_robustness(mut self, robustness: impl Into<String>) -> Self {
        self.robustness = Some(robustness.into());
        self
    }
}

/// Capability configuration passed to the host capability query.
///
/// Serializes to the same shape as `MediaKeySystemConfiguration`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySystemConfig {
    #[serde(default)]
    pub init_data_types: Vec<String>,
    #[serde(default)]
    pub audio_capabilities: Vec<MediaCapability>,
    #[serde(default)]
    pub video_capabilities: Vec<MediaCapability>,
    #[serde(default)]
    pub distinctive_identifier: Requirement,
    #[serde(default)]
    pub persistent_state: Requirement,
    #[serde(default)]
    pub session_types: Vec<String>,
}

impl KeySystemConfig {
    /// A `cenc` configuration for one video and one audio content type.
    pub fn for_content_types(video: Option<&str>, audio: Option<&str>) -> Self {
        Self {
            init_data_types: vec!["cenc".to_string()],
            audio_capabilities: audio.map(MediaCapability::new).into_iter().collect(),
            video_capabilities: video.map(MediaCapability::new).into_iter().collect(),
            distinctive_identifier: Requirement::Optional,
            persistent_state: Requirement::Optional,
            session_types: vec!["temporary".to_string()],
        }
    }

    /// Every content type named by this configuration.
    pub fn content_types(&self) -> impl Iterator<Item = &str> {
        self.video_capabilities
            .iter()
            .chain(self.audio_capabilities.iter())
            .map(|c| c.content_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let config = ManagerConfig::from_yaml("{}").expect("parse");
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.license_delay(), DEFAULT_LICENSE_DELAY);
    }

    #[test]
    fn yaml_overrides_delay_and_certificate() {
        let config = ManagerConfig::from_yaml(
            "license_delay_ms: 5000\ncertificate_src: certs/valid_widevine_cert.bin\n",
        )
        .expect("parse");
        assert_eq!(config.license_delay(), Duration::from_secs(5));
        assert_eq!(
            config.certificate_src.as_deref(),
            Some("certs/valid_widevine_cert.bin")
        );
    }

    #[test]
    fn key_system_config_serializes_like_eme() {
        let config = KeySystemConfig::for_content_types(
            Some("video/mp4; codecs=\"avc1.4d401e\""),
            Some("audio/mp4; codecs=\"mp4a.40.2\""),
        );
        let value = serde_yaml::to_value(&config).expect("serialize");
        assert!(value.get("initDataTypes").is_some());
        assert!(value.get("videoCapabilities").is_some());
        assert_eq!(config.content_types().count(), 2);
    }
}
