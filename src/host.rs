//! Host encrypted-media primitives consumed by the session manager.
//!
//! These traits mirror the browser EME surface (`navigator.
//! requestMediaKeySystemAccess`, `MediaKeys`, `MediaKeySession`, the media
//! element) so the manager can drive a real browser binding, a device CDM,
//! or the in-memory [`crate::sim`] host.
//!
//! Signals are delivered over channels: a playback target hands out one
//! receiver of [`EncryptedEvent`]s per subscriber, and every created session
//! comes with its own receiver of [`SessionEvent`]s.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::classify::MessageType;
use crate::config::KeySystemConfig;
use crate::error::HostError;
use crate::key::{KeyId, KeyStatus};

/// Result of a host primitive.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// "Encrypted content encountered" signal from the playback target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEvent {
    pub init_data_type: String,
    pub init_data: Vec<u8>,
}

impl EncryptedEvent {
    pub fn new(init_data_type: impl Into<String>, init_data: impl Into<Vec<u8>>) -> Self {
        Self {
            init_data_type: init_data_type.into(),
            init_data: init_data.into(),
        }
    }
}

/// Signal emitted by a key session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `message` event.
    Message {
        message_type: MessageType,
        message: Vec<u8>,
    },
    /// `keystatuseschange` event. Read the statuses from
    /// [`MediaKeySession::key_statuses`].
    KeyStatusesChange,
}

/// A freshly created key session and its signal stream.
pub struct NewSession {
    pub session: Arc<dyn MediaKeySession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Entry point to the host's encrypted-media support.
#[async_trait]
pub trait EmeHost: Send + Sync {
    /// The capability query, or `None` when the host does not expose it.
    fn capability_query(&self) -> Option<Arc<dyn CapabilityQuery>>;

    /// Fetch a server certificate from `src`.
    async fn fetch_certificate(&self, src: &str) -> HostResult<Vec<u8>>;
}

/// `requestMediaKeySystemAccess`.
#[async_trait]
pub trait CapabilityQuery: Send + Sync {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configs: &[KeySystemConfig],
    ) -> HostResult<Arc<dyn MediaKeySystemAccess>>;
}

/// `MediaKeySystemAccess`.
#[async_trait]
pub trait MediaKeySystemAccess: Send + Sync {
    fn key_system(&self) -> &str;

    async fn create_media_keys(&self) -> HostResult<Arc<dyn MediaKeys>>;
}

/// `MediaKeys`: a CDM instance.
#[async_trait]
pub trait MediaKeys: Send + Sync {
    /// Whether `setServerCertificate` exists on this object.
    fn supports_server_certificate(&self) -> bool;

    /// Returns `Ok(false)` when the CDM ignored the certificate.
    async fn set_server_certificate(&self, certificate: &[u8]) -> HostResult<bool>;

    async fn create_session(&self) -> HostResult<NewSession>;
}

/// `MediaKeySession`.
#[async_trait]
pub trait MediaKeySession: Send + Sync {
    fn session_id(&self) -> String;

    async fn generate_request(&self, init_data_type: &str, init_data: &[u8]) -> HostResult<()>;

    async fn update(&self, response: &[u8]) -> HostResult<()>;

    async fn close(&self) -> HostResult<()>;

    /// Current contents of the session's key status map.
    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)>;
}

/// The protected media element.
#[async_trait]
pub trait PlaybackTarget: Send + Sync {
    /// Media keys currently bound to the element.
    fn media_keys(&self) -> Option<Arc<dyn MediaKeys>>;

    async fn set_media_keys(&self, media_keys: Arc<dyn MediaKeys>) -> HostResult<()>;

    /// Subscribe to `encrypted` signals.
    fn encrypted_events(&self) -> mpsc::UnboundedReceiver<EncryptedEvent>;
}
