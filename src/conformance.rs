//! EME conformance test catalogue.
//!
//! Each [`TestDefinition`] names a playback scenario and the
//! [`Expectation`]s checked against the session manager once playback has
//! advanced far enough. Checks are logger-style: a passing check is logged,
//! the first failing one aborts the test with a [`CheckFailure`].
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::{Error, Result};
use crate::license::KeySystem;
use crate::manager::Diagnostics;
use crate::pssh::count_pssh_atoms;

/// Playback position most tests wait for, in seconds.
pub const PLAYBACK_SECONDS: f64 = 15.0;

/// Playback position the certificate and Web Audio tests wait for.
pub const SHORT_PLAYBACK_SECONDS: f64 = 5.0;

/// License delay of the no-clear-start tests.
pub const LONG_LICENSE_DELAY: Duration = Duration::from_secs(5);

/// Suite every test in the catalogue belongs to.
pub const SUITE_NAME: &str = "EME Conformance Tests";

/// A failed conformance check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Assert: {0}")]
pub struct CheckFailure(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    fn title(self) -> &'static str {
        match self {
            MediaType::Video => "Video",
            MediaType::Audio => "Audio",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Video => f.write_str("video"),
            MediaType::Audio => f.write_str("audio"),
        }
    }
}

/// An encrypted elementary stream a test plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedStream {
    pub codec: &'static str,
    pub media_type: MediaType,
}

impl EncryptedStream {
    pub const H264_VIDEO: Self = Self::video("H264");
    pub const VP9_VIDEO: Self = Self::video("VP9");
    pub const AAC_AUDIO: Self = Self::audio("AAC");
    pub const OPUS_AUDIO: Self = Self::audio("Opus");

    const fn video(codec: &'static str) -> Self {
        Self {
            codec,
            media_type: MediaType::Video,
        }
    }

    const fn audio(codec: &'static str) -> Self {
        Self {
            codec,
            media_type: MediaType::Audio,
        }
    }
}

/// Something a test asserts about the finished scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// Playback passed `seconds`, optionally with every key usable.
    PlaybackReached { seconds: f64, keys_usable: bool },
    KeySessionCount(usize),
    KeyCount(usize),
    /// The client asked for a service certificate.
    CertificateRequested,
    /// A license request carried an encrypted client identification.
    MessageEncrypted,
    CertificateAccepted,
    CertificateRejected,
    InitDataLength(usize),
    PsshAtomCount(usize),
}

impl Expectation {
    /// Whether checking this requires the raw `encrypted` init data.
    pub fn needs_init_data(&self) -> bool {
        matches!(
            self,
            Expectation::InitDataLength(_) | Expectation::PsshAtomCount(_)
        )
    }
}

/// State captured when a scenario finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub diagnostics: Diagnostics,
    /// Playback position reached, in seconds.
    pub current_time: f64,
    /// Init data of the first `encrypted` signal, when it was captured.
    pub init_data: Option<Vec<u8>>,
}

/// Logger-style assertion helpers.
#[derive(Debug, Clone, Copy)]
pub struct Checker<'a> {
    test: &'a str,
}

impl<'a> Checker<'a> {
    pub fn new(test: &'a str) -> Self {
        Self { test }
    }

    pub fn assert(&self, cond: bool, msg: &str) -> std::result::Result<(), CheckFailure> {
        if cond {
            return Ok(());
        }
        Err(self.fail(msg))
    }

    /// Log and build a failure.
    pub fn fail(&self, msg: &str) -> CheckFailure {
        error!("[{}] Assert failed: {}", self.test, msg);
        CheckFailure(msg.to_string())
    }

    pub fn check_eq<T>(&self, actual: T, expected: T, name: &str) -> std::result::Result<(), CheckFailure>
    where
        T: PartialEq + fmt::Debug,
    {
        if actual == expected {
            debug!("[{}] checkEq passed: {} is ({:?}).", self.test, name, actual);
            return Ok(());
        }
        self.assert(
            false,
            &format!("{} is ({:?}) which should be ({:?})", name, actual, expected),
        )
    }

    pub fn check_ge<T>(&self, actual: T, expected: T, name: &str) -> std::result::Result<(), CheckFailure>
    where
        T: PartialOrd + fmt::Debug,
    {
        if actual >= expected {
            debug!("[{}] checkGE passed: {} is ({:?}).", self.test, name, actual);
            return Ok(());
        }
        self.assert(
            false,
            &format!("{} is ({:?}) which should be >= ({:?})", name, actual, expected),
        )
    }
}

/// One conformance test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestDefinition {
    pub id: String,
    pub name: String,
    pub category: String,
    pub mandatory: bool,
    pub title: String,
    pub key_system: KeySystem,
    /// Encrypted streams appended, one `encrypted` signal each.
    pub streams: usize,
    pub keys_per_stream: usize,
    pub license_delay: Option<Duration>,
    pub certificate_src: Option<String>,
    pub expectations: Vec<Expectation>,
}

impl TestDefinition {
    fn new(
        id: &str,
        name: impl Into<String>,
        category: impl Into<String>,
        mandatory: bool,
        key_system: KeySystem,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.into(),
            category: category.into(),
            mandatory,
            title: String::new(),
            key_system,
            streams: 1,
            keys_per_stream: 1,
            license_delay: None,
            certificate_src: None,
            expectations: Vec::new(),
        }
    }

    fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    fn expecting(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    /// Whether the test replaces the manager's `encrypted` handling to
    /// inspect init data.
    pub fn inspects_init_data(&self) -> bool {
        self.expectations.iter().any(Expectation::needs_init_data)
    }

    /// Check every expectation, stopping at the first failure.
    pub fn evaluate(&self, observation: &Observation) -> std::result::Result<(), CheckFailure> {
        let check = Checker::new(&self.name);
        let diagnostics = &observation.diagnostics;
        for expectation in &self.expectations {
            match expectation {
                Expectation::PlaybackReached {
                    seconds,
                    keys_usable,
                } => {
                    if *keys_usable {
                        check.assert(!diagnostics.key_unusable, "A key became unusable")?;
                    }
                    check.check_ge(observation.current_time, *seconds, "currentTime")?;
                }
                Expectation::KeySessionCount(n) => {
                    check.check_eq(diagnostics.key_session_count, *n, "keySessionCount")?
                }
                Expectation::KeyCount(n) => check.check_eq(diagnostics.key_count, *n, "keyCount")?,
                Expectation::CertificateRequested => check.assert(
                    diagnostics.server_certificate_requested,
                    "No certificate request generated by client",
                )?,
                Expectation::MessageEncrypted => {
                    check.assert(diagnostics.message_encrypted, "Message is not encrypted")?
                }
                Expectation::CertificateAccepted => check.assert(
                    diagnostics.set_server_certificate_result.is_empty(),
                    &diagnostics.set_server_certificate_result,
                )?,
                Expectation::CertificateRejected => check.assert(
                    !diagnostics.set_server_certificate_result.is_empty(),
                    "setServerCertificate() succeeded with invalid certificate",
                )?,
                Expectation::InitDataLength(n) => {
                    let init_data = required_init_data(&check, observation)?;
                    check.check_eq(init_data.len(), *n, "Length of initData")?;
                }
                Expectation::PsshAtomCount(n) => {
                    let init_data = required_init_data(&check, observation)?;
                    check.check_eq(count_pssh_atoms(init_data), *n, "Number of pssh atoms")?;
                }
            }
        }
        info!("[{}] {} passed", self.id, self.name);
        Ok(())
    }
}

fn required_init_data<'o>(
    check: &Checker<'_>,
    observation: &'o Observation,
) -> std::result::Result<&'o [u8], CheckFailure> {
    match observation.init_data.as_deref() {
        Some(init_data) => Ok(init_data),
        None => Err(check.fail("No encrypted event was observed")),
    }
}

/// Path of a bundled server certificate.
pub fn certificate_path(name: &str) -> String {
    format!("media/certificates/{}", name)
}

/// Ordered collection of test definitions with unique ids.
#[derive(Debug, Clone, Default)]
pub struct TestRegistry {
    tests: Vec<TestDefinition>,
    ids: HashSet<String>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, test: TestDefinition) -> Result<()> {
        if !self.ids.insert(test.id.clone()) {
            return Err(Error::Other(format!("Duplicate test id '{}'", test.id)));
        }
        self.tests.push(test);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TestDefinition> {
        self.tests.iter().find(|t| t.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestDefinition> {
        self.tests.iter()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// The EME conformance suite.
    pub fn eme_suite() -> Result<Self> {
        use EncryptedStream as S;

        let mut registry = Self::new();
        let widevine = KeySystem::Widevine;
        let playready = KeySystem::PlayReady;

        registry.register(encrypted_codec_test("3.1.1.1", S::H264_VIDEO, widevine, true, ""))?;
        registry.register(encrypted_codec_test("3.1.2.1", S::AAC_AUDIO, widevine, true, ""))?;
        registry.register(encrypted_codec_test("3.1.3.1", S::OPUS_AUDIO, widevine, true, ""))?;
        registry.register(encrypted_codec_test("3.1.4.1", S::VP9_VIDEO, widevine, true, ""))?;
        registry.register(encrypted_codec_test(
            "3.1.5.1",
            S::VP9_VIDEO,
            widevine,
            true,
            "Subsample",
        ))?;
        registry.register(multi_session_test())?;
        registry.register(license_delay_test("3.1.7.1", S::H264_VIDEO))?;
        registry.register(license_delay_test("3.1.8.1", S::VP9_VIDEO))?;
        registry.register(
            certificate_test("3.1.9.1", "CertificateRequestByClient", None)
                .expecting(Expectation::CertificateRequested)
                .expecting(Expectation::MessageEncrypted),
        )?;
        registry.register(
            certificate_test(
                "3.1.10.1",
                "setServerCertificate",
                Some(certificate_path("valid_widevine_cert.bin")),
            )
            .expecting(Expectation::CertificateAccepted)
            .expecting(Expectation::MessageEncrypted),
        )?;
        registry.register(
            certificate_test(
                "3.1.11.1",
                "setServerCertificateWithInvalidCert",
                Some(certificate_path("invalid_widevine_cert.bin")),
            )
            .expecting(Expectation::CertificateRejected),
        )?;
        registry.register(encrypted_codec_test("3.2.1.1", S::H264_VIDEO, playready, false, ""))?;
        registry.register(encrypted_codec_test("3.2.2.1", S::AAC_AUDIO, playready, false, ""))?;
        registry.register(encrypted_event_data_test())?;
        registry.register(media_element_source_test("3.4.1.1", S::H264_VIDEO))?;
        registry.register(media_element_source_test("3.4.2.1", S::AAC_AUDIO))?;
        registry.register(media_element_source_test("3.4.3.1", S::OPUS_AUDIO))?;
        registry.register(media_element_source_test("3.4.4.1", S::VP9_VIDEO))?;
        Ok(registry)
    }
}

fn encrypted_codec_test(
    id: &str,
    stream: EncryptedStream,
    key_system: KeySystem,
    mandatory: bool,
    desc: &str,
) -> TestDefinition {
    let title = key_system.title();
    let category = if mandatory {
        title.to_string()
    } else {
        format!("{} (Optional)", title)
    };
    TestDefinition::new(
        id,
        format!("{}{}{}{}", title, stream.codec, desc, stream.media_type.title()),
        category,
        mandatory,
        key_system,
    )
    .title(format!(
        "Test if we can play {} encrypted with {} encryption.",
        stream.media_type, title
    ))
    .expecting(Expectation::PlaybackReached {
        seconds: PLAYBACK_SECONDS,
        keys_usable: true,
    })
}

fn multi_session_test() -> TestDefinition {
    let mut test = TestDefinition::new(
        "3.1.6.1",
        "WidevineH264MultiMediaKeySessions",
        "Widevine",
        true,
        KeySystem::Widevine,
    )
    .title(
        "Test creating 16 MediaKeySession objects each with 16 keys for \
         playing encrypted with Widevine encryption.",
    )
    .expecting(Expectation::PlaybackReached {
        seconds: PLAYBACK_SECONDS,
        keys_usable: true,
    })
    .expecting(Expectation::KeySessionCount(16))
    .expecting(Expectation::KeyCount(256));
    test.streams = 16;
    test.keys_per_stream = 16;
    test
}

fn license_delay_test(id: &str, stream: EncryptedStream) -> TestDefinition {
    let mut test = TestDefinition::new(
        id,
        format!("WidevineLicenseDelay{}Video", stream.codec),
        "Widevine",
        true,
        KeySystem::Widevine,
    )
    .title(
        "Test if we can play video encrypted with Widevine encryption \
         with no clear start and 5 seconds license delay.",
    )
    .expecting(Expectation::PlaybackReached {
        seconds: PLAYBACK_SECONDS,
        keys_usable: true,
    });
    test.license_delay = Some(LONG_LICENSE_DELAY);
    test
}

fn certificate_test(id: &str, name: &str, certificate_src: Option<String>) -> TestDefinition {
    let mut test = TestDefinition::new(id, name, "Widevine", true, KeySystem::Widevine)
        .title("Test support for setServerCertificate")
        .expecting(Expectation::PlaybackReached {
            seconds: SHORT_PLAYBACK_SECONDS,
            keys_usable: false,
        });
    test.certificate_src = certificate_src;
    test
}

fn encrypted_event_data_test() -> TestDefinition {
    TestDefinition::new(
        "3.3.1.1",
        "EncryptedEventData",
        "General",
        true,
        KeySystem::Widevine,
    )
    .title(
        "Test encrypted event data contains all expected pssh atoms in the \
         initData and a null keySystem.",
    )
    .expecting(Expectation::InitDataLength(856))
    .expecting(Expectation::PsshAtomCount(3))
}

fn media_element_source_test(id: &str, stream: EncryptedStream) -> TestDefinition {
    TestDefinition::new(
        id,
        format!(
            "Widevine{}{}CreateMediaElementSource",
            stream.codec,
            stream.media_type.title()
        ),
        "Web Audio API (Optional)",
        false,
        KeySystem::Widevine,
    )
    .title(format!(
        "Test if AudioContext#createMediaElementSource succeeds and sends audio data for {}",
        stream.codec
    ))
    .expecting(Expectation::PlaybackReached {
        seconds: SHORT_PLAYBACK_SECONDS,
        keys_usable: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite() -> TestRegistry {
        TestRegistry::eme_suite().expect("suite")
    }

    fn playing(diagnostics: Diagnostics) -> Observation {
        Observation {
            diagnostics,
            current_time: PLAYBACK_SECONDS,
            init_data: None,
        }
    }

    #[test]
    fn suite_ids_and_names() {
        let suite = suite();
        assert_eq!(suite.len(), 18);

        let ids: Vec<_> = suite.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"3.1.1.1"));
        assert_eq!(ids.last(), Some(&"3.4.4.1"));

        assert_eq!(suite.get("3.1.1.1").expect("test").name, "WidevineH264Video");
        assert_eq!(suite.get("3.1.5.1").expect("test").name, "WidevineVP9SubsampleVideo");
        assert_eq!(suite.get("3.1.8.1").expect("test").name, "WidevineLicenseDelayVP9Video");
        assert_eq!(
            suite.get("3.4.3.1").expect("test").name,
            "WidevineOpusAudioCreateMediaElementSource"
        );

        let playready = suite.get("3.2.2.1").expect("test");
        assert_eq!(playready.name, "PlayreadyAACAudio");
        assert_eq!(playready.category, "Playready (Optional)");
        assert!(!playready.mandatory);
        assert_eq!(playready.key_system, KeySystem::PlayReady);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = TestRegistry::new();
        registry.register(encrypted_event_data_test()).expect("first");
        assert!(registry.register(encrypted_event_data_test()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn multi_session_test_checks_counts() {
        let suite = suite();
        let test = suite.get("3.1.6.1").expect("test");
        assert_eq!(test.streams, 16);

        let passing = Diagnostics {
            key_count: 256,
            key_session_count: 16,
            ..Diagnostics::default()
        };
        assert!(test.evaluate(&playing(passing.clone())).is_ok());

        let failure = test
            .evaluate(&playing(Diagnostics {
                key_count: 255,
                ..passing
            }))
            .expect_err("short key count");
        assert_eq!(failure.0, "keyCount is (255) which should be (256)");
    }

    #[test]
    fn playback_requires_usable_keys() {
        let suite = suite();
        let test = suite.get("3.1.1.1").expect("test");
        let unusable = Diagnostics {
            key_unusable: true,
            ..Diagnostics::default()
        };
        assert!(test.evaluate(&playing(unusable)).is_err());

        let stalled = Observation {
            current_time: 3.0,
            ..Observation::default()
        };
        let failure = test.evaluate(&stalled).expect_err("stalled");
        assert!(failure.0.starts_with("currentTime"));
    }

    #[test]
    fn certificate_tests_read_provisioning_result() {
        let suite = suite();
        let valid = suite.get("3.1.10.1").expect("test");
        let invalid = suite.get("3.1.11.1").expect("test");
        assert_eq!(
            valid.certificate_src.as_deref(),
            Some("media/certificates/valid_widevine_cert.bin")
        );

        let rejected = Diagnostics {
            set_server_certificate_result: "setServerCertificate rejected bad".to_string(),
            message_encrypted: true,
            ..Diagnostics::default()
        };
        assert!(invalid.evaluate(&playing(rejected.clone())).is_ok());
        let failure = valid.evaluate(&playing(rejected)).expect_err("rejected");
        assert_eq!(failure.0, "setServerCertificate rejected bad");
    }

    #[test]
    fn encrypted_event_data_inspects_init_data() {
        let suite = suite();
        let test = suite.get("3.3.1.1").expect("test");
        assert!(test.inspects_init_data());
        assert!(!suite.get("3.1.1.1").expect("test").inspects_init_data());

        let missing = test.evaluate(&Observation::default()).expect_err("missing");
        assert_eq!(missing.0, "No encrypted event was observed");

        let short = Observation {
            init_data: Some(vec![0; 10]),
            ..Observation::default()
        };
        let failure = test.evaluate(&short).expect_err("short");
        assert_eq!(failure.0, "Length of initData is (10) which should be (856)");
    }

    #[test]
    fn checker_messages() {
        let check = Checker::new("example");
        assert!(check.check_ge(15.5, 15.0, "currentTime").is_ok());
        assert_eq!(
            check.check_ge(2, 3, "count").expect_err("less"),
            CheckFailure("count is (2) which should be >= (3)".to_string())
        );
        assert_eq!(
            check.assert(false, "boom").expect_err("assert").to_string(),
            "Assert: boom"
        );
    }
}
