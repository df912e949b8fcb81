//! In-memory encrypted-media host.
//!
//! Implements every [`crate::host`] trait without a browser or CDM: sessions
//! answer `generateRequest` with a license request built from the wire
//! schema, install keys when updated, and every native call lands in a
//! shared [`CallLog`]. Used by the manager tests and the `simulate` CLI
//! command.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use prost::Message as _;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::classify::{MessageType, SERVICE_CERTIFICATE_CHALLENGE};
use crate::config::{KeySystemConfig, ManagerConfig};
use crate::conformance::{Observation, TestDefinition};
use crate::error::{Error, HostError, Result};
use crate::host::{
    CapabilityQuery, EmeHost, EncryptedEvent, HostResult, MediaKeySession, MediaKeySystemAccess,
    MediaKeys, NewSession, PlaybackTarget, SessionEvent,
};
use crate::key::{KeyId, KeyStatus};
use crate::license::{KeySystem, LicenseBackend, Responder};
use crate::manager::{Diagnostics, EmeSessionManager};
use crate::pssh::{Pssh, SystemId};
use crate::wire_protocol::message::MessageId;
use crate::wire_protocol::{LicenseRequest, Message};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What a simulated session sends after `generateRequest`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A license request with a clear client identification.
    #[default]
    Clear,
    /// A license request with an encrypted client identification.
    Encrypted,
    /// A service certificate request; the first update is taken as the
    /// certificate and answered with an encrypted license request.
    CertificateFirst,
}

/// How `setServerCertificate` resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateBehavior {
    #[default]
    Accept,
    /// Resolve with `false`.
    Refuse,
    /// Reject the promise.
    Reject,
}

/// Behavior of the simulated host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimConfig {
    /// Expose the capability query (false models an insecure context).
    #[serde(default = "default_true")]
    pub capability_query: bool,
    #[serde(default = "default_key_systems")]
    pub supported_key_systems: Vec<String>,
    #[serde(default = "default_true")]
    pub server_certificate_supported: bool,
    #[serde(default)]
    pub certificate: CertificateBehavior,
    #[serde(default)]
    pub certificate_fetch_fails: bool,
    #[serde(default)]
    pub request_kind: RequestKind,
    /// Send an individualization request before the license request.
    #[serde(default)]
    pub individualization: bool,
    #[serde(default = "default_keys_per_session")]
    pub keys_per_session: usize,
    /// Statuses assigned to keys in order; missing entries are `usable`.
    #[serde(default)]
    pub key_statuses: Vec<KeyStatus>,
    #[serde(default)]
    pub fail_session_create: bool,
    #[serde(default)]
    pub fail_generate_request: bool,
    #[serde(default)]
    pub fail_update: bool,
    #[serde(default)]
    pub fail_close: bool,
}

fn default_true() -> bool {
    true
}

fn default_key_systems() -> Vec<String> {
    vec![KeySystem::Widevine.id().to_string()]
}

fn default_keys_per_session() -> usize {
    1
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capability_query: true,
            supported_key_systems: default_key_systems(),
            server_certificate_supported: true,
            certificate: CertificateBehavior::default(),
            certificate_fetch_fails: false,
            request_kind: RequestKind::default(),
            individualization: false,
            keys_per_session: default_keys_per_session(),
            key_statuses: Vec::new(),
            fail_session_create: false,
            fail_generate_request: false,
            fail_update: false,
            fail_close: false,
        }
    }
}

/// A native call made against the simulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    RequestAccess { key_system: String },
    CreateMediaKeys,
    SetMediaKeys,
    FetchCertificate { src: String },
    SetServerCertificate { len: usize },
    CreateSession { session_id: String },
    GenerateRequest {
        session_id: String,
        init_data_type: String,
        init_data: Vec<u8>,
    },
    MessageSent {
        session_id: String,
        message_type: MessageType,
    },
    Update { session_id: String, response: Vec<u8> },
    Close { session_id: String },
}

/// A logged call and when it happened.
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub kind: CallKind,
}

/// Shared, ordered record of native calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    fn push(&self, kind: CallKind) {
        lock(&self.calls).push(Call {
            at: Instant::now(),
            kind,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Calls matching `filter`, in order.
    pub fn matching(&self, filter: impl Fn(&CallKind) -> bool) -> Vec<Call> {
        lock(&self.calls)
            .iter()
            .filter(|c| filter(&c.kind))
            .cloned()
            .collect()
    }

    pub fn count(&self, filter: impl Fn(&CallKind) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| filter(&c.kind)).count()
    }

    /// Session ids in the order they were closed.
    pub fn close_order(&self) -> Vec<String> {
        self.matching(|k| matches!(k, CallKind::Close { .. }))
            .into_iter()
            .filter_map(|c| match c.kind {
                CallKind::Close { session_id } => Some(session_id),
                _ => None,
            })
            .collect()
    }

    /// Poll until `filter` matches at least `n` calls, or `timeout` elapses.
    pub async fn wait_for(
        &self,
        n: usize,
        timeout: Duration,
        filter: impl Fn(&CallKind) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(&filter) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// A license request whose client identification is sent in the clear.
pub fn clear_license_request() -> Vec<u8> {
    license_request_message(LicenseRequest {
        request_info: Some(b"sim-client-identification".to_vec()),
        request_id: None,
    })
}

/// A license request carrying only an encrypted client identification.
pub fn encrypted_license_request() -> Vec<u8> {
    license_request_message(LicenseRequest {
        request_info: None,
        request_id: Some(b"sim-encrypted-client-identification".to_vec()),
    })
}

fn license_request_message(request: LicenseRequest) -> Vec<u8> {
    Message {
        id: Some(MessageId::LicenseRequest as i32),
        msg: Some(request.encode_to_vec()),
    }
    .encode_to_vec()
}

/// Simulated host: capability query plus certificate fetching.
#[derive(Debug)]
pub struct SimHost {
    config: SimConfig,
    log: CallLog,
    sessions_created: Arc<AtomicU32>,
}

impl SimHost {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            log: CallLog::default(),
            sessions_created: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// A playback target sharing this host's call log.
    pub fn playback_target(&self) -> Arc<SimPlaybackTarget> {
        Arc::new(SimPlaybackTarget {
            log: self.log.clone(),
            media_keys: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EmeHost for SimHost {
    fn capability_query(&self) -> Option<Arc<dyn CapabilityQuery>> {
        if !self.config.capability_query {
            return None;
        }
        Some(Arc::new(SimCapabilityQuery {
            config: self.config.clone(),
            log: self.log.clone(),
            sessions_created: Arc::clone(&self.sessions_created),
        }))
    }

    async fn fetch_certificate(&self, src: &str) -> HostResult<Vec<u8>> {
        self.log.push(CallKind::FetchCertificate {
            src: src.to_string(),
        });
        if self.config.certificate_fetch_fails {
            return Err(HostError::new(format!("GET {} returned 404", src)));
        }
        Ok(format!("certificate:{}", src).into_bytes())
    }
}

struct SimCapabilityQuery {
    config: SimConfig,
    log: CallLog,
    sessions_created: Arc<AtomicU32>,
}

#[async_trait]
impl CapabilityQuery for SimCapabilityQuery {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configs: &[KeySystemConfig],
    ) -> HostResult<Arc<dyn MediaKeySystemAccess>> {
        self.log.push(CallKind::RequestAccess {
            key_system: key_system.to_string(),
        });
        if !self.config.supported_key_systems.iter().any(|k| k == key_system) {
            return Err(HostError::new("NotSupportedError: Unsupported keySystem"));
        }
        if configs.is_empty() {
            return Err(HostError::new("TypeError: empty configuration list"));
        }
        Ok(Arc::new(SimAccess {
            key_system: key_system.to_string(),
            config: self.config.clone(),
            log: self.log.clone(),
            sessions_created: Arc::clone(&self.sessions_created),
        }))
    }
}

struct SimAccess {
    key_system: String,
    config: SimConfig,
    log: CallLog,
    sessions_created: Arc<AtomicU32>,
}

#[async_trait]
impl MediaKeySystemAccess for SimAccess {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    async fn create_media_keys(&self) -> HostResult<Arc<dyn MediaKeys>> {
        self.log.push(CallKind::CreateMediaKeys);
        Ok(Arc::new(SimMediaKeys {
            config: self.config.clone(),
            log: self.log.clone(),
            sessions_created: Arc::clone(&self.sessions_created),
        }))
    }
}

struct SimMediaKeys {
    config: SimConfig,
    log: CallLog,
    sessions_created: Arc<AtomicU32>,
}

#[async_trait]
impl MediaKeys for SimMediaKeys {
    fn supports_server_certificate(&self) -> bool {
        self.config.server_certificate_supported
    }

    async fn set_server_certificate(&self, certificate: &[u8]) -> HostResult<bool> {
        self.log.push(CallKind::SetServerCertificate {
            len: certificate.len(),
        });
        match self.config.certificate {
            CertificateBehavior::Accept => Ok(true),
            CertificateBehavior::Refuse => Ok(false),
            CertificateBehavior::Reject => {
                Err(HostError::new("InvalidAccessError: invalid certificate"))
            }
        }
    }

    async fn create_session(&self) -> HostResult<NewSession> {
        if self.config.fail_session_create {
            return Err(HostError::new("InvalidStateError: CDM unavailable"));
        }
        let number = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("sim-session-{}", number);
        self.log.push(CallKind::CreateSession {
            session_id: session_id.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let session = SimSession {
            session_id,
            number,
            config: self.config.clone(),
            log: self.log.clone(),
            events: Mutex::new(Some(tx)),
            state: Mutex::new(SimSessionState::default()),
        };
        Ok(NewSession {
            session: Arc::new(session),
            events: rx,
        })
    }
}

#[derive(Default)]
struct SimSessionState {
    awaiting_certificate: bool,
    keys: BTreeMap<KeyId, KeyStatus>,
}

struct SimSession {
    session_id: String,
    number: u32,
    config: SimConfig,
    log: CallLog,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    state: Mutex<SimSessionState>,
}

impl SimSession {
    fn emit(&self, event: SessionEvent) {
        if let SessionEvent::Message { message_type, .. } = &event {
            self.log.push(CallKind::MessageSent {
                session_id: self.session_id.clone(),
                message_type: *message_type,
            });
        }
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn emit_message(&self, message_type: MessageType, message: Vec<u8>) {
        self.emit(SessionEvent::Message {
            message_type,
            message,
        });
    }

    fn install_keys(&self) {
        {
            let mut state = lock(&self.state);
            for i in 0..self.config.keys_per_session {
                let mut kid = [0u8; 16];
                kid[..4].copy_from_slice(&self.number.to_be_bytes());
                kid[12..].copy_from_slice(&(i as u32).to_be_bytes());
                let status = self
                    .config
                    .key_statuses
                    .get(i)
                    .copied()
                    .unwrap_or(KeyStatus::Usable);
                state.keys.insert(KeyId::new(kid.to_vec()), status);
            }
        }
        self.emit(SessionEvent::KeyStatusesChange);
    }
}

#[async_trait]
impl MediaKeySession for SimSession {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    async fn generate_request(&self, init_data_type: &str, init_data: &[u8]) -> HostResult<()> {
        self.log.push(CallKind::GenerateRequest {
            session_id: self.session_id.clone(),
            init_data_type: init_data_type.to_string(),
            init_data: init_data.to_vec(),
        });
        if self.config.fail_generate_request {
            return Err(HostError::new("NotSupportedError: unsupported init data"));
        }

        if self.config.individualization {
            self.emit_message(MessageType::IndividualizationRequest, b"individualize".to_vec());
        }
        match self.config.request_kind {
            RequestKind::Clear => {
                self.emit_message(MessageType::LicenseRequest, clear_license_request())
            }
            RequestKind::Encrypted => {
                self.emit_message(MessageType::LicenseRequest, encrypted_license_request())
            }
            RequestKind::CertificateFirst => {
                lock(&self.state).awaiting_certificate = true;
                self.emit_message(
                    MessageType::LicenseRequest,
                    SERVICE_CERTIFICATE_CHALLENGE.to_vec(),
                );
            }
        }
        Ok(())
    }

    async fn update(&self, response: &[u8]) -> HostResult<()> {
        self.log.push(CallKind::Update {
            session_id: self.session_id.clone(),
            response: response.to_vec(),
        });
        if self.config.fail_update {
            return Err(HostError::new("TypeError: invalid license"));
        }

        let awaiting_certificate =
            std::mem::take(&mut lock(&self.state).awaiting_certificate);
        if awaiting_certificate {
            self.emit_message(MessageType::LicenseRequest, encrypted_license_request());
        } else {
            self.install_keys();
        }
        Ok(())
    }

    async fn close(&self) -> HostResult<()> {
        self.log.push(CallKind::Close {
            session_id: self.session_id.clone(),
        });
        lock(&self.events).take();
        if self.config.fail_close {
            return Err(HostError::new("InvalidStateError: session already closed"));
        }
        Ok(())
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        lock(&self.state)
            .keys
            .iter()
            .map(|(k, s)| (k.clone(), *s))
            .collect()
    }
}

/// Simulated media element.
pub struct SimPlaybackTarget {
    log: CallLog,
    media_keys: Mutex<Option<Arc<dyn MediaKeys>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EncryptedEvent>>>,
}

impl SimPlaybackTarget {
    /// Deliver an `encrypted` signal to every subscriber.
    pub fn fire_encrypted(&self, event: EncryptedEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl PlaybackTarget for SimPlaybackTarget {
    fn media_keys(&self) -> Option<Arc<dyn MediaKeys>> {
        lock(&self.media_keys).clone()
    }

    async fn set_media_keys(&self, media_keys: Arc<dyn MediaKeys>) -> HostResult<()> {
        self.log.push(CallKind::SetMediaKeys);
        *lock(&self.media_keys) = Some(media_keys);
        Ok(())
    }

    fn encrypted_events(&self) -> mpsc::UnboundedReceiver<EncryptedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}

/// Backend that answers every request with the same bytes.
pub struct FixedResponseBackend {
    key_system: String,
    response: Vec<u8>,
    external_init_data: Option<Vec<u8>>,
    received: Mutex<Vec<(MessageType, Vec<u8>)>>,
}

impl FixedResponseBackend {
    pub fn new(key_system: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        Self {
            key_system: key_system.into(),
            response: response.into(),
            external_init_data: None,
            received: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_external_init_data(mut self, init_data: impl Into<Vec<u8>>) -> Self {
        self.external_init_data = Some(init_data.into());
        self
    }

    /// Messages routed to this backend, in arrival order.
    pub fn received(&self) -> Vec<(MessageType, Vec<u8>)> {
        lock(&self.received).clone()
    }
}

impl LicenseBackend for FixedResponseBackend {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    fn make_key_system_config(&self) -> Vec<KeySystemConfig> {
        vec![KeySystemConfig::for_content_types(
            Some("video/mp4; codecs=\"avc1.4d401e\""),
            Some("audio/mp4; codecs=\"mp4a.40.2\""),
        )]
    }

    fn external_init_data(&self) -> Option<Vec<u8>> {
        self.external_init_data.clone()
    }

    fn request_individualization(&self, message: Vec<u8>, respond: Responder) {
        lock(&self.received).push((MessageType::IndividualizationRequest, message));
        respond.respond(self.response.clone());
    }

    fn acquire_license(&self, message: Vec<u8>, respond: Responder) {
        lock(&self.received).push((MessageType::LicenseRequest, message));
        respond.respond(self.response.clone());
    }
}

/// Everything the `simulate` command needs, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub host: SimConfig,
    /// Key system to request; defaults to Widevine.
    #[serde(default)]
    pub key_system: Option<String>,
    /// Number of `encrypted` signals to fire.
    #[serde(default = "default_streams")]
    pub streams: usize,
    #[serde(default = "default_init_data_type")]
    pub init_data_type: String,
    /// Base64 init data; defaults to [`sample_init_data`].
    #[serde(default)]
    pub init_data: Option<String>,
}

fn default_streams() -> usize {
    1
}

fn default_init_data_type() -> String {
    "cenc".to_string()
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            host: SimConfig::default(),
            key_system: None,
            streams: default_streams(),
            init_data_type: default_init_data_type(),
            init_data: None,
        }
    }
}

impl SimulationConfig {
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Apply the scenario parameters of a conformance test.
    pub fn apply_test(&mut self, test: &TestDefinition) {
        self.key_system = Some(test.key_system.id().to_string());
        self.streams = test.streams;
        self.host.keys_per_session = test.keys_per_stream;
        if let Some(delay) = test.license_delay {
            self.manager.license_delay_ms = delay.as_millis() as u64;
        }
        if let Some(src) = &test.certificate_src {
            self.manager.certificate_src = Some(src.clone());
        }
    }

    fn init_data(&self) -> Result<Vec<u8>> {
        match &self.init_data {
            Some(b64) => Ok(base64::engine::general_purpose::STANDARD.decode(b64.trim())?),
            None => sample_init_data(),
        }
    }
}

/// License bytes returned by the simulated license server.
pub const SIMULATED_LICENSE: &[u8] = b"simulated-license";

/// Playback position reported once every stream has usable keys.
pub const SIMULATED_PLAYBACK_SECONDS: f64 = 30.0;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// `cenc` init data with Widevine, PlayReady and ClearKey boxes, 856 bytes
/// in total like the reference H.264 CENC stream.
pub fn sample_init_data() -> Result<Vec<u8>> {
    let kid = Uuid::from_u128(0xeb676abbcb345e96bbcf616630f1a3da);

    let mut widevine_data = vec![0x08, 0x01, 0x12, 0x10];
    widevine_data.extend_from_slice(kid.as_bytes());
    let widevine = Pssh::new(SystemId::Widevine.to_uuid(), Vec::new(), widevine_data, 0, 0)?;
    let playready = Pssh::new(
        SystemId::PlayReady.to_uuid(),
        Vec::new(),
        playready_object(720),
        0,
        0,
    )?;
    let clearkey = Pssh::new(SystemId::ClearKey.to_uuid(), vec![kid], Vec::new(), 1, 0)?;

    let mut data = widevine.to_bytes();
    data.extend_from_slice(&playready.to_bytes());
    data.extend_from_slice(&clearkey.to_bytes());
    Ok(data)
}

/// PlayReady object of exactly `len` bytes holding one header record.
fn playready_object(len: usize) -> Vec<u8> {
    const PREFIX: &str = "<WRMHEADER xmlns=\"http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader\" \
                          version=\"4.0.0.0\"><DATA><KID>u2pn6zTLll67z2FmMPGj2g==</KID>";
    const SUFFIX: &str = "</DATA></WRMHEADER>";

    let record_len = len.saturating_sub(10);
    let mut xml = String::from(PREFIX);
    while (xml.len() + SUFFIX.len()) * 2 < record_len {
        xml.push(' ');
    }
    xml.push_str(SUFFIX);

    let mut out = vec![0u8; 10];
    LittleEndian::write_u32(&mut out[0..4], len as u32);
    LittleEndian::write_u16(&mut out[4..6], 1);
    LittleEndian::write_u16(&mut out[6..8], 1);
    LittleEndian::write_u16(&mut out[8..10], record_len as u16);
    for unit in xml.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Outcome of one simulated playback attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub key_system: String,
    pub streams: usize,
    /// Pipelines that reached `Done`.
    pub sessions_started: usize,
    /// `state: error` for every halted pipeline.
    pub failures: Vec<String>,
    pub diagnostics: Diagnostics,
    pub current_time: f64,
    pub sessions_closed: usize,
    #[serde(skip)]
    pub init_data: Option<Vec<u8>>,
}

impl SimulationReport {
    /// State the conformance checks run against.
    pub fn observation(&self) -> Observation {
        Observation {
            diagnostics: self.diagnostics.clone(),
            current_time: self.current_time,
            init_data: self.init_data.clone(),
        }
    }
}

/// Play one scenario against the simulated host and tear it down.
///
/// Fires `streams` `encrypted` signals, waits for every pipeline and license
/// exchange to settle, snapshots the manager, then closes all sessions.
pub async fn run_simulation(config: &SimulationConfig, inspect_init_data: bool) -> Result<SimulationReport> {
    let key_system = config
        .key_system
        .clone()
        .unwrap_or_else(|| KeySystem::Widevine.id().to_string());
    let init_data = config.init_data()?;

    let host = SimHost::new(config.host.clone());
    let target = host.playback_target();
    let backend = Arc::new(FixedResponseBackend::new(
        key_system.clone(),
        SIMULATED_LICENSE.to_vec(),
    ));
    let manager = EmeSessionManager::init(
        host.clone(),
        target.clone(),
        backend,
        config.manager.clone(),
    )?;
    let mut outcomes = manager
        .take_outcomes()
        .ok_or_else(|| Error::Other("Pipeline outcomes already taken".to_string()))?;

    let captured: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    if inspect_init_data {
        let captured = Arc::clone(&captured);
        manager.add_encrypted_spy(move |event| {
            lock(&captured).get_or_insert_with(|| event.init_data.clone());
        });
    }

    info!("Simulating {} encrypted stream(s) with {}", config.streams, key_system);
    for _ in 0..config.streams {
        target.fire_encrypted(EncryptedEvent::new(
            config.init_data_type.clone(),
            init_data.clone(),
        ));
    }

    let settle_deadline = Instant::now() + manager.license_delay() + SETTLE_TIMEOUT;
    let mut sessions_started = 0;
    let mut failures = Vec::new();
    if inspect_init_data {
        while lock(&captured).is_none() && Instant::now() < settle_deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    } else {
        for _ in 0..config.streams {
            let remaining = settle_deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, outcomes.recv()).await {
                Ok(Some(outcome)) => match outcome.result {
                    Ok(number) => {
                        debug!("Session #{} started", number);
                        sessions_started += 1;
                    }
                    Err(e) => failures.push(format!("{}: {}", outcome.reached, e)),
                },
                _ => {
                    failures.push("Key session bring-up did not settle".to_string());
                    break;
                }
            }
        }
    }

    let expected_keys = sessions_started * config.host.keys_per_session;
    while manager.key_count() < expected_keys && Instant::now() < settle_deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let diagnostics = manager.diagnostics();
    let playable = !inspect_init_data
        && failures.is_empty()
        && expected_keys > 0
        && diagnostics.key_count >= expected_keys
        && !diagnostics.key_unusable;
    let current_time = if playable {
        SIMULATED_PLAYBACK_SECONDS
    } else {
        0.0
    };

    manager.close_all_key_sessions().await;
    let init_data = lock(&captured).take();
    Ok(SimulationReport {
        key_system,
        streams: config.streams,
        sessions_started,
        failures,
        diagnostics,
        current_time,
        sessions_closed: host.log().close_order().len(),
        init_data,
    })
}
