//! Encrypted media session manager.
//!
//! One manager serves one playback attempt. Every `encrypted` signal from
//! the playback target starts an independent bring-up pipeline:
//!
//! 1. capability check
//! 2. media keys acquisition (created once, then reused)
//! 3. server certificate provisioning, when a certificate source is set
//! 4. session creation
//! 5. listener attachment
//! 6. license request generation
//!
//! A failure halts only its own pipeline. Sessions created before the
//! failure stay open until [`EmeSessionManager::close_all_key_sessions`].
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classify::{MessageDiagnostics, MessageType, Route};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::host::{
    EmeHost, EncryptedEvent, MediaKeySession, MediaKeySystemAccess, MediaKeys, NewSession,
    PlaybackTarget, SessionEvent,
};
use crate::key::{KeyId, KeyStatus};
use crate::license::{LicenseBackend, Responder};
use crate::session::SessionRecord;

/// Hook that replaces the default `encrypted` handling.
pub type EncryptedSpy = Arc<dyn Fn(&EncryptedEvent) + Send + Sync>;

/// Bring-up pipeline states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    CapabilityCheck,
    MediaKeysAcquire,
    CertificateProvision,
    SessionCreate,
    ListenerAttach,
    GenerateRequest,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::CapabilityCheck => "CapabilityCheck",
            PipelineState::MediaKeysAcquire => "MediaKeysAcquire",
            PipelineState::CertificateProvision => "CertificateProvision",
            PipelineState::SessionCreate => "SessionCreate",
            PipelineState::ListenerAttach => "ListenerAttach",
            PipelineState::GenerateRequest => "GenerateRequest",
            PipelineState::Done => "Done",
        };
        f.write_str(name)
    }
}

/// How one pipeline ended.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Last state entered; `Done` on success.
    pub reached: PipelineState,
    /// Number of the session created, or the error that halted the pipeline.
    pub result: Result<u32>,
}

/// Result of server certificate provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateOutcome {
    Accepted,
    /// The host resolved `setServerCertificate` with `false`.
    Refused,
    Rejected(String),
    FetchFailed(String),
    Unsupported,
}

impl CertificateOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CertificateOutcome::Accepted)
    }

    /// The error this outcome corresponds to, if it is a failure.
    pub fn to_error(&self) -> Option<Error> {
        match self {
            CertificateOutcome::Accepted => None,
            CertificateOutcome::Unsupported => Some(Error::CertificateProvisionUnsupported),
            other => Some(Error::CertificateProvisionFailed(other.to_string())),
        }
    }
}

impl fmt::Display for CertificateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateOutcome::Accepted => Ok(()),
            CertificateOutcome::Refused => f.write_str("setServerCertificate failed"),
            CertificateOutcome::Rejected(reason) => {
                write!(f, "setServerCertificate rejected {}", reason)
            }
            CertificateOutcome::FetchFailed(reason) => {
                write!(f, "server certificate fetch failed: {}", reason)
            }
            CertificateOutcome::Unsupported => f.write_str("setServerCertificate() is not supported"),
        }
    }
}

/// Observable manager state, as asserted on by conformance tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub key_count: usize,
    pub key_unusable: bool,
    pub key_session_count: usize,
    pub server_certificate_requested: bool,
    pub message_encrypted: bool,
    /// Empty unless certificate provisioning failed.
    pub set_server_certificate_result: String,
}

struct State {
    sessions: Vec<SessionRecord>,
    next_session_number: u32,
    key_count: usize,
    key_unusable: bool,
    license_delay: Duration,
    certificate_src: Option<String>,
    server_certificate_requested: bool,
    message_encrypted: bool,
    certificate_outcome: Option<CertificateOutcome>,
    encrypted_spy: Option<EncryptedSpy>,
    // Set once `take_outcomes` has been called; cleared when the receiver goes away.
    outcome_subscriber: Option<mpsc::UnboundedSender<PipelineOutcome>>,
    outcomes_taken: bool,
}

struct Inner {
    host: Arc<dyn EmeHost>,
    target: Arc<dyn PlaybackTarget>,
    backend: Arc<dyn LicenseBackend>,
    key_system: String,
    runtime: Handle,
    // Serializes check-and-bind of the target's media keys.
    acquire_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

/// Session/key lifecycle manager for one playback target.
pub struct EmeSessionManager {
    inner: Arc<Inner>,
    listener: JoinHandle<()>,
}

impl EmeSessionManager {
    /// Bind a manager to `target` and `backend` and start listening for
    /// `encrypted` signals.
    ///
    /// Must be called from within a Tokio runtime. The listener stops when
    /// the manager is dropped.
    pub fn init(
        host: Arc<dyn EmeHost>,
        target: Arc<dyn PlaybackTarget>,
        backend: Arc<dyn LicenseBackend>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let key_system = backend.key_system().to_string();
        if key_system.is_empty() {
            return Err(Error::NotInitialized);
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::Other(format!("No Tokio runtime available: {}", e)))?;

        let events = target.encrypted_events();
        let inner = Arc::new(Inner {
            host,
            target,
            backend,
            key_system,
            runtime,
            acquire_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                sessions: Vec::new(),
                next_session_number: 0,
                key_count: 0,
                key_unusable: false,
                license_delay: config.license_delay(),
                certificate_src: config.certificate_src,
                server_certificate_requested: false,
                message_encrypted: false,
                certificate_outcome: None,
                encrypted_spy: None,
                outcome_subscriber: None,
                outcomes_taken: false,
            }),
        });

        let listener = Inner::spawn_listener(Arc::clone(&inner), events);
        debug!("EME manager initialized for {}", inner.key_system);
        Ok(Self { inner, listener })
    }

    /// Key system requested from the host.
    pub fn key_system(&self) -> &str {
        &self.inner.key_system
    }

    /// Provision this certificate in pipelines that have not yet reached
    /// the certificate step.
    pub fn set_certificate_src(&self, src: impl Into<String>) {
        self.inner.lock_state().certificate_src = Some(src.into());
    }

    /// Delay applied to license responses issued from now on.
    pub fn set_license_delay(&self, delay: Duration) {
        self.inner.lock_state().license_delay = delay;
    }

    pub fn license_delay(&self) -> Duration {
        self.inner.lock_state().license_delay
    }

    /// Route `encrypted` signals to `spy` instead of starting pipelines.
    pub fn add_encrypted_spy(&self, spy: impl Fn(&EncryptedEvent) + Send + Sync + 'static) {
        self.inner.lock_state().encrypted_spy = Some(Arc::new(spy));
    }

    /// Query host support for the backend's key system.
    pub async fn check_key_system_support(&self) -> Result<Arc<dyn MediaKeySystemAccess>> {
        self.inner.check_key_system_support().await
    }

    /// Run one bring-up pipeline for `event` and wait for it to settle.
    ///
    /// Signals delivered by the playback target take this same path on
    /// their own task.
    pub async fn on_encrypted(&self, event: EncryptedEvent) -> Result<u32> {
        Pipeline::new(Arc::clone(&self.inner), event).run().await.result
    }

    /// Subscribe to the outcomes of signal-triggered pipelines.
    ///
    /// Only the first call returns `Some`. Outcomes settled before the call,
    /// or after the receiver is dropped, are only logged.
    pub fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<PipelineOutcome>> {
        let mut state = self.inner.lock_state();
        if state.outcomes_taken {
            return None;
        }
        state.outcomes_taken = true;
        let (tx, rx) = mpsc::unbounded_channel();
        state.outcome_subscriber = Some(tx);
        Some(rx)
    }

    /// Close every open session, newest first, one at a time.
    pub async fn close_all_key_sessions(&self) {
        self.inner.close_all_key_sessions().await;
    }

    /// Close every open session on a background task, then call
    /// `on_complete`.
    pub fn close_all_key_sessions_then(&self, on_complete: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            inner.close_all_key_sessions().await;
            on_complete();
        });
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.inner.lock_state();
        Diagnostics {
            key_count: state.key_count,
            key_unusable: state.key_unusable,
            key_session_count: state.sessions.len(),
            server_certificate_requested: state.server_certificate_requested,
            message_encrypted: state.message_encrypted,
            set_server_certificate_result: state
                .certificate_outcome
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock_state().key_count
    }

    pub fn key_unusable(&self) -> bool {
        self.inner.lock_state().key_unusable
    }

    pub fn key_session_count(&self) -> usize {
        self.inner.lock_state().sessions.len()
    }

    pub fn certificate_outcome(&self) -> Option<CertificateOutcome> {
        self.inner.lock_state().certificate_outcome.clone()
    }

    /// Latest key statuses observed on session `number`.
    pub fn session_key_statuses(&self, number: u32) -> Option<HashMap<KeyId, KeyStatus>> {
        self.inner
            .lock_state()
            .sessions
            .iter()
            .find(|r| r.number == number)
            .map(|r| r.observed_key_statuses.clone())
    }
}

impl Drop for EmeSessionManager {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl fmt::Debug for EmeSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmeSessionManager")
            .field("key_system", &self.inner.key_system)
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_outcome(&self, outcome: PipelineOutcome) {
        let mut state = self.lock_state();
        let delivered = match &state.outcome_subscriber {
            Some(tx) => tx.send(outcome).is_ok(),
            None => return,
        };
        if !delivered {
            trace!("Outcome receiver dropped");
            state.outcome_subscriber = None;
        }
    }

    fn spawn_listener(
        inner: Arc<Inner>,
        mut events: mpsc::UnboundedReceiver<EncryptedEvent>,
    ) -> JoinHandle<()> {
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("onEncrypted() {} bytes of {}", event.init_data.len(), event.init_data_type);
                let spy = inner.lock_state().encrypted_spy.clone();
                if let Some(spy) = spy {
                    spy(&event);
                    continue;
                }

                let pipeline = Pipeline::new(Arc::clone(&inner), event);
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let outcome = pipeline.run().await;
                    if let Err(e) = &outcome.result {
                        error!("Key session bring-up failed at {}: {}", outcome.reached, e);
                    }
                    inner.publish_outcome(outcome);
                });
            }
        })
    }

    async fn check_key_system_support(&self) -> Result<Arc<dyn MediaKeySystemAccess>> {
        let query = self
            .host
            .capability_query()
            .ok_or(Error::CapabilityQueryUnavailable)?;
        let configs = self.backend.make_key_system_config();
        query
            .request_media_key_system_access(&self.key_system, &configs)
            .await
            .map_err(|e| Error::KeySystemUnsupported {
                key_system: self.key_system.clone(),
                reason: e.to_string(),
            })
    }

    /// Reuse the target's media keys, or create and bind them.
    async fn acquire_media_keys(
        &self,
        access: &Arc<dyn MediaKeySystemAccess>,
    ) -> Result<Arc<dyn MediaKeys>> {
        let _guard = self.acquire_lock.lock().await;
        if let Some(media_keys) = self.target.media_keys() {
            trace!("Reusing bound media keys");
            return Ok(media_keys);
        }

        let media_keys = access
            .create_media_keys()
            .await
            .map_err(Error::MediaKeysUnavailable)?;
        self.target
            .set_media_keys(Arc::clone(&media_keys))
            .await
            .map_err(Error::MediaKeysUnavailable)?;
        debug!("Bound new media keys for {}", access.key_system());
        Ok(media_keys)
    }

    async fn provision_certificate(&self, media_keys: &Arc<dyn MediaKeys>, src: &str) {
        debug!("setServerCertificate() from {}", src);
        let outcome = if !media_keys.supports_server_certificate() {
            CertificateOutcome::Unsupported
        } else {
            match self.host.fetch_certificate(src).await {
                Err(e) => CertificateOutcome::FetchFailed(e.to_string()),
                Ok(certificate) => match media_keys.set_server_certificate(&certificate).await {
                    Ok(true) => CertificateOutcome::Accepted,
                    Ok(false) => CertificateOutcome::Refused,
                    Err(e) => CertificateOutcome::Rejected(e.to_string()),
                },
            }
        };

        if let Some(err) = outcome.to_error() {
            warn!("{}", err);
        }
        let mut state = self.lock_state();
        // A recorded failure is never overwritten by a later success.
        if outcome.is_failure() || state.certificate_outcome.is_none() {
            state.certificate_outcome = Some(outcome);
        }
    }

    fn register_session(&self, session: Arc<dyn MediaKeySession>) -> u32 {
        let mut state = self.lock_state();
        state.next_session_number += 1;
        let number = state.next_session_number;
        state.sessions.push(SessionRecord::new(number, session));
        number
    }

    fn spawn_session_listener(
        inner: Arc<Inner>,
        number: u32,
        session: Arc<dyn MediaKeySession>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Message {
                        message_type,
                        message,
                    } => inner.on_message(number, &session, message_type, message),
                    SessionEvent::KeyStatusesChange => inner.on_key_statuses_change(number, &session),
                }
            }
            trace!("Session #{} signal stream ended", number);
        });
    }

    fn on_message(
        &self,
        number: u32,
        session: &Arc<dyn MediaKeySession>,
        message_type: MessageType,
        message: Vec<u8>,
    ) {
        debug!("onMessage() session #{}: {}", number, message_type);
        let respond = Responder::new(
            Arc::clone(session),
            number,
            self.lock_state().license_delay,
            self.runtime.clone(),
        );

        match Route::for_message(message_type) {
            Route::Individualization => self.backend.request_individualization(message, respond),
            Route::License => {
                let diagnostics = MessageDiagnostics::inspect(&message);
                {
                    let mut state = self.lock_state();
                    state.server_certificate_requested |= diagnostics.certificate_request;
                    state.message_encrypted |= diagnostics.encrypted;
                }
                self.backend.acquire_license(message, respond);
            }
            Route::Ignore => {
                debug!("Unknown message: {}", message_type);
            }
        }
    }

    /// Re-scan every key the session reports. Keys already counted by an
    /// earlier signal are counted again.
    fn on_key_statuses_change(&self, number: u32, session: &Arc<dyn MediaKeySession>) {
        let statuses = session.key_statuses();
        debug!("onKeyStatusesChange() session #{}: {} keys", number, statuses.len());

        let mut state = self.lock_state();
        for (kid, status) in statuses.iter() {
            state.key_count += 1;
            if !status.is_usable() {
                info!("Key {} is {}", kid, status);
                state.key_unusable = true;
            }
        }
        if let Some(record) = state.sessions.iter_mut().find(|r| r.number == number) {
            record.observe(statuses.iter());
        }
    }

    async fn close_all_key_sessions(&self) {
        loop {
            let record = {
                let mut state = self.lock_state();
                match state.sessions.pop() {
                    Some(record) => record,
                    None => {
                        state.next_session_number = 0;
                        break;
                    }
                }
            };

            debug!("Closing key session #{}", record.number);
            if let Err(e) = record.session.close().await {
                let err = Error::SessionCloseFailed(e);
                warn!("Session #{}: {}", record.number, err);
            }
        }
    }
}

/// One bring-up run for one `encrypted` signal.
struct Pipeline {
    inner: Arc<Inner>,
    event: EncryptedEvent,
    state: PipelineState,
    access: Option<Arc<dyn MediaKeySystemAccess>>,
    media_keys: Option<Arc<dyn MediaKeys>>,
    created: Option<NewSession>,
    session: Option<(u32, Arc<dyn MediaKeySession>)>,
}

impl Pipeline {
    fn new(inner: Arc<Inner>, event: EncryptedEvent) -> Self {
        Self {
            inner,
            event,
            state: PipelineState::CapabilityCheck,
            access: None,
            media_keys: None,
            created: None,
            session: None,
        }
    }

    async fn run(mut self) -> PipelineOutcome {
        loop {
            trace!("Pipeline entering {}", self.state);
            match self.step().await {
                Ok(PipelineState::Done) => {
                    let number = self.session.as_ref().map(|(n, _)| *n).unwrap_or_default();
                    return PipelineOutcome {
                        reached: PipelineState::Done,
                        result: Ok(number),
                    };
                }
                Ok(next) => self.state = next,
                Err(e) => {
                    return PipelineOutcome {
                        reached: self.state,
                        result: Err(e),
                    }
                }
            }
        }
    }

    /// Execute the current state and return the next one.
    async fn step(&mut self) -> Result<PipelineState> {
        match self.state {
            PipelineState::CapabilityCheck => {
                self.access = Some(self.inner.check_key_system_support().await?);
                Ok(PipelineState::MediaKeysAcquire)
            }
            PipelineState::MediaKeysAcquire => {
                let access = self.access()?;
                self.media_keys = Some(self.inner.acquire_media_keys(&access).await?);
                if self.inner.lock_state().certificate_src.is_some() {
                    Ok(PipelineState::CertificateProvision)
                } else {
                    Ok(PipelineState::SessionCreate)
                }
            }
            PipelineState::CertificateProvision => {
                let media_keys = self.media_keys()?;
                let src = self.inner.lock_state().certificate_src.clone();
                if let Some(src) = src {
                    self.inner.provision_certificate(&media_keys, &src).await;
                }
                Ok(PipelineState::SessionCreate)
            }
            PipelineState::SessionCreate => {
                let media_keys = self.media_keys()?;
                let created = media_keys
                    .create_session()
                    .await
                    .map_err(Error::SessionCreateFailed)?;
                let number = self.inner.register_session(Arc::clone(&created.session));
                debug!("Created key session #{} ({})", number, created.session.session_id());
                self.session = Some((number, Arc::clone(&created.session)));
                self.created = Some(created);
                Ok(PipelineState::ListenerAttach)
            }
            PipelineState::ListenerAttach => {
                let created = self
                    .created
                    .take()
                    .ok_or_else(|| Error::Other("No session to attach to".to_string()))?;
                let (number, _) = self.session()?;
                Inner::spawn_session_listener(
                    Arc::clone(&self.inner),
                    number,
                    created.session,
                    created.events,
                );
                Ok(PipelineState::GenerateRequest)
            }
            PipelineState::GenerateRequest => {
                let (number, session) = self.session()?;
                let init_data = self
                    .inner
                    .backend
                    .external_init_data()
                    .unwrap_or_else(|| self.event.init_data.clone());
                session
                    .generate_request(&self.event.init_data_type, &init_data)
                    .await
                    .map_err(Error::GenerateRequestFailed)?;
                debug!("Session #{} generated a {} request", number, self.event.init_data_type);
                Ok(PipelineState::Done)
            }
            PipelineState::Done => Ok(PipelineState::Done),
        }
    }

    fn access(&self) -> Result<Arc<dyn MediaKeySystemAccess>> {
        self.access
            .clone()
            .ok_or_else(|| Error::Other("Capability check has not run".to_string()))
    }

    fn media_keys(&self) -> Result<Arc<dyn MediaKeys>> {
        self.media_keys
            .clone()
            .ok_or_else(|| Error::Other("Media keys have not been acquired".to_string()))
    }

    fn session(&self) -> Result<(u32, Arc<dyn MediaKeySession>)> {
        self.session
            .clone()
            .ok_or_else(|| Error::Other("No key session has been created".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::classify::SERVICE_CERTIFICATE_CHALLENGE;
    use crate::license::KeySystem;
    use crate::sim::{
        CallKind, CertificateBehavior, FixedResponseBackend, RequestKind, SimConfig, SimHost,
        SimPlaybackTarget,
    };

    const RESPONSE: [u8; 16] = *b"sixteen-byte-lic";
    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        host: Arc<SimHost>,
        target: Arc<SimPlaybackTarget>,
        backend: Arc<FixedResponseBackend>,
        manager: EmeSessionManager,
    }

    fn fixture_with(config: SimConfig, backend: FixedResponseBackend) -> Fixture {
        let host = SimHost::new(config);
        let target = host.playback_target();
        let backend = Arc::new(backend);
        let manager = EmeSessionManager::init(
            host.clone(),
            target.clone(),
            backend.clone(),
            ManagerConfig::default(),
        )
        .expect("init manager");
        Fixture {
            host,
            target,
            backend,
            manager,
        }
    }

    fn fixture(config: SimConfig) -> Fixture {
        fixture_with(
            config,
            FixedResponseBackend::new(KeySystem::Widevine.id(), RESPONSE.to_vec()),
        )
    }

    fn encrypted(len: usize) -> EncryptedEvent {
        EncryptedEvent::new("cenc", vec![0x42; len])
    }

    /// Poll `cond` until it holds or [`WAIT`] elapses.
    async fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cond()
    }

    async fn settle(
        outcomes: &mut mpsc::UnboundedReceiver<PipelineOutcome>,
        n: usize,
    ) -> Vec<PipelineOutcome> {
        let mut settled = Vec::new();
        for _ in 0..n {
            let outcome = tokio::time::timeout(WAIT, outcomes.recv())
                .await
                .expect("pipeline settled")
                .expect("outcome channel open");
            settled.push(outcome);
        }
        settled
    }

    #[tokio::test]
    async fn empty_key_system_is_not_initialized() {
        let host = SimHost::new(SimConfig::default());
        let target = host.playback_target();
        let backend = Arc::new(FixedResponseBackend::new("", RESPONSE.to_vec()));
        let err = EmeSessionManager::init(host, target, backend, ManagerConfig::default())
            .expect_err("no key system");
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn round_trip_delivers_response_after_delay() {
        let f = fixture(SimConfig::default());
        let mut outcomes = f.manager.take_outcomes().expect("outcomes");
        f.target.fire_encrypted(encrypted(32));

        let settled = settle(&mut outcomes, 1).await;
        assert_eq!(settled[0].reached, PipelineState::Done);
        assert_eq!(settled[0].result.as_ref().ok(), Some(&1));

        let log = f.host.log();
        assert!(log.wait_for(1, WAIT, |k| matches!(k, CallKind::Update { .. })).await);

        let generated = log.matching(|k| matches!(k, CallKind::GenerateRequest { .. }));
        assert_eq!(generated.len(), 1);
        match &generated[0].kind {
            CallKind::GenerateRequest {
                init_data_type,
                init_data,
                ..
            } => {
                assert_eq!(init_data_type, "cenc");
                assert_eq!(init_data, &vec![0x42; 32]);
            }
            other => panic!("unexpected call {:?}", other),
        }

        let sent = log.matching(|k| matches!(k, CallKind::MessageSent { .. }));
        let updates = log.matching(|k| matches!(k, CallKind::Update { .. }));
        assert_eq!(updates.len(), 1);
        match &updates[0].kind {
            CallKind::Update { response, .. } => assert_eq!(response.as_slice(), &RESPONSE),
            other => panic!("unexpected call {:?}", other),
        }
        assert!(updates[0].at.duration_since(sent[0].at) >= f.manager.license_delay());

        assert!(eventually(|| f.manager.key_count() == 1).await);
        assert!(!f.manager.key_unusable());
        assert_eq!(f.backend.received().len(), 1);
    }

    #[tokio::test]
    async fn license_delay_is_configurable() {
        let f = fixture(SimConfig::default());
        f.manager.set_license_delay(Duration::from_millis(40));

        let number = f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert_eq!(number, 1);

        let log = f.host.log();
        assert!(log.wait_for(1, WAIT, |k| matches!(k, CallKind::Update { .. })).await);
        let sent = log.matching(|k| matches!(k, CallKind::MessageSent { .. }));
        let updates = log.matching(|k| matches!(k, CallKind::Update { .. }));
        assert!(updates[0].at.duration_since(sent[0].at) >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn n_signals_create_n_sessions_with_one_media_keys() {
        let f = fixture(SimConfig::default());
        let mut outcomes = f.manager.take_outcomes().expect("outcomes");
        for _ in 0..4 {
            f.target.fire_encrypted(encrypted(16));
        }

        let settled = settle(&mut outcomes, 4).await;
        assert!(settled.iter().all(|o| o.result.is_ok()));
        assert_eq!(f.manager.key_session_count(), 4);

        let log = f.host.log();
        assert_eq!(log.count(|k| matches!(k, CallKind::SetMediaKeys)), 1);
        assert_eq!(log.count(|k| matches!(k, CallKind::CreateMediaKeys)), 1);
        assert_eq!(log.count(|k| matches!(k, CallKind::CreateSession { .. })), 4);
        assert!(f.target.media_keys().is_some());
    }

    #[tokio::test]
    async fn sixteen_sessions_of_sixteen_keys_count_256() {
        let f = fixture(SimConfig {
            keys_per_session: 16,
            ..SimConfig::default()
        });
        let mut outcomes = f.manager.take_outcomes().expect("outcomes");
        for _ in 0..16 {
            f.target.fire_encrypted(encrypted(16));
        }
        settle(&mut outcomes, 16).await;

        let log = f.host.log();
        assert!(log.wait_for(16, WAIT, |k| matches!(k, CallKind::Update { .. })).await);
        assert!(eventually(|| f.manager.key_count() == 256).await);
        assert_eq!(f.manager.key_session_count(), 16);
        assert!(!f.manager.key_unusable());

        let statuses = f.manager.session_key_statuses(16).expect("session 16");
        assert_eq!(statuses.len(), 16);
    }

    #[tokio::test]
    async fn repeated_status_signals_are_counted_again() {
        let f = fixture(SimConfig {
            keys_per_session: 2,
            ..SimConfig::default()
        });
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert!(eventually(|| f.manager.key_count() == 2).await);

        // A second update of the same session re-reports the same two keys.
        let record_session = {
            let state = f.manager.inner.lock_state();
            Arc::clone(&state.sessions[0].session)
        };
        record_session.update(&RESPONSE).await.expect("update");
        assert!(eventually(|| f.manager.key_count() == 4).await);
        assert_eq!(f.manager.session_key_statuses(1).expect("session").len(), 2);
    }

    #[tokio::test]
    async fn unusable_key_flag_is_monotonic() {
        let f = fixture(SimConfig {
            keys_per_session: 2,
            key_statuses: vec![KeyStatus::Usable, KeyStatus::OutputRestricted],
            ..SimConfig::default()
        });
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert!(eventually(|| f.manager.key_unusable()).await);

        // Later status signals never clear the flag.
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert!(eventually(|| f.manager.key_count() >= 4).await);
        assert!(f.manager.key_unusable());
    }

    #[tokio::test]
    async fn missing_capability_query_creates_nothing() {
        let f = fixture(SimConfig {
            capability_query: false,
            ..SimConfig::default()
        });
        let mut outcomes = f.manager.take_outcomes().expect("outcomes");
        f.target.fire_encrypted(encrypted(32));

        let settled = settle(&mut outcomes, 1).await;
        assert_eq!(settled[0].reached, PipelineState::CapabilityCheck);
        assert!(matches!(
            settled[0].result,
            Err(Error::CapabilityQueryUnavailable)
        ));
        assert_eq!(f.manager.key_session_count(), 0);
        assert_eq!(f.host.log().calls().len(), 0);
    }

    #[tokio::test]
    async fn unsupported_key_system_is_reported() {
        let f = fixture_with(
            SimConfig::default(),
            FixedResponseBackend::new(KeySystem::PlayReady.id(), RESPONSE.to_vec()),
        );
        let err = f.manager.on_encrypted(encrypted(8)).await.expect_err("unsupported");
        match err {
            Error::KeySystemUnsupported { key_system, .. } => {
                assert_eq!(key_system, "com.microsoft.playready")
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(f.manager.key_session_count(), 0);
    }

    #[tokio::test]
    async fn certificate_is_provisioned_before_session_creation() {
        let f = fixture(SimConfig::default());
        f.manager.set_certificate_src("certs/valid_widevine_cert.bin");
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");

        let kinds: Vec<_> = f.host.log().calls().into_iter().map(|c| c.kind).collect();
        let fetch = kinds
            .iter()
            .position(|k| matches!(k, CallKind::FetchCertificate { .. }))
            .expect("fetched");
        let submit = kinds
            .iter()
            .position(|k| matches!(k, CallKind::SetServerCertificate { .. }))
            .expect("submitted");
        let create = kinds
            .iter()
            .position(|k| matches!(k, CallKind::CreateSession { .. }))
            .expect("created");
        assert!(fetch < submit && submit < create);
        assert_eq!(f.manager.certificate_outcome(), Some(CertificateOutcome::Accepted));
        assert!(f.manager.diagnostics().set_server_certificate_result.is_empty());
    }

    #[tokio::test]
    async fn rejected_certificate_is_recorded_and_pipeline_continues() {
        let f = fixture(SimConfig {
            certificate: CertificateBehavior::Reject,
            ..SimConfig::default()
        });
        f.manager.set_certificate_src("certs/invalid_widevine_cert.bin");
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");

        let result = f.manager.diagnostics().set_server_certificate_result;
        assert!(result.starts_with("setServerCertificate rejected"));
        assert_eq!(
            f.host
                .log()
                .count(|k| matches!(k, CallKind::GenerateRequest { .. })),
            1
        );
    }

    #[tokio::test]
    async fn refused_and_unsupported_certificates() {
        let f = fixture(SimConfig {
            certificate: CertificateBehavior::Refuse,
            ..SimConfig::default()
        });
        f.manager.set_certificate_src("cert.bin");
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert_eq!(
            f.manager.diagnostics().set_server_certificate_result,
            "setServerCertificate failed"
        );

        let f = fixture(SimConfig {
            server_certificate_supported: false,
            ..SimConfig::default()
        });
        f.manager.set_certificate_src("cert.bin");
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert_eq!(
            f.manager.diagnostics().set_server_certificate_result,
            "setServerCertificate() is not supported"
        );
        assert_eq!(f.host.log().count(|k| matches!(k, CallKind::FetchCertificate { .. })), 0);
    }

    #[tokio::test]
    async fn certificate_request_and_encrypted_license_request_are_flagged() {
        let f = fixture(SimConfig {
            request_kind: RequestKind::CertificateFirst,
            ..SimConfig::default()
        });
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");

        let log = f.host.log();
        // Certificate update, then license update.
        assert!(log.wait_for(2, WAIT, |k| matches!(k, CallKind::Update { .. })).await);
        let diagnostics = f.manager.diagnostics();
        assert!(diagnostics.server_certificate_requested);
        assert!(diagnostics.message_encrypted);

        let received = f.backend.received();
        assert_eq!(received[0].1.as_slice(), SERVICE_CERTIFICATE_CHALLENGE);
    }

    #[tokio::test]
    async fn clear_license_request_sets_no_flags() {
        let f = fixture(SimConfig::default());
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        let log = f.host.log();
        assert!(log.wait_for(1, WAIT, |k| matches!(k, CallKind::Update { .. })).await);

        let diagnostics = f.manager.diagnostics();
        assert!(!diagnostics.server_certificate_requested);
        assert!(!diagnostics.message_encrypted);
    }

    #[tokio::test]
    async fn individualization_requests_go_to_backend() {
        let f = fixture(SimConfig {
            individualization: true,
            ..SimConfig::default()
        });
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        let log = f.host.log();
        assert!(log.wait_for(2, WAIT, |k| matches!(k, CallKind::Update { .. })).await);

        let types: Vec<_> = f.backend.received().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            types,
            vec![MessageType::IndividualizationRequest, MessageType::LicenseRequest]
        );
    }

    #[tokio::test]
    async fn external_init_data_overrides_event_payload() {
        let f = fixture_with(
            SimConfig::default(),
            FixedResponseBackend::new(KeySystem::Widevine.id(), RESPONSE.to_vec())
                .with_external_init_data(b"external-pssh".to_vec()),
        );
        f.manager.on_encrypted(encrypted(32)).await.expect("bring-up");

        let generated = f
            .host
            .log()
            .matching(|k| matches!(k, CallKind::GenerateRequest { .. }));
        match &generated[0].kind {
            CallKind::GenerateRequest { init_data, .. } => {
                assert_eq!(init_data.as_slice(), b"external-pssh")
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_generate_request_keeps_session_until_teardown() {
        let f = fixture(SimConfig {
            fail_generate_request: true,
            ..SimConfig::default()
        });
        let mut outcomes = f.manager.take_outcomes().expect("outcomes");
        f.target.fire_encrypted(encrypted(8));

        let settled = settle(&mut outcomes, 1).await;
        assert_eq!(settled[0].reached, PipelineState::GenerateRequest);
        assert!(matches!(settled[0].result, Err(Error::GenerateRequestFailed(_))));
        assert_eq!(f.manager.key_session_count(), 1);

        f.manager.close_all_key_sessions().await;
        assert_eq!(f.manager.key_session_count(), 0);
        assert_eq!(f.host.log().close_order(), vec!["sim-session-1".to_string()]);
    }

    #[tokio::test]
    async fn failed_session_create_is_fatal() {
        let f = fixture(SimConfig {
            fail_session_create: true,
            ..SimConfig::default()
        });
        let err = f.manager.on_encrypted(encrypted(8)).await.expect_err("create fails");
        assert!(matches!(err, Error::SessionCreateFailed(_)));
        assert_eq!(f.manager.key_session_count(), 0);
    }

    #[tokio::test]
    async fn failed_update_is_swallowed() {
        let f = fixture(SimConfig {
            fail_update: true,
            ..SimConfig::default()
        });
        f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        let log = f.host.log();
        assert!(log.wait_for(1, WAIT, |k| matches!(k, CallKind::Update { .. })).await);
        assert_eq!(f.manager.key_count(), 0);
        assert_eq!(f.manager.key_session_count(), 1);
    }

    #[tokio::test]
    async fn teardown_closes_newest_first() {
        let f = fixture(SimConfig::default());
        for _ in 0..3 {
            f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        }

        f.manager.close_all_key_sessions().await;
        assert_eq!(
            f.host.log().close_order(),
            vec!["sim-session-3", "sim-session-2", "sim-session-1"]
        );
        assert_eq!(f.manager.key_session_count(), 0);

        // Numbering restarts for the next attempt.
        let number = f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        assert_eq!(number, 1);
    }

    #[tokio::test]
    async fn teardown_continues_past_close_failures() {
        let f = fixture(SimConfig {
            fail_close: true,
            ..SimConfig::default()
        });
        for _ in 0..2 {
            f.manager.on_encrypted(encrypted(8)).await.expect("bring-up");
        }
        f.manager.close_all_key_sessions().await;
        assert_eq!(f.host.log().close_order().len(), 2);
        assert_eq!(f.manager.key_session_count(), 0);
    }

    #[tokio::test]
    async fn teardown_without_sessions_completes() {
        let f = fixture(SimConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        f.manager.close_all_key_sessions_then(move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(WAIT, rx)
            .await
            .expect("completed")
            .expect("callback ran");
        assert_eq!(f.host.log().close_order().len(), 0);
    }

    #[tokio::test]
    async fn spy_replaces_encrypted_handling() {
        let f = fixture(SimConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let called = Arc::new(AtomicBool::new(false));
        {
            let seen = Arc::clone(&seen);
            let called = Arc::clone(&called);
            f.manager.add_encrypted_spy(move |event| {
                seen.store(event.init_data.len(), Ordering::SeqCst);
                called.store(true, Ordering::SeqCst);
            });
        }
        f.target.fire_encrypted(encrypted(856));

        assert!(eventually(|| called.load(Ordering::SeqCst)).await);
        assert_eq!(seen.load(Ordering::SeqCst), 856);
        assert_eq!(f.manager.key_session_count(), 0);
        assert!(f.host.log().calls().is_empty());
    }

    #[tokio::test]
    async fn check_key_system_support_without_pipeline() {
        let f = fixture(SimConfig::default());
        let access = f
            .manager
            .check_key_system_support()
            .await
            .expect("supported");
        assert_eq!(access.key_system(), "com.widevine.alpha");
        assert_eq!(f.manager.key_session_count(), 0);
    }

    #[tokio::test]
    async fn certificate_src_set_later_applies_to_later_sessions() {
        let f = fixture(SimConfig::default());
        assert_eq!(f.manager.on_encrypted(encrypted(8)).await.ok(), Some(1));
        assert_eq!(f.manager.certificate_outcome(), None);

        f.manager.set_certificate_src("certs/valid_widevine_cert.bin");
        assert_eq!(f.manager.on_encrypted(encrypted(8)).await.ok(), Some(2));

        let kinds: Vec<_> = f.host.log().calls().into_iter().map(|c| c.kind).collect();
        let fetches: Vec<_> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| matches!(k, CallKind::FetchCertificate { .. }))
            .map(|(i, _)| i)
            .collect();
        let creates: Vec<_> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| matches!(k, CallKind::CreateSession { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fetches.len(), 1);
        assert_eq!(creates.len(), 2);
        assert!(creates[0] < fetches[0] && fetches[0] < creates[1]);
        assert_eq!(f.manager.certificate_outcome(), Some(CertificateOutcome::Accepted));
    }

    #[tokio::test]
    async fn outcomes_are_not_buffered_before_subscribing() {
        let f = fixture(SimConfig::default());
        f.target.fire_encrypted(encrypted(16));
        assert!(eventually(|| f.manager.key_count() == 1).await);

        let mut outcomes = f.manager.take_outcomes().expect("outcomes");
        assert!(f.manager.take_outcomes().is_none());
        f.target.fire_encrypted(encrypted(16));

        let settled = settle(&mut outcomes, 1).await;
        assert_eq!(settled[0].result.as_ref().ok(), Some(&2));
        assert!(outcomes.try_recv().is_err());
    }
}
