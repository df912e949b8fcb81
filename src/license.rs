//! License acquisition backend interface.
//!
//! The backend owns everything DRM-vendor specific: which key system to
//! ask for, the capability configuration, and how license and
//! individualization requests reach a server. Responses flow back through a
//! [`Responder`], which submits them to the originating session after the
//! manager's license delay.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::KeySystemConfig;
use crate::error::{Error, Result};
use crate::host::MediaKeySession;

/// Key systems the conformance suite exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySystem {
    Widevine,
    PlayReady,
    ClearKey,
}

impl KeySystem {
    /// Key system string passed to the capability query.
    pub fn id(self) -> &'static str {
        match self {
            KeySystem::Widevine => "com.widevine.alpha",
            KeySystem::PlayReady => "com.microsoft.playready",
            KeySystem::ClearKey => "org.w3.clearkey",
        }
    }

    /// Title-cased name used in test names and categories.
    pub fn title(self) -> &'static str {
        match self {
            KeySystem::Widevine => "Widevine",
            KeySystem::PlayReady => "Playready",
            KeySystem::ClearKey => "Clearkey",
        }
    }
}

impl fmt::Display for KeySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for KeySystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "com.widevine.alpha" | "widevine" => Ok(KeySystem::Widevine),
            "com.microsoft.playready" | "playready" => Ok(KeySystem::PlayReady),
            "org.w3.clearkey" | "clearkey" => Ok(KeySystem::ClearKey),
            _ => Err(Error::Other(format!("Unknown key system '{}'", s))),
        }
    }
}

/// Pluggable license acquisition.
pub trait LicenseBackend: Send + Sync {
    /// Key system identifier requested from the host.
    fn key_system(&self) -> &str;

    /// Configurations offered to the capability query.
    fn make_key_system_config(&self) -> Vec<KeySystemConfig>;

    /// Init data to use instead of the `encrypted` event payload.
    fn external_init_data(&self) -> Option<Vec<u8>> {
        None
    }

    /// Handle an `individualization-request` message.
    fn request_individualization(&self, message: Vec<u8>, respond: Responder);

    /// Handle a `license-request` message.
    fn acquire_license(&self, message: Vec<u8>, respond: Responder);
}

/// Delivers a backend response to the session that asked for it.
#[derive(Clone)]
pub struct Responder {
    session: Arc<dyn MediaKeySession>,
    session_number: u32,
    delay: Duration,
    runtime: Handle,
}

impl Responder {
    pub(crate) fn new(
        session: Arc<dyn MediaKeySession>,
        session_number: u32,
        delay: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            session,
            session_number,
            delay,
            runtime,
        }
    }

    /// Schedule `response` as an update of the session.
    ///
    /// May be called from any thread. A rejected update is logged and
    /// dropped; it shows up later as missing or unusable keys.
    pub fn respond(&self, response: Vec<u8>) {
        let session = Arc::clone(&self.session);
        let number = self.session_number;
        let delay = self.delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            trace!("Submitting {} byte response to session #{}", response.len(), number);
            if let Err(e) = session.update(&response).await {
                let err = Error::UpdateSubmissionFailed(e);
                warn!("keySession.update failed for session #{}: {}", number, err);
            }
        });
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("session", &self.session.session_id())
            .field("session_number", &self.session_number)
            .field("delay", &self.delay)
            .finish()
    }
}
