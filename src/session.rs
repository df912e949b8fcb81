//! Per-session bookkeeping kept by the session manager.
//!
//! Each record owns the native key session it was created with and the
//! latest status observed for every key the session reported.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::host::MediaKeySession;
use crate::key::{KeyId, KeyStatus};

/// One key session created by the manager.
pub struct SessionRecord {
    /// Session number (1-indexed, creation order).
    pub number: u32,
    /// Native session; the manager is the only party that closes it.
    pub session: Arc<dyn MediaKeySession>,
    /// Latest status per key id.
    pub observed_key_statuses: HashMap<KeyId, KeyStatus>,
}

impl SessionRecord {
    /// Create a record for a freshly created native session.
    pub fn new(number: u32, session: Arc<dyn MediaKeySession>) -> Self {
        Self {
            number,
            session,
            observed_key_statuses: HashMap::new(),
        }
    }

    /// Record the latest status of each key.
    pub fn observe<'a>(&mut self, statuses: impl IntoIterator<Item = &'a (KeyId, KeyStatus)>) {
        for (kid, status) in statuses {
            self.observed_key_statuses.insert(kid.clone(), *status);
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("number", &self.number)
            .field("session", &self.session.session_id())
            .field("observed_key_statuses", &self.observed_key_statuses)
            .finish()
    }
}
