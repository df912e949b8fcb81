//! Key identifiers and key statuses reported by key sessions.
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

/// `MediaKeyStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    UsableInFuture,
    StatusPending,
    InternalError,
}

impl KeyStatus {
    /// The EME string form of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Usable => "usable",
            KeyStatus::Expired => "expired",
            KeyStatus::Released => "released",
            KeyStatus::OutputRestricted => "output-restricted",
            KeyStatus::OutputDownscaled => "output-downscaled",
            KeyStatus::UsableInFuture => "usable-in-future",
            KeyStatus::StatusPending => "status-pending",
            KeyStatus::InternalError => "internal-error",
        }
    }

    /// Only `usable` counts as usable; `usable-in-future` does not.
    pub fn is_usable(self) -> bool {
        self == KeyStatus::Usable
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "usable" => Ok(KeyStatus::Usable),
            "expired" => Ok(KeyStatus::Expired),
            "released" => Ok(KeyStatus::Released),
            "output-restricted" => Ok(KeyStatus::OutputRestricted),
            "output-downscaled" => Ok(KeyStatus::OutputDownscaled),
            "usable-in-future" => Ok(KeyStatus::UsableInFuture),
            "status-pending" => Ok(KeyStatus::StatusPending),
            "internal-error" => Ok(KeyStatus::InternalError),
            other => Err(Error::Other(format!("Unknown key status '{}'", other))),
        }
    }
}

impl<'de> serde::Deserialize<'de> for KeyStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Raw key identifier as reported in a session's key status map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub Vec<u8>);

impl KeyId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Interpret the key id as a UUID.
    ///
    /// - 16 bytes: direct UUID bytes
    /// - 32 bytes: hex-encoded UUID string
    /// - Shorter: zero padded on the right
    /// - Longer: first 16 bytes
    pub fn to_uuid(&self) -> Uuid {
        let kid = self.as_bytes();
        if kid.is_empty() {
            return Uuid::nil();
        }

        if kid.len() == 32 {
            if let Some(uuid) = std::str::from_utf8(kid)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                return uuid;
            }
        }

        let mut padded = [0u8; 16];
        let len = kid.len().min(16);
        padded[..len].copy_from_slice(&kid[..len]);
        Uuid::from_bytes(padded)
    }
}

impl From<Uuid> for KeyId {
    fn from(value: Uuid) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}
