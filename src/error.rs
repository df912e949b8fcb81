//! Error types for rseme.

use thiserror::Error;

/// Failure reported by a host encrypted-media primitive.
///
/// Host APIs reject with free-form reasons (DOMException names, CDM codes),
/// so only the message is kept. The manager converts it into an [`Error`]
/// at the step that issued the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Main error type for rseme operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The manager has no key system to request.
    #[error("Not initialized: no key system (bad manifest parse?)")]
    NotInitialized,

    /// The host does not expose the capability query (usually an insecure context).
    #[error("requestMediaKeySystemAccess is not defined (requires HTTPS)")]
    CapabilityQueryUnavailable,

    /// The capability query completed but rejected the key system.
    #[error("Key system {key_system} is not supported: {reason}")]
    KeySystemUnsupported { key_system: String, reason: String },

    /// Media keys could not be created or bound to the playback target.
    #[error("Failed to acquire media keys: {0}")]
    MediaKeysUnavailable(HostError),

    /// The server certificate could not be fetched or was refused.
    #[error("Server certificate provisioning failed: {0}")]
    CertificateProvisionFailed(String),

    /// The media keys object cannot accept a server certificate.
    #[error("setServerCertificate() is not supported")]
    CertificateProvisionUnsupported,

    /// The native session could not be created.
    #[error("Failed to create key session: {0}")]
    SessionCreateFailed(HostError),

    /// The native session refused the initialization data.
    #[error("generateRequest failed: {0}")]
    GenerateRequestFailed(HostError),

    /// A license response was rejected by the session.
    #[error("Key session update failed: {0}")]
    UpdateSubmissionFailed(HostError),

    /// A session failed to close during teardown.
    #[error("Key session close failed: {0}")]
    SessionCloseFailed(HostError),

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// The init data is not a usable PSSH payload.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias for rseme operations.
pub type Result<T> = std::result::Result<T, Error>;
