//! Key session message classification.
//!
//! The manager only looks inside license requests for two markers that the
//! certificate conformance tests assert on: whether the CDM asked for a
//! service certificate, and whether its license request carries an
//! encrypted client identification. Everything else is opaque.
use std::fmt;
use std::str::FromStr;

use prost::Message as _;

use crate::error::{Error, Result};
use crate::wire_protocol::message::MessageId;
use crate::wire_protocol::{LicenseRequest, Message};

/// Service certificate challenge payload (`Message { id: 4 }`).
pub const SERVICE_CERTIFICATE_CHALLENGE: &[u8] = b"\x08\x04";

/// `MediaKeyMessageType` values a key session can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

impl MessageType {
    /// The EME string form of this message type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::LicenseRequest => "license-request",
            MessageType::LicenseRenewal => "license-renewal",
            MessageType::LicenseRelease => "license-release",
            MessageType::IndividualizationRequest => "individualization-request",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "license-request" => Ok(MessageType::LicenseRequest),
            "license-renewal" => Ok(MessageType::LicenseRenewal),
            "license-release" => Ok(MessageType::LicenseRelease),
            "individualization-request" => Ok(MessageType::IndividualizationRequest),
            other => Err(Error::Other(format!("Unknown message type '{}'", other))),
        }
    }
}

/// Where a session message has to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Individualization,
    License,
    Ignore,
}

impl Route {
    #[must_use]
    pub fn for_message(message_type: MessageType) -> Self {
        match message_type {
            MessageType::IndividualizationRequest => Route::Individualization,
            MessageType::LicenseRequest => Route::License,
            MessageType::LicenseRenewal | MessageType::LicenseRelease => Route::Ignore,
        }
    }
}

/// Result of inspecting one license request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageDiagnostics {
    /// The message is a service certificate request.
    pub certificate_request: bool,
    /// The message is a license request with an encrypted client id.
    pub encrypted: bool,
}

impl MessageDiagnostics {
    /// Classify a raw license-request message.
    ///
    /// Undecodable payloads are not an error here: they simply match neither
    /// marker.
    #[must_use]
    pub fn inspect(message: &[u8]) -> Self {
        Self {
            certificate_request: is_certificate_request(message),
            encrypted: is_encrypted_license_request(message),
        }
    }
}

/// Decode the outer message envelope.
pub fn decode_envelope(message: &[u8]) -> Result<Message> {
    Ok(Message::decode(message)?)
}

/// Whether `message` is a service certificate request (message id 4).
pub fn is_certificate_request(message: &[u8]) -> bool {
    match decode_envelope(message) {
        Ok(envelope) => envelope.id == Some(MessageId::ServiceCertificateRequest as i32),
        Err(e) => {
            debug!("Message is not a decodable envelope: {}", e);
            false
        }
    }
}

/// Whether `message` is a license request (id 1) whose body has no clear
/// `request_info` but does carry a `request_id`.
pub fn is_encrypted_license_request(message: &[u8]) -> bool {
    let envelope = match decode_envelope(message) {
        Ok(envelope) => envelope,
        Err(_) => return false,
    };
    if envelope.id != Some(MessageId::LicenseRequest as i32) {
        return false;
    }

    let body = envelope.msg.unwrap_or_default();
    match LicenseRequest::decode(body.as_slice()) {
        Ok(request) => request.request_info.is_none() && request.request_id.is_some(),
        Err(e) => {
            debug!("License request body did not decode: {}", e);
            false
        }
    }
}
