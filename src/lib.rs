//! rseme - Encrypted Media Extensions session and key lifecycle manager.
//!
//! This crate provides:
//! - A session manager that brings up key sessions for every `encrypted`
//!   signal and tracks key statuses and license exchange diagnostics.
//! - Host traits mirroring the browser EME surface, plus an in-memory
//!   simulated host.
//! - License message classification and PSSH init data inspection.
//! - The EME conformance test catalogue.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary helpers.
//! - `chrono`: use chrono for date handling in CLI.
//! - `tracing`: route log macros to `tracing` instead of `log`.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// License message classification.
pub mod classify;
/// Manager and key system configuration.
pub mod config;
/// EME conformance test definitions.
pub mod conformance;
/// Common error types and Result alias.
pub mod error;
/// Host encrypted-media traits.
pub mod host;
/// Key ids and key statuses.
pub mod key;
/// License backend interface and key systems.
pub mod license;
/// Session manager.
pub mod manager;
/// PSSH parsing utilities.
pub mod pssh;
/// Per-session bookkeeping.
pub mod session;
/// Simulated host and scenario runner.
pub mod sim;

// Protobuf-generated license message definitions (kept private).
mod rseme_wire_protocol;

/// Protobuf-generated license message definitions.
pub mod wire_protocol {
    pub use crate::rseme_wire_protocol::*;
}

pub use manager::EmeSessionManager;
