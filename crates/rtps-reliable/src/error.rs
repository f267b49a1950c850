// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Protocol-level trouble (loss, reordering, duplicates, stale ACKNACKs) is
//! recovered inside the engine and never shows up here. What does reach the
//! application is either a configuration problem (fix the QoS) or a resource
//! problem (raise limits or blocking time).

/// Errors surfaced by the reliability engine.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Generic configuration error (prefer specific variants below).
    Config,
    /// QoS policy is invalid (e.g., zero depth, flow controller below one message).
    InvalidQos(String),
    /// Configuration file not found at specified path.
    ConfigFileNotFound(String),

    // ========================================================================
    // Entity Errors
    // ========================================================================
    /// Invalid state for the requested operation.
    InvalidState(String),
    /// No local writer or reader with the given GUID.
    UnknownEndpoint,
    /// QoS policies are incompatible between endpoints (e.g., reliable reader + best-effort writer).
    QosIncompatible,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Send operation failed.
    SendFailed(String),
    /// Incoming bytes could not be parsed as an RTPS message.
    Malformed(String),

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// History bound reached and the writer may not block.
    ResourceExhausted(String),
    /// Writer blocked for `max_blocking_time` without getting room (or acknowledgments).
    WriteTimeout,
    /// Sequence number not greater than the last one added.
    SequenceRegression {
        /// Last sequence number accepted.
        last: u64,
        /// Rejected sequence number.
        got: u64,
    },

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Requested feature or operation is not supported.
    Unsupported,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Configuration
            Error::Config => write!(f, "Configuration error"),
            Error::InvalidQos(msg) => write!(f, "Invalid QoS: {}", msg),
            Error::ConfigFileNotFound(path) => write!(f, "Config file not found: {}", path),
            // Entity
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::UnknownEndpoint => write!(f, "Unknown endpoint"),
            Error::QosIncompatible => write!(f, "QoS incompatible"),
            // Transport
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::Malformed(msg) => write!(f, "Malformed message: {}", msg),
            // Resource
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::WriteTimeout => write!(f, "Write timeout"),
            Error::SequenceRegression { last, got } => write!(
                f,
                "Sequence number {} not greater than last added {}",
                got, last
            ),
            // Other
            Error::Unsupported => write!(f, "Unsupported operation"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenient alias for results using the crate `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::InvalidQos("depth".into()).to_string(),
            "Invalid QoS: depth"
        );
        assert_eq!(
            Error::SequenceRegression { last: 5, got: 3 }.to_string(),
            "Sequence number 3 not greater than last added 5"
        );
        assert_eq!(Error::WriteTimeout.to_string(), "Write timeout");
    }
}
