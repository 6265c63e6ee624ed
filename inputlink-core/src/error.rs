//! Domain-specific error types for InputLink.
//!
//! All fallible operations return `Result<T, LinkError>`.
//! Every variant belongs to one [`ErrorKind`], which decides how the
//! caller recovers: protocol errors drop a connection, transport errors
//! drive the reconnect state machine, validation and capability errors
//! are counted and absorbed.

use std::time::Duration;
use thiserror::Error;

use crate::envelope::ProtocolVersion;

/// The canonical error type for InputLink.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// An envelope could not be encoded because its payload violates
    /// the schema (e.g. an axis out of range).
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Received bytes that do not form a valid envelope.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The peer speaks a different protocol major version.
    #[error("incompatible protocol version {remote} (local {local})")]
    IncompatibleVersion {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    /// The frame layer lost sync (bad magic, checksum, oversize).
    #[error("framing error: {0}")]
    Framing(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The peer rejected the handshake or answered with an error.
    #[error("handshake failed: {0}")]
    Handshake(String),

    // ── Sample Errors ────────────────────────────────────────────
    /// A sample lies outside its declared domain.
    #[error("invalid sample: {0}")]
    Validation(String),

    /// The hardware collaborator could not read a controller.
    #[error("controller {0} unavailable")]
    HardwareUnavailable(String),

    // ── Device Errors ────────────────────────────────────────────
    /// A platform backend failed to create, apply or destroy a device.
    #[error("capability error on controller {controller_number}: {reason}")]
    Capability {
        controller_number: u32,
        reason: String,
    },

    // ── State Errors ─────────────────────────────────────────────
    /// A state machine was asked for a transition it does not allow.
    #[error("invalid state transition: {0}")]
    InvalidTransition(&'static str),

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

// ── ErrorKind ────────────────────────────────────────────────────

/// Coarse classification used to decide how an error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incompatible envelope.
    Protocol,
    /// Refused, reset or timed-out connection.
    Transport,
    /// Sample outside its declared domain.
    Validation,
    /// Platform device backend failure.
    Capability,
    /// Bad configuration value.
    Config,
    /// Misuse of an internal state machine.
    Internal,
}

impl LinkError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Encoding(_)
            | Self::Decoding(_)
            | Self::IncompatibleVersion { .. }
            | Self::Framing(_)
            | Self::FrameTooLarge { .. } => ErrorKind::Protocol,
            Self::Connection(_)
            | Self::ConnectionClosed
            | Self::Timeout(_)
            | Self::Handshake(_) => ErrorKind::Transport,
            Self::Validation(_) | Self::HardwareUnavailable(_) => ErrorKind::Validation,
            Self::Capability { .. } => ErrorKind::Capability,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidTransition(_) => ErrorKind::Internal,
        }
    }

    /// `true` for errors after which the byte stream cannot be trusted
    /// and the connection must be dropped.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleVersion { .. } | Self::Framing(_) | Self::FrameTooLarge { .. }
        ) || self.kind() == ErrorKind::Transport
    }

    /// Shorthand for a [`LinkError::Capability`].
    pub fn capability(controller_number: u32, reason: impl Into<String>) -> Self {
        Self::Capability {
            controller_number,
            reason: reason.into(),
        }
    }
}
