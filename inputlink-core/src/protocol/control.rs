//! Session-control payloads: HELLO, STATUS, ERROR, PING and PONG.
//!
//! # Handshake
//! ```text
//! Sender   ──[hello {claimed}]──────────────► Receiver
//! Receiver ──[status {in_reply_to}]─────────► Sender     (ack)
//! ```
//!
//! A later HELLO on the same connection replaces the claimed set:
//! numbers missing from it are released on the receiver.
//!
//! # Keep-alive
//! ```text
//! Sender   ──[ping {nonce}]─────────────────► Receiver
//! Receiver ──[pong {nonce}]─────────────────► Sender
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::sample::is_valid_controller_number;

// ── Hello ────────────────────────────────────────────────────────

/// Declares the controller numbers a sender owns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Human-readable sender name (hostname by default).
    #[serde(default)]
    pub sender_name: String,
    /// Complete set of claimed controller numbers.
    pub claimed: Vec<u32>,
}

impl HelloPayload {
    pub fn new(sender_name: impl Into<String>, claimed: &BTreeSet<u32>) -> Self {
        Self {
            sender_name: sender_name.into(),
            claimed: claimed.iter().copied().collect(),
        }
    }

    /// The claimed numbers as a set, with numbers outside
    /// `1..=MAX_CONTROLLER_NUMBER` removed.
    pub fn claimed_set(&self) -> BTreeSet<u32> {
        self.claimed
            .iter()
            .copied()
            .filter(|n| is_valid_controller_number(*n))
            .collect()
    }
}

// ── Status ───────────────────────────────────────────────────────

/// Coarse health indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Ok,
    /// Some devices are in the error state or were rejected.
    Degraded,
    #[serde(other)]
    Unknown,
}

/// Counts and health for observability. Sent as the HELLO
/// acknowledgment (with `in_reply_to` set) and in answer to a STATUS.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPayload {
    /// `message_id` of the envelope this answers.
    pub in_reply_to: Option<u64>,
    /// Controller numbers now owned by the requesting session.
    pub accepted: Vec<u32>,
    /// Devices currently in the active state.
    pub active_devices: u32,
    /// Connected sessions.
    pub live_sessions: u32,
    /// Samples rejected because the device limit was reached.
    pub rejected_total: u64,
    /// Envelopes evicted from the sender queue.
    pub overflow_total: u64,
    pub health: Health,
}

impl StatusPayload {
    /// Acknowledge the envelope with `message_id`.
    pub fn ack(message_id: u64) -> Self {
        Self {
            in_reply_to: Some(message_id),
            ..Default::default()
        }
    }

    pub fn with_accepted(mut self, accepted: &BTreeSet<u32>) -> Self {
        self.accepted = accepted.iter().copied().collect();
        self
    }
}

// ── Error ────────────────────────────────────────────────────────

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The envelope could not be decoded.
    InvalidMessage,
    /// Protocol major versions differ; the connection is closed.
    IncompatibleVersion,
    /// The device limit was reached; the sample was rejected.
    DeviceLimit,
    /// Another session owns the controller number.
    NotOwner,
    #[serde(other)]
    Other,
}

/// Error report sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default)]
    pub description: String,
    /// Controller the error refers to, if any.
    #[serde(default)]
    pub controller_number: Option<u32>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            controller_number: None,
        }
    }

    pub fn for_controller(mut self, controller_number: u32) -> Self {
        self.controller_number = Some(controller_number);
        self
    }
}

// ── Ping / Pong ──────────────────────────────────────────────────

/// Keep-alive probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub nonce: u64,
}

/// Keep-alive answer echoing the probe's nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default)]
    pub nonce: u64,
}

impl From<PingPayload> for PongPayload {
    fn from(ping: PingPayload) -> Self {
        Self { nonce: ping.nonce }
    }
}
