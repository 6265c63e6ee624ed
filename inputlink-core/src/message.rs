//! Envelope kinds.
//!
//! Kinds travel as lowercase strings. Parsing never fails: a kind this
//! build does not know maps to [`MessageKind::Unknown`] so that newer
//! peers can add message kinds without breaking older ones.

use std::fmt;

// ── MessageKind ──────────────────────────────────────────────────

/// All message kinds understood by the InputLink protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A controller sample (sender → receiver).
    Input,
    /// Claim of a controller-number set (sender → receiver).
    Hello,
    /// Counts and health; also the HELLO acknowledgment.
    Status,
    /// Error report.
    Error,
    /// Keep-alive probe.
    Ping,
    /// Keep-alive answer.
    Pong,
    /// A kind introduced by a newer peer.
    Unknown(String),
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Input => "input",
            MessageKind::Hello => "hello",
            MessageKind::Status => "status",
            MessageKind::Error => "error",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Unknown(kind) => kind,
        }
    }

    /// Parse a wire name.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "input" => MessageKind::Input,
            "hello" => MessageKind::Hello,
            "status" => MessageKind::Status,
            "error" => MessageKind::Error,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    /// Returns `true` for kinds this build cannot interpret.
    pub fn is_unknown(&self) -> bool {
        matches!(self, MessageKind::Unknown(_))
    }

    /// Returns `true` if the peer is expected to answer this kind.
    pub fn expects_response(&self) -> bool {
        matches!(self, MessageKind::Hello | MessageKind::Ping)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
