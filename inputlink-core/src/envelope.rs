//! The InputLink envelope and its JSON wire encoding.
//!
//! ```text
//! { "protocol_version": "1.0",
//!   "message_id": 17,
//!   "kind": "input" | "hello" | "status" | "error" | "ping" | "pong",
//!   "payload": { … } }
//! ```
//!
//! [`encode`] validates the payload before serializing it. [`decode`]
//! checks the protocol version first (only a major mismatch is fatal),
//! then parses the payload according to `kind`. Envelopes of an unknown
//! kind decode successfully as [`Payload::Unknown`] and are ignorable.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::LinkError;
use crate::message::MessageKind;
use crate::protocol::{ErrorPayload, HelloPayload, PingPayload, PongPayload, StatusPayload};
use crate::sample::ControllerSample;

/// Version spoken by this build.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0);

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique message id.
pub fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

// ── ProtocolVersion ──────────────────────────────────────────────

/// `major.minor` protocol version. Peers are compatible when their
/// major versions match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LinkError::Decoding(format!("invalid protocol version {s:?}"));
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        Ok(Self {
            major: major.trim().parse().map_err(|_| bad())?,
            minor: minor.trim().parse().map_err(|_| bad())?,
        })
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Payload ──────────────────────────────────────────────────────

/// Payload typed by message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Input(ControllerSample),
    Hello(HelloPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    /// A kind this build does not understand. Kept verbatim.
    Unknown { kind: String, raw: Value },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Input(_) => MessageKind::Input,
            Payload::Hello(_) => MessageKind::Hello,
            Payload::Status(_) => MessageKind::Status,
            Payload::Error(_) => MessageKind::Error,
            Payload::Ping(_) => MessageKind::Ping,
            Payload::Pong(_) => MessageKind::Pong,
            Payload::Unknown { kind, .. } => MessageKind::Unknown(kind.clone()),
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// A self-describing wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub protocol_version: ProtocolVersion,
    pub message_id: u64,
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload with the current version and a fresh message id.
    pub fn new(payload: Payload) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message_id: next_message_id(),
            payload,
        }
    }

    pub fn input(sample: ControllerSample) -> Self {
        Self::new(Payload::Input(sample))
    }

    pub fn hello(hello: HelloPayload) -> Self {
        Self::new(Payload::Hello(hello))
    }

    pub fn status(status: StatusPayload) -> Self {
        Self::new(Payload::Status(status))
    }

    pub fn error(error: ErrorPayload) -> Self {
        Self::new(Payload::Error(error))
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(Payload::Ping(PingPayload { nonce }))
    }

    pub fn pong(pong: PongPayload) -> Self {
        Self::new(Payload::Pong(pong))
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// `true` for envelopes of an unknown kind, which receivers skip.
    pub fn is_ignorable(&self) -> bool {
        matches!(self.payload, Payload::Unknown { .. })
    }

    /// `(controller_number, sequence)` of an INPUT envelope.
    pub fn controller_key(&self) -> Option<(u32, u64)> {
        match &self.payload {
            Payload::Input(sample) => Some((sample.controller_number, sample.sequence)),
            _ => None,
        }
    }
}

// ── Wire encoding ────────────────────────────────────────────────

#[derive(Serialize)]
struct WireOut<'a, P: Serialize> {
    protocol_version: ProtocolVersion,
    message_id: u64,
    kind: &'a str,
    payload: &'a P,
}

#[derive(Deserialize)]
struct WireIn {
    message_id: u64,
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn write<P: Serialize>(envelope: &Envelope, kind: &str, payload: &P) -> Result<Bytes, LinkError> {
    let wire = WireOut {
        protocol_version: envelope.protocol_version,
        message_id: envelope.message_id,
        kind,
        payload,
    };
    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(|e| LinkError::Encoding(e.to_string()))
}

/// Serialize an envelope, rejecting payloads that violate the schema.
pub fn encode(envelope: &Envelope) -> Result<Bytes, LinkError> {
    let kind = envelope.kind();
    match &envelope.payload {
        Payload::Input(sample) => {
            sample
                .validate()
                .map_err(|e| LinkError::Encoding(e.to_string()))?;
            write(envelope, kind.as_str(), sample)
        }
        Payload::Hello(hello) => {
            if hello.claimed.contains(&0) {
                return Err(LinkError::Encoding("hello claims controller 0".into()));
            }
            write(envelope, kind.as_str(), hello)
        }
        Payload::Status(status) => write(envelope, kind.as_str(), status),
        Payload::Error(error) => write(envelope, kind.as_str(), error),
        Payload::Ping(ping) => write(envelope, kind.as_str(), ping),
        Payload::Pong(pong) => write(envelope, kind.as_str(), pong),
        Payload::Unknown { raw, .. } => write(envelope, kind.as_str(), raw),
    }
}

fn typed<T: DeserializeOwned>(kind: &MessageKind, payload: Value) -> Result<T, LinkError> {
    serde_json::from_value(payload)
        .map_err(|e| LinkError::Decoding(format!("{kind} payload: {e}")))
}

/// Parse an envelope from its wire bytes.
pub fn decode(bytes: &[u8]) -> Result<Envelope, LinkError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| LinkError::Decoding(e.to_string()))?;

    // Version first: a different major may use a different shape.
    let remote: ProtocolVersion = value
        .get("protocol_version")
        .and_then(Value::as_str)
        .ok_or_else(|| LinkError::Decoding("missing protocol_version".into()))?
        .parse()?;
    if !PROTOCOL_VERSION.is_compatible_with(&remote) {
        return Err(LinkError::IncompatibleVersion {
            local: PROTOCOL_VERSION,
            remote,
        });
    }

    let wire: WireIn =
        serde_json::from_value(value).map_err(|e| LinkError::Decoding(e.to_string()))?;
    let payload = match wire.payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    let kind = MessageKind::parse(&wire.kind);
    let payload = match &kind {
        MessageKind::Input => Payload::Input(typed(&kind, payload)?),
        MessageKind::Hello => Payload::Hello(typed(&kind, payload)?),
        MessageKind::Status => Payload::Status(typed(&kind, payload)?),
        MessageKind::Error => Payload::Error(typed(&kind, payload)?),
        MessageKind::Ping => Payload::Ping(typed(&kind, payload)?),
        MessageKind::Pong => Payload::Pong(typed(&kind, payload)?),
        MessageKind::Unknown(name) => Payload::Unknown {
            kind: name.clone(),
            raw: payload,
        },
    };

    Ok(Envelope {
        protocol_version: remote,
        message_id: wire.message_id,
        payload,
    })
}
