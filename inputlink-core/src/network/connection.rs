//! Framed TCP transport shared by both ends of the link.
//!
//! A [`Connection`] moves whole [`Envelope`]s over one socket using the
//! [`LinkCodec`] frame format. [`Endpoint`] names the address a sender
//! dials.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::codec::LinkCodec;
use crate::envelope::{self, Envelope};
use crate::error::LinkError;

/// One framed TCP connection carrying [`Envelope`]s.
///
/// Reads are cancel-safe: a partially received frame stays in the codec
/// buffer when a `recv` future is dropped, so `recv` can be raced in a
/// `select!` against timers and other sources.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, LinkCodec>,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self, LinkError> {
        let peer = stream.peer_addr()?;
        // Samples are small and latency-bound.
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, LinkCodec),
            peer,
        })
    }

    /// Connect to `endpoint`, giving up after `timeout`.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, LinkError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.to_string()))
            .await
            .map_err(|_| LinkError::Timeout(timeout))??;
        Self::new(stream)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Encode and send one envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), LinkError> {
        let bytes = envelope::encode(envelope)?;
        trace!("→ {} {} ({} bytes)", self.peer, envelope.kind(), bytes.len());
        self.framed.send(bytes).await
    }

    /// Send an already encoded envelope.
    pub async fn send_encoded(&mut self, bytes: bytes::Bytes) -> Result<(), LinkError> {
        self.framed.send(bytes).await
    }

    /// Receive the next envelope.
    ///
    /// End of stream is [`LinkError::ConnectionClosed`]. A frame whose
    /// payload fails to decode yields the decode error; the stream itself
    /// stays usable unless [`LinkError::is_fatal_to_connection`] says so.
    pub async fn recv(&mut self) -> Result<Envelope, LinkError> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or(LinkError::ConnectionClosed)??;
        let envelope = envelope::decode(&frame)?;
        trace!("← {} {}", self.peer, envelope.kind());
        Ok(envelope)
    }

    /// Flush and shut down the write half.
    pub async fn close(mut self) {
        let _ = self.framed.close().await;
    }
}

// ── Endpoint ─────────────────────────────────────────────────────

/// Host and port of a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
