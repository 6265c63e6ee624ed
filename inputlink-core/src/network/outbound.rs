//! Sender-side reconnecting link.
//!
//! One background task owns the TCP connection and walks the
//! [`ConnectionState`] machine:
//!
//! ```text
//!  Disconnected ─start─► Connecting ─HELLO acked─► Connected
//!                           ▲                          │ send/recv failure
//!                           └──── BackoffWait(d) ◄─────┘
//! ```
//!
//! While connected it drains the [`OutboundQueue`] strictly in FIFO
//! order, re-sends HELLO whenever the capture side's claim set changes and
//! pings the receiver every keepalive interval. The capture path only
//! ever touches the queue, so it is never slowed down by the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::capture::ClaimSet;
use crate::config::{SenderConfig, TimeoutConfig};
use crate::envelope::{Envelope, Payload};
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent};
use crate::network::connection::{Connection, Endpoint};
use crate::protocol::{ErrorCode, HelloPayload, PongPayload, StatusPayload};
use crate::queue::{OutboundQueue, QueuedEnvelope};
use crate::state::ConnectionState;

// ── LinkStats ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LinkStats {
    sent: AtomicU64,
    dropped_stale: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
}

/// Counters of an [`OutboundLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSnapshot {
    /// Envelopes written to the socket.
    pub sent: u64,
    /// Envelopes evicted from the full queue.
    pub overflow: u64,
    /// In-flight envelopes dropped after a failed send because they were
    /// too old to retry.
    pub dropped_stale: u64,
    /// Successful handshakes after the first one.
    pub reconnects: u64,
    pub connect_failures: u64,
    pub queued: usize,
}

// ── OutboundLink ─────────────────────────────────────────────────

/// Handle to the running link task.
pub struct OutboundLink {
    queue: Arc<OutboundQueue>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl OutboundLink {
    /// Spawn the link task. It starts connecting immediately.
    ///
    /// `claims` is the set of controller numbers announced in HELLO; every
    /// change is re-announced while connected.
    pub fn start(
        config: &SenderConfig,
        queue: Arc<OutboundQueue>,
        claims: watch::Receiver<ClaimSet>,
        events: EventBus,
    ) -> Self {
        let driver = LinkDriver::new(config, Arc::clone(&queue), claims, events);
        let state = driver.state_tx.subscribe();
        let stats = Arc::clone(&driver.stats);
        let cancel = driver.cancel.clone();
        let task = tokio::spawn(driver.run());

        Self {
            queue,
            state,
            stats,
            cancel,
            task: Some(task),
            stop_grace: config.timeouts.stop_grace(),
        }
    }

    /// Encode and queue an envelope. Never waits; a full queue evicts its
    /// oldest entry.
    pub fn enqueue(&self, envelope: &Envelope) -> Result<(), LinkError> {
        let queued = QueuedEnvelope::encode(envelope)?;
        if self.queue.push(queued).is_some() {
            trace!("outbound queue full, evicted oldest");
        }
        Ok(())
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> LinkSnapshot {
        LinkSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            overflow: self.queue.overflow_count(),
            dropped_stale: self.stats.dropped_stale.load(Ordering::Relaxed),
            reconnects: self
                .stats
                .connects
                .load(Ordering::Relaxed)
                .saturating_sub(1),
            connect_failures: self.stats.connect_failures.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }

    /// Halt the drain loop, close the connection and discard the queue.
    ///
    /// In-flight envelopes are not guaranteed to be delivered. The task
    /// gets `stop_grace` to wind down before it is aborted.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.stop_grace, &mut task).await.is_err() {
                warn!("link task did not stop within {:?}, aborting", self.stop_grace);
                task.abort();
            }
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("discarded {dropped} queued envelope(s)");
        }
    }
}

impl Drop for OutboundLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── LinkDriver ───────────────────────────────────────────────────

/// Why a connected period ended.
enum Disconnect {
    Cancelled,
    Failed(LinkError),
}

struct LinkDriver {
    endpoint: Endpoint,
    sender_name: String,
    timeouts: TimeoutConfig,
    backoff: Backoff,
    queue: Arc<OutboundQueue>,
    claims: watch::Receiver<ClaimSet>,
    /// Cleared once the claim-set publisher is gone.
    claims_open: bool,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
    ping_nonce: u64,
    reported_overflow: u64,
}

impl LinkDriver {
    fn new(
        config: &SenderConfig,
        queue: Arc<OutboundQueue>,
        claims: watch::Receiver<ClaimSet>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint: Endpoint::new(config.receiver_host.clone(), config.receiver_port),
            sender_name: config.sender_name.clone(),
            timeouts: config.timeouts.clone(),
            backoff: Backoff::new(config.backoff.policy()),
            queue,
            claims,
            claims_open: true,
            state: ConnectionState::Disconnected,
            state_tx,
            events,
            stats: Arc::new(LinkStats::default()),
            cancel: CancellationToken::new(),
            ping_nonce: 0,
            reported_overflow: 0,
        }
    }

    fn transition(
        &mut self,
        f: impl FnOnce(&mut ConnectionState) -> Result<(), LinkError>,
    ) {
        match f(&mut self.state) {
            Ok(()) => {
                debug!("link → {}", self.state);
                self.state_tx.send_replace(self.state.clone());
                self.events.publish(LinkEvent::LinkState(self.state.clone()));
            }
            Err(e) => warn!("link state {}: {e}", self.state),
        }
    }

    async fn run(mut self) {
        info!("link to {} starting", self.endpoint);
        let cancel = self.cancel.clone();
        loop {
            self.transition(ConnectionState::begin_connect);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.connect() => r,
            };

            match attempt {
                Ok(conn) => {
                    self.stats.connects.fetch_add(1, Ordering::Relaxed);
                    self.transition(ConnectionState::complete_handshake);
                    info!("connected to {}", self.endpoint);

                    let since = Instant::now();
                    let ended = self.drive(conn).await;
                    let up = since.elapsed();
                    if self.backoff.record_connected(up) {
                        debug!("connection was stable for {up:?}, backoff reset");
                    }
                    match ended {
                        Disconnect::Cancelled => break,
                        Disconnect::Failed(e) => {
                            warn!("connection to {} lost after {up:?}: {e}", self.endpoint)
                        }
                    }
                }
                Err(e) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("connect to {} failed: {e}", self.endpoint);
                }
            }

            let delay = self.backoff.next_delay();
            self.transition(|s| s.fail(delay));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.state.force_disconnect();
        self.state_tx.send_replace(self.state.clone());
        self.events.publish(LinkEvent::LinkState(self.state.clone()));
        info!("link to {} stopped", self.endpoint);
    }

    /// TCP connect plus HELLO → STATUS ack.
    async fn connect(&mut self) -> Result<Connection, LinkError> {
        let mut conn = Connection::connect(&self.endpoint, self.timeouts.connect()).await?;

        let hello = self.hello();
        let hello_id = hello.message_id;
        conn.send(&hello).await?;

        let handshake = self.timeouts.handshake();
        tokio::time::timeout(handshake, Self::await_ack(&mut conn, hello_id))
            .await
            .map_err(|_| LinkError::Timeout(handshake))??;
        Ok(conn)
    }

    /// Build HELLO from the current claim set. Queued INPUT for numbers
    /// the set no longer holds is discarded first, so a released
    /// controller cannot be re-claimed by its own backlog.
    fn hello(&mut self) -> Envelope {
        let claimed = self.claims.borrow_and_update().clone();
        let purged = self.queue.purge_unclaimed(&claimed);
        if purged > 0 {
            debug!("discarded {purged} queued envelope(s) for released controllers");
        }
        debug!("announcing controllers {claimed:?}");
        Envelope::hello(HelloPayload::new(self.sender_name.as_str(), &claimed))
    }

    async fn await_ack(conn: &mut Connection, hello_id: u64) -> Result<(), LinkError> {
        loop {
            let envelope = match conn.recv().await {
                Ok(envelope) => envelope,
                Err(e) if e.is_fatal_to_connection() => return Err(e),
                Err(e) => {
                    debug!("ignoring undecodable envelope during handshake: {e}");
                    continue;
                }
            };
            match envelope.payload {
                Payload::Status(status) if status.in_reply_to == Some(hello_id) => {
                    debug!("HELLO acknowledged, accepted {:?}", status.accepted);
                    return Ok(());
                }
                Payload::Error(error) => {
                    return Err(LinkError::Handshake(format!(
                        "{:?}: {}",
                        error.code, error.description
                    )));
                }
                _ => {}
            }
        }
    }

    /// Connected loop. Returns when the connection fails or the link is
    /// cancelled.
    async fn drive(&mut self, mut conn: Connection) -> Disconnect {
        let keepalive = self.timeouts.keepalive();
        let dead_after = self.timeouts.dead_after();
        let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    conn.close().await;
                    return Disconnect::Cancelled;
                }

                received = conn.recv() => match received {
                    Ok(envelope) => {
                        last_heard = Instant::now();
                        match self.handle_inbound(envelope) {
                            Ok(Some(reply)) => {
                                if let Err(e) = conn.send(&reply).await {
                                    return Disconnect::Failed(e);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => return Disconnect::Failed(e),
                        }
                    }
                    Err(e) if e.is_fatal_to_connection() => return Disconnect::Failed(e),
                    Err(e) => {
                        last_heard = Instant::now();
                        debug!("ignoring undecodable envelope: {e}");
                    }
                },

                changed = self.claims.changed(), if self.claims_open => match changed {
                    Ok(()) => {
                        let hello = self.hello();
                        if let Err(e) = conn.send(&hello).await {
                            return Disconnect::Failed(e);
                        }
                    }
                    Err(_) => self.claims_open = false,
                },

                _ = ping.tick() => {
                    if let Err(e) = self.keepalive(&mut conn).await {
                        return Disconnect::Failed(e);
                    }
                }

                _ = sleep_until(last_heard + dead_after) => {
                    return Disconnect::Failed(LinkError::Timeout(dead_after));
                }

                item = self.queue.pop() => {
                    if let Err(e) = self.transmit(&mut conn, item).await {
                        return Disconnect::Failed(e);
                    }
                }
            }
        }
    }

    /// Send one queued envelope. On failure the envelope goes back to the
    /// head of the queue, unless it is too old to be worth retrying.
    async fn transmit(
        &mut self,
        conn: &mut Connection,
        item: QueuedEnvelope,
    ) -> Result<(), LinkError> {
        match conn.send_encoded(item.bytes.clone()).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let max_age = self.timeouts.max_in_flight_age();
                if item.age() > max_age {
                    self.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping in-flight {} older than {max_age:?}", item.kind);
                } else if !self.queue.requeue_front(item) {
                    debug!("queue refilled during send, in-flight envelope dropped");
                }
                Err(e)
            }
        }
    }

    async fn keepalive(&mut self, conn: &mut Connection) -> Result<(), LinkError> {
        self.ping_nonce = self.ping_nonce.wrapping_add(1);
        conn.send(&Envelope::ping(self.ping_nonce)).await?;

        let overflow = self.queue.overflow_count();
        if overflow != self.reported_overflow {
            self.reported_overflow = overflow;
            let status = StatusPayload {
                overflow_total: overflow,
                ..Default::default()
            };
            conn.send(&Envelope::status(status)).await?;
        }
        Ok(())
    }

    /// React to one envelope from the receiver. Returns a reply to send.
    fn handle_inbound(&mut self, envelope: Envelope) -> Result<Option<Envelope>, LinkError> {
        match envelope.payload {
            Payload::Pong(pong) => {
                trace!("pong {}", pong.nonce);
                Ok(None)
            }
            Payload::Ping(ping) => Ok(Some(Envelope::pong(PongPayload::from(ping)))),
            Payload::Status(status) => {
                debug!(
                    "receiver status: {} active, {} session(s), accepted {:?}",
                    status.active_devices, status.live_sessions, status.accepted
                );
                Ok(None)
            }
            Payload::Error(error) => match error.code {
                ErrorCode::IncompatibleVersion => Err(LinkError::Handshake(format!(
                    "receiver rejected protocol version: {}",
                    error.description
                ))),
                code => {
                    match error.controller_number {
                        Some(n) => warn!("receiver error {code:?} on controller {n}: {}", error.description),
                        None => warn!("receiver error {code:?}: {}", error.description),
                    }
                    Ok(None)
                }
            },
            Payload::Unknown { kind, .. } => {
                debug!("ignoring envelope of unknown kind {kind:?}");
                Ok(None)
            }
            other => {
                debug!("unexpected {} from receiver", other.kind());
                Ok(None)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
