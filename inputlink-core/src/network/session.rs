//! One receiver-side client session.
//!
//! A session owns its [`Connection`] and the set of controller numbers
//! it currently drives. It ends when the peer disconnects, when nothing
//! arrives for `session_timeout` (stale), when a reply cannot be written
//! within `session_timeout`, on a framing or version error, or when the
//! server stops. However it ends, every number it still owns
//! is released in the registry before the task finishes.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::device::{DeviceRegistry, DispatchOutcome, VirtualDeviceCapability};
use crate::envelope::{Envelope, Payload};
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent, SessionId};
use crate::network::connection::Connection;
use crate::protocol::{
    ErrorCode, ErrorPayload, Health, HelloPayload, PongPayload, StatusPayload,
};
use crate::sample::ControllerSample;

/// Public view of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub sender_name: Option<String>,
    pub connected_at: Instant,
}

/// State shared by every session of one server.
pub(crate) struct SessionShared<C: VirtualDeviceCapability> {
    pub registry: Arc<DeviceRegistry<C>>,
    pub sessions: DashMap<SessionId, SessionInfo>,
    pub events: EventBus,
    pub session_timeout: Duration,
}

impl<C: VirtualDeviceCapability> SessionShared<C> {
    /// Counts and health as reported in STATUS.
    pub fn status(&self) -> StatusPayload {
        let stats = self.registry.stats();
        StatusPayload {
            active_devices: u32::try_from(stats.active).unwrap_or(u32::MAX),
            live_sessions: u32::try_from(self.sessions.len()).unwrap_or(u32::MAX),
            rejected_total: stats.rejected_total,
            health: if stats.live > stats.active {
                Health::Degraded
            } else {
                Health::Ok
            },
            ..Default::default()
        }
    }
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    Stopped,
    Stale,
    Closed(LinkError),
}

pub(crate) struct Session<C: VirtualDeviceCapability> {
    id: SessionId,
    conn: Connection,
    shared: Arc<SessionShared<C>>,
    owned: BTreeSet<u32>,
    /// Numbers already answered with NOT_OWNER / DEVICE_LIMIT.
    not_owner_reported: BTreeSet<u32>,
    limit_reported: BTreeSet<u32>,
    invalid_samples: u64,
    cancel: CancellationToken,
}

impl<C: VirtualDeviceCapability> Session<C> {
    /// Register the session in the shared table.
    pub fn new(
        id: SessionId,
        conn: Connection,
        shared: Arc<SessionShared<C>>,
        cancel: CancellationToken,
    ) -> Self {
        shared.sessions.insert(
            id,
            SessionInfo {
                id,
                peer: conn.peer(),
                sender_name: None,
                connected_at: Instant::now(),
            },
        );
        Self {
            id,
            conn,
            shared,
            owned: BTreeSet::new(),
            not_owner_reported: BTreeSet::new(),
            limit_reported: BTreeSet::new(),
            invalid_samples: 0,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let peer = self.conn.peer();
        info!("session {} opened from {peer}", self.id);
        self.shared.events.publish(LinkEvent::SessionOpened {
            session: self.id,
            peer,
        });

        let end = self.serve().await;

        let released = self.release_all();
        self.shared.sessions.remove(&self.id);
        match &end {
            SessionEnd::Stale => {
                warn!(
                    "session {} stale after {:?}, released {released} controller(s)",
                    self.id, self.shared.session_timeout
                );
                self.shared
                    .events
                    .publish(LinkEvent::SessionStale { session: self.id });
            }
            SessionEnd::Stopped => debug!("session {} stopped", self.id),
            SessionEnd::Closed(e) => info!("session {} closed: {e}", self.id),
        }
        if self.invalid_samples > 0 {
            debug!(
                "session {} sent {} invalid sample(s)",
                self.id, self.invalid_samples
            );
        }
        self.shared
            .events
            .publish(LinkEvent::SessionClosed { session: self.id });
        // On server stop the socket is dropped without waiting on the peer.
        if !self.cancel.is_cancelled() {
            let limit = self.shared.session_timeout;
            if tokio::time::timeout(limit, self.conn.close()).await.is_err() {
                debug!("session {}: close did not flush within {limit:?}", self.id);
            }
        }
    }

    async fn serve(&mut self) -> SessionEnd {
        let timeout = self.shared.session_timeout;
        let cancel = self.cancel.clone();
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return SessionEnd::Stopped,

                _ = sleep_until(last_seen + timeout) => return SessionEnd::Stale,

                received = self.conn.recv() => match received {
                    Ok(envelope) => {
                        last_seen = Instant::now();
                        if let Err(e) = self.handle(envelope).await {
                            return SessionEnd::Closed(e);
                        }
                    }
                    Err(e @ LinkError::IncompatibleVersion { .. }) => {
                        let error = ErrorPayload::new(ErrorCode::IncompatibleVersion, e.to_string());
                        let _ = self.reply(&Envelope::error(error)).await;
                        return SessionEnd::Closed(e);
                    }
                    Err(e) if e.is_fatal_to_connection() => return SessionEnd::Closed(e),
                    Err(e) => {
                        last_seen = Instant::now();
                        debug!("session {}: {e}", self.id);
                        let error = ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string());
                        if let Err(e) = self.reply(&Envelope::error(error)).await {
                            return SessionEnd::Closed(e);
                        }
                    }
                },
            }
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<(), LinkError> {
        let message_id = envelope.message_id;
        match envelope.payload {
            Payload::Input(sample) => self.on_input(sample).await,
            Payload::Hello(hello) => self.on_hello(message_id, hello).await,
            Payload::Ping(ping) => self.reply(&Envelope::pong(PongPayload::from(ping))).await,
            Payload::Status(status) => {
                if status.overflow_total > 0 {
                    debug!(
                        "session {}: sender reports {} evicted envelope(s)",
                        self.id, status.overflow_total
                    );
                }
                let mut reply = self.shared.status().with_accepted(&self.owned);
                reply.in_reply_to = Some(message_id);
                self.reply(&Envelope::status(reply)).await
            }
            Payload::Pong(pong) => {
                trace!("session {}: pong {}", self.id, pong.nonce);
                Ok(())
            }
            Payload::Error(error) => {
                warn!(
                    "session {}: peer reported {:?}: {}",
                    self.id, error.code, error.description
                );
                Ok(())
            }
            Payload::Unknown { kind, .. } => {
                debug!("session {}: ignoring unknown kind {kind:?}", self.id);
                Ok(())
            }
        }
    }

    /// Reconcile ownership with the full claimed set, then acknowledge.
    async fn on_hello(&mut self, message_id: u64, hello: HelloPayload) -> Result<(), LinkError> {
        let claimed = hello.claimed_set();
        info!(
            "session {}: HELLO from {:?} claiming {claimed:?}",
            self.id, hello.sender_name
        );
        if let Some(mut info) = self.shared.sessions.get_mut(&self.id) {
            info.sender_name = Some(hello.sender_name.clone());
        }

        let registry = &self.shared.registry;
        for n in self.owned.difference(&claimed) {
            registry.release(*n, self.id);
        }
        for n in &claimed {
            if let Some(previous) = registry.claim(*n, self.id) {
                info!(
                    "controller {n}: revoked from session {previous} by session {}",
                    self.id
                );
            }
            self.not_owner_reported.remove(n);
            self.limit_reported.remove(n);
        }
        self.owned = claimed;

        let mut ack = self.shared.status().with_accepted(&self.owned);
        ack.in_reply_to = Some(message_id);
        self.reply(&Envelope::status(ack)).await
    }

    async fn on_input(&mut self, sample: ControllerSample) -> Result<(), LinkError> {
        let n = sample.controller_number;
        if let Err(e) = sample.validate() {
            self.invalid_samples += 1;
            debug!("session {}: invalid sample: {e}", self.id);
            let mut error = ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string());
            if n >= 1 {
                error = error.for_controller(n);
            }
            return self.reply(&Envelope::error(error)).await;
        }

        match self.shared.registry.dispatch(self.id, &sample) {
            DispatchOutcome::Created | DispatchOutcome::Applied => {
                self.owned.insert(n);
                self.not_owner_reported.remove(&n);
                self.limit_reported.remove(&n);
                Ok(())
            }
            DispatchOutcome::NotOwner => {
                self.owned.remove(&n);
                if self.not_owner_reported.insert(n) {
                    let error = ErrorPayload::new(
                        ErrorCode::NotOwner,
                        format!("controller {n} is owned by another session"),
                    )
                    .for_controller(n);
                    self.reply(&Envelope::error(error)).await?;
                }
                Ok(())
            }
            DispatchOutcome::Rejected => {
                if self.limit_reported.insert(n) {
                    let error = ErrorPayload::new(
                        ErrorCode::DeviceLimit,
                        format!(
                            "virtual device limit {} reached",
                            self.shared.registry.max_devices()
                        ),
                    )
                    .for_controller(n);
                    self.reply(&Envelope::error(error)).await?;
                }
                Ok(())
            }
            DispatchOutcome::Duplicate
            | DispatchOutcome::Cooldown
            | DispatchOutcome::CreateFailed
            | DispatchOutcome::ApplyFailed
            | DispatchOutcome::Closed
            | DispatchOutcome::Invalid => Ok(()),
        }
    }

    /// Send one reply. A peer that stops reading cannot hold the session
    /// past `session_timeout` or past server stop.
    async fn reply(&mut self, envelope: &Envelope) -> Result<(), LinkError> {
        let limit = self.shared.session_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(LinkError::ConnectionClosed),
            sent = tokio::time::timeout(limit, self.conn.send(envelope)) => {
                sent.map_err(|_| LinkError::Timeout(limit))?
            }
        }
    }

    /// Release every number this session owns.
    fn release_all(&mut self) -> usize {
        let registry = &self.shared.registry;
        let mut numbers = std::mem::take(&mut self.owned);
        numbers.extend(registry.owned_by(self.id));
        numbers
            .into_iter()
            .filter(|n| registry.release(*n, self.id))
            .count()
    }
}
