//! Receiver-side multi-session server.
//!
//! Accepts any number of concurrent senders, one task per session, all
//! sharing a single [`DeviceRegistry`]. Stopping the server closes the
//! listener, ends every session and then destroys every live device
//! before `stop` returns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::device::{DeviceRegistry, VirtualDeviceCapability};
use crate::error::LinkError;
use crate::events::{EventBus, SessionId};
use crate::network::connection::Connection;
use crate::network::session::{Session, SessionInfo, SessionShared};
use crate::protocol::StatusPayload;

pub struct InboundServer<C: VirtualDeviceCapability> {
    shared: Arc<SessionShared<C>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
}

impl<C: VirtualDeviceCapability> InboundServer<C> {
    /// Bind the listener and start accepting sessions.
    pub async fn bind(
        config: &ReceiverConfig,
        registry: Arc<DeviceRegistry<C>>,
        events: EventBus,
    ) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!("receiver listening on {local_addr}");

        let shared = Arc::new(SessionShared {
            registry,
            sessions: DashMap::new(),
            events,
            session_timeout: config.session_timeout(),
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            config.max_sessions,
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            shared,
            local_addr,
            cancel,
            tracker,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry<C>> {
        &self.shared.registry
    }

    pub fn live_sessions(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Live sessions ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut out: Vec<_> = self
            .shared
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// The STATUS this server would report right now.
    pub fn status(&self) -> StatusPayload {
        self.shared.status()
    }

    /// Close the listener and every session, then destroy all devices.
    ///
    /// Returns the number of devices destroyed by the final sweep (sessions
    /// release their own devices as they end).
    pub async fn stop(&mut self) -> usize {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        let released = self.shared.registry.shutdown();
        info!("receiver stopped");
        released
    }
}

impl<C: VirtualDeviceCapability> Drop for InboundServer<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<C: VirtualDeviceCapability>(
    listener: TcpListener,
    shared: Arc<SessionShared<C>>,
    max_sessions: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let next_id = AtomicU64::new(1);
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            },
        };

        if max_sessions > 0 && shared.sessions.len() >= max_sessions {
            warn!("refusing {peer}: {max_sessions} session(s) already connected");
            drop(stream);
            continue;
        }

        let conn = match Connection::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("could not set up connection from {peer}: {e}");
                continue;
            }
        };
        let id: SessionId = next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, conn, Arc::clone(&shared), cancel.child_token());
        tracker.spawn(session.run());
    }
    debug!("accept loop ended");
}
