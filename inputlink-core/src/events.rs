//! Status notifications.
//!
//! Components publish [`LinkEvent`]s on a shared [`EventBus`]; any number
//! of observers (a GUI, a log sink, tests) subscribe independently. A
//! slow observer lags and loses events, it never back-pressures the
//! publisher.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::state::ConnectionState;

/// Default number of events buffered per observer.
pub const EVENT_BUFFER: usize = 256;

/// Receiver-side session identifier.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    // ── Sender ───────────────────────────────────────────────────
    /// The outbound link changed state.
    LinkState(ConnectionState),
    /// The outbound queue evicted its oldest entry.
    QueueOverflow { total: u64 },
    /// A controller stopped answering polls.
    ControllerDisconnected { controller_number: u32 },
    /// A previously failing controller answers again.
    ControllerReconnected { controller_number: u32 },

    // ── Receiver ─────────────────────────────────────────────────
    SessionOpened { session: SessionId, peer: SocketAddr },
    SessionClosed { session: SessionId },
    SessionStale { session: SessionId },
    DeviceCreated { controller_number: u32 },
    DeviceReleased { controller_number: u32 },
    DeviceRejected { controller_number: u32 },
    DeviceErrored { controller_number: u32, reason: String },
}

/// Broadcast channel for [`LinkEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no observers is not an error.
    pub fn publish(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_observer_sees_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.observer_count(), 2);

        bus.publish(LinkEvent::DeviceCreated {
            controller_number: 1,
        });

        assert_eq!(
            a.recv().await.unwrap(),
            LinkEvent::DeviceCreated {
                controller_number: 1
            }
        );
        assert_eq!(
            b.recv().await.unwrap(),
            LinkEvent::DeviceCreated {
                controller_number: 1
            }
        );
    }

    #[test]
    fn publish_without_observers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(LinkEvent::QueueOverflow { total: 1 });
    }
}
