//! Bounded outbound FIFO between the capture scheduler and the link.
//!
//! Single producer (capture), single consumer (drain loop). Pushing never
//! blocks: at capacity the oldest entry is evicted and the overflow
//! counter is incremented, so a long disconnection costs at most
//! `capacity` encoded envelopes of memory and the freshest input wins.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::envelope::{self, Envelope};
use crate::error::LinkError;
use crate::message::MessageKind;

/// Default queue capacity (about 16 s of one controller at 60 Hz).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

// ── QueuedEnvelope ───────────────────────────────────────────────

/// An encoded envelope waiting to be transmitted.
#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub bytes: Bytes,
    pub kind: MessageKind,
    /// `(controller_number, sequence)` for INPUT envelopes.
    pub controller: Option<(u32, u64)>,
    pub enqueued_at: Instant,
}

impl QueuedEnvelope {
    /// Encode `envelope` for queuing.
    pub fn encode(envelope: &Envelope) -> Result<Self, LinkError> {
        Ok(Self {
            bytes: envelope::encode(envelope)?,
            kind: envelope.kind(),
            controller: envelope.controller_key(),
            enqueued_at: Instant::now(),
        })
    }

    /// Time spent since the envelope was queued.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

// ── OutboundQueue ────────────────────────────────────────────────

pub struct OutboundQueue {
    items: Mutex<VecDeque<QueuedEnvelope>>,
    capacity: usize,
    notify: Notify,
    overflow: AtomicU64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            overflow: AtomicU64::new(0),
        }
    }

    /// Append an entry. Returns the evicted oldest entry when full.
    pub fn push(&self, item: QueuedEnvelope) -> Option<QueuedEnvelope> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        if evicted.is_some() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Put an in-flight entry back at the head after a failed send.
    ///
    /// If the queue filled up meanwhile, the entry is older than every
    /// queued one and is dropped as an overflow instead.
    pub fn requeue_front(&self, item: QueuedEnvelope) -> bool {
        let requeued = {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                false
            } else {
                items.push_front(item);
                true
            }
        };
        if requeued {
            self.notify.notify_one();
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        requeued
    }

    /// Take the head entry without waiting.
    pub fn try_pop(&self) -> Option<QueuedEnvelope> {
        self.items.lock().pop_front()
    }

    /// Wait for and take the head entry.
    pub async fn pop(&self) -> QueuedEnvelope {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Discard every queued entry, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }

    /// Keep only the entries for which `keep` returns true, preserving
    /// order. Returns how many were removed.
    pub fn retain(&self, mut keep: impl FnMut(&QueuedEnvelope) -> bool) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| keep(item));
        before - items.len()
    }

    /// Drop queued INPUT for controller numbers outside `claimed`.
    /// Non-INPUT entries are kept.
    pub fn purge_unclaimed(&self, claimed: &BTreeSet<u32>) -> usize {
        self.retain(|item| match item.controller {
            Some((number, _)) => claimed.contains(&number),
            None => true,
        })
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted (or dropped on requeue) since creation.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Snapshot of the queued `(controller_number, sequence)` keys.
    pub fn controller_keys(&self) -> Vec<Option<(u32, u64)>> {
        self.items.lock().iter().map(|i| i.controller).collect()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
