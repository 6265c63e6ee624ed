//! Fixed-rate capture scheduler (sender side).
//!
//! Each tick polls every enabled controller through a [`HardwareSource`],
//! filters the raw axes, stamps a per-controller sequence and the capture
//! time, then encodes an INPUT envelope straight into the
//! [`OutboundQueue`]. The loop never waits on the network: the queue is
//! the only thing shared with the outbound link, plus the claim-set
//! `watch` channel the link turns into HELLO messages.
//!
//! Ticks follow an absolute schedule `start + k·interval`. When the loop
//! falls more than one interval behind, the missed ticks are skipped and
//! counted instead of being fired back to back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SenderConfig;
use crate::envelope::Envelope;
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent};
use crate::queue::{OutboundQueue, QueuedEnvelope};
use crate::sample::{AxisFilter, ControllerSample, InputMethod, RawControllerState};

/// Controller numbers the sender currently claims.
pub type ClaimSet = BTreeSet<u32>;

/// Log a queue overflow on the first eviction and then every this many.
const OVERFLOW_LOG_EVERY: u64 = 1000;

// ── HardwareSource ───────────────────────────────────────────────

/// Reads raw controller state. Implemented outside the core.
pub trait HardwareSource: Send + 'static {
    /// Read the current state of `controller_id`.
    ///
    /// Returns [`LinkError::HardwareUnavailable`] when the device cannot be
    /// read (unplugged, driver error).
    fn poll(&mut self, controller_id: &str) -> Result<RawControllerState, LinkError>;
}

impl<F> HardwareSource for F
where
    F: FnMut(&str) -> Result<RawControllerState, LinkError> + Send + 'static,
{
    fn poll(&mut self, controller_id: &str) -> Result<RawControllerState, LinkError> {
        self(controller_id)
    }
}

// ── TickSchedule ─────────────────────────────────────────────────

/// Absolute tick schedule with skip-ahead.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    start: Instant,
    interval: Duration,
    next_index: u64,
    skipped: u64,
}

impl TickSchedule {
    pub fn new(start: Instant, interval: Duration) -> Self {
        Self {
            start,
            interval: interval.max(Duration::from_micros(1)),
            next_index: 0,
            skipped: 0,
        }
    }

    /// Deadline of tick `k`.
    pub fn deadline(&self, k: u64) -> Instant {
        let nanos = self.interval.as_nanos().saturating_mul(u128::from(k));
        self.start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Claim the next tick given the current time and return its deadline.
    ///
    /// If `now` is more than one interval past the next deadline, jump to
    /// the slot `now` falls in; the ticks in between are skipped.
    pub fn next(&mut self, now: Instant) -> Instant {
        let mut index = self.next_index;
        if now > self.deadline(index) + self.interval {
            let elapsed = now.duration_since(self.start).as_nanos();
            let current = u64::try_from(elapsed / self.interval.as_nanos()).unwrap_or(u64::MAX);
            self.skipped += current.saturating_sub(index);
            index = current;
        }
        self.next_index = index.saturating_add(1);
        self.deadline(index)
    }

    /// Ticks skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

// ── CaptureStats ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub ticks: AtomicU64,
    pub samples: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub suppressed: AtomicU64,
    pub validation_failures: AtomicU64,
    pub hardware_failures: AtomicU64,
}

/// Plain copy of [`CaptureStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureSnapshot {
    pub ticks: u64,
    pub samples: u64,
    pub skipped_ticks: u64,
    pub suppressed: u64,
    pub validation_failures: u64,
    pub hardware_failures: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            hardware_failures: self.hardware_failures.load(Ordering::Relaxed),
        }
    }
}

// ── CaptureScheduler ─────────────────────────────────────────────

#[derive(Debug)]
struct ControllerSlot {
    controller_id: String,
    number: u32,
    input_method: InputMethod,
    next_sequence: u64,
    connected: bool,
    last_sent: Option<ControllerSample>,
    ticks_since_send: u32,
}

pub struct CaptureScheduler<H: HardwareSource> {
    source: H,
    controllers: Vec<ControllerSlot>,
    filter: AxisFilter,
    interval: Duration,
    /// `Some(idle_resend_ticks)` when only changed states are emitted.
    change_filter: Option<u32>,
    queue: Arc<OutboundQueue>,
    claims: watch::Sender<ClaimSet>,
    events: EventBus,
    stats: Arc<CaptureStats>,
    started: Instant,
}

impl<H: HardwareSource> CaptureScheduler<H> {
    /// Build a scheduler for the enabled controllers of `config`.
    ///
    /// Every enabled controller starts out claimed.
    pub fn new(
        config: &SenderConfig,
        source: H,
        queue: Arc<OutboundQueue>,
        events: EventBus,
    ) -> Self {
        let controllers: Vec<_> = config
            .enabled_controllers()
            .map(|c| ControllerSlot {
                controller_id: c.controller_id.clone(),
                number: c.assigned_number,
                input_method: c.input_method,
                next_sequence: 1,
                connected: true,
                last_sent: None,
                ticks_since_send: 0,
            })
            .collect();
        let claimed: ClaimSet = controllers.iter().map(|c| c.number).collect();
        let (claims, _) = watch::channel(claimed);

        Self {
            source,
            controllers,
            filter: config.axis_filter(),
            interval: config.tick_interval(),
            change_filter: config
                .send_on_change_only
                .then_some(config.idle_resend_ticks.max(1)),
            queue,
            claims,
            events,
            stats: Arc::new(CaptureStats::default()),
            started: Instant::now(),
        }
    }

    /// Observe the claim set. The outbound link sends a HELLO whenever
    /// it changes.
    pub fn claims(&self) -> watch::Receiver<ClaimSet> {
        self.claims.subscribe()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one capture pass over every controller. Returns the number of
    /// samples enqueued.
    pub fn tick(&mut self) -> usize {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        let capture_time_us =
            u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let mut enqueued = 0;

        for i in 0..self.controllers.len() {
            let polled = self.source.poll(&self.controllers[i].controller_id);
            let raw = match polled {
                Ok(raw) => {
                    self.mark_connected(i);
                    raw
                }
                Err(e) => {
                    self.stats.hardware_failures.fetch_add(1, Ordering::Relaxed);
                    self.mark_disconnected(i, &e);
                    continue;
                }
            };
            if self.capture_one(i, &raw, capture_time_us) {
                enqueued += 1;
            }
        }
        enqueued
    }

    fn capture_one(&mut self, i: usize, raw: &RawControllerState, capture_time_us: u64) -> bool {
        let filter = self.filter;
        let change_filter = self.change_filter;
        let slot = &mut self.controllers[i];

        let sample = ControllerSample::from_raw(
            slot.number,
            slot.controller_id.as_str(),
            slot.input_method,
            raw,
            &filter,
            slot.next_sequence,
            capture_time_us,
        );

        if let (Some(idle_resend), Some(last)) = (change_filter, slot.last_sent.as_ref()) {
            slot.ticks_since_send = slot.ticks_since_send.saturating_add(1);
            if !sample.state_differs(last) && slot.ticks_since_send < idle_resend {
                self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let number = slot.number;
        let queued = match QueuedEnvelope::encode(&Envelope::input(sample.clone())) {
            Ok(queued) => queued,
            Err(e) => {
                self.stats
                    .validation_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!("controller {number}: sample rejected: {e}");
                return false;
            }
        };

        slot.next_sequence += 1;
        slot.ticks_since_send = 0;
        slot.last_sent = Some(sample);
        trace!(
            "controller {number}: enqueued seq {}",
            slot.next_sequence - 1
        );

        if self.queue.push(queued).is_some() {
            let total = self.queue.overflow_count();
            if total == 1 || total % OVERFLOW_LOG_EVERY == 0 {
                warn!("outbound queue full: {total} envelopes evicted so far");
                self.events.publish(LinkEvent::QueueOverflow { total });
            }
        }
        self.stats.samples.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn mark_disconnected(&mut self, i: usize, error: &LinkError) {
        let slot = &mut self.controllers[i];
        if !slot.connected {
            return;
        }
        slot.connected = false;
        slot.last_sent = None;
        let number = slot.number;
        warn!("controller {number} ({}) disconnected: {error}", slot.controller_id);
        self.claims.send_if_modified(|set| set.remove(&number));
        self.events.publish(LinkEvent::ControllerDisconnected {
            controller_number: number,
        });
    }

    fn mark_connected(&mut self, i: usize) {
        let slot = &mut self.controllers[i];
        if slot.connected {
            return;
        }
        slot.connected = true;
        let number = slot.number;
        info!("controller {number} ({}) reconnected", slot.controller_id);
        self.claims.send_if_modified(|set| set.insert(number));
        self.events.publish(LinkEvent::ControllerReconnected {
            controller_number: number,
        });
    }

    /// Tick until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "capture started: {} controller(s) every {:?}",
            self.controllers.len(),
            self.interval
        );
        let mut schedule = TickSchedule::new(Instant::now(), self.interval);
        loop {
            let deadline = schedule.next(Instant::now());
            self.stats
                .skipped_ticks
                .store(schedule.skipped(), Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }
            self.tick();
        }
        debug!("capture stopped: {:?}", self.stats.snapshot());
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::ControllerConfig;
    use crate::envelope::{self, Payload};
    use crate::sample::Axes;

    fn config(controllers: &[(&str, u32)]) -> SenderConfig {
        SenderConfig {
            controllers: controllers
                .iter()
                .map(|(id, n)| ControllerConfig::new(*id, *n))
                .collect(),
            ..Default::default()
        }
    }

    fn hw<F>(f: F) -> F
    where
        F: FnMut(&str) -> Result<RawControllerState, LinkError> + Send + 'static,
    {
        f
    }

    fn raw_x(x: f32) -> RawControllerState {
        RawControllerState {
            axes: Axes {
                left_stick_x: x,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn drain(queue: &OutboundQueue) -> Vec<ControllerSample> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|q| match envelope::decode(&q.bytes).unwrap().payload {
                Payload::Input(s) => s,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[test]
    fn dead_zone_applied_to_samples() {
        let queue = Arc::new(OutboundQueue::new(16));
        let mut values = vec![0.5f32, 0.05].into_iter();
        let source = hw(move |_| Ok(raw_x(values.next().unwrap_or(0.0))));
        let mut cfg = config(&[("pad-0", 1)]);
        cfg.dead_zone = 0.1;
        let mut capture = CaptureScheduler::new(&cfg, source, queue.clone(), EventBus::default());

        capture.tick();
        capture.tick();
        let samples = drain(&queue);
        assert_eq!(samples[0].axes.left_stick_x, 0.5);
        assert_eq!(samples[1].axes.left_stick_x, 0.0);
    }

    #[test]
    fn sequences_are_per_controller_and_start_at_one() {
        let queue = Arc::new(OutboundQueue::new(64));
        let source = hw(|_| Ok(RawControllerState::default()));
        let cfg = config(&[("pad-0", 1), ("pad-1", 2)]);
        let mut capture = CaptureScheduler::new(&cfg, source, queue.clone(), EventBus::default());

        for _ in 0..3 {
            assert_eq!(capture.tick(), 2);
        }
        let samples = drain(&queue);
        let seqs = |n: u32| -> Vec<u64> {
            samples
                .iter()
                .filter(|s| s.controller_number == n)
                .map(|s| s.sequence)
                .collect()
        };
        assert_eq!(seqs(1), vec![1, 2, 3]);
        assert_eq!(seqs(2), vec![1, 2, 3]);
        assert!(samples.windows(2).all(|w| w[0].capture_time_us <= w[1].capture_time_us));
    }

    #[tokio::test]
    async fn hardware_failure_releases_claim_until_recovery() {
        let queue = Arc::new(OutboundQueue::new(64));
        let mut script: HashMap<&str, Vec<bool>> = HashMap::new();
        script.insert("pad-1", vec![true, false, false, true]);
        let mut calls = 0usize;
        let source = hw(move |id| {
            let ok = if id == "pad-1" {
                let ok = script["pad-1"].get(calls).copied().unwrap_or(true);
                calls += 1;
                ok
            } else {
                true
            };
            if ok {
                Ok(RawControllerState::default())
            } else {
                Err(LinkError::HardwareUnavailable(id.to_string()))
            }
        });
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cfg = config(&[("pad-0", 1), ("pad-1", 2)]);
        let mut capture = CaptureScheduler::new(&cfg, source, queue.clone(), events);
        let claims = capture.claims();
        assert_eq!(*claims.borrow(), ClaimSet::from([1, 2]));

        capture.tick();
        capture.tick();
        assert_eq!(*claims.borrow(), ClaimSet::from([1]));
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::ControllerDisconnected {
                controller_number: 2
            }
        );

        capture.tick();
        assert_eq!(capture.stats().snapshot().hardware_failures, 2);

        capture.tick();
        assert_eq!(*claims.borrow(), ClaimSet::from([1, 2]));
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::ControllerReconnected {
                controller_number: 2
            }
        );

        let pad1: Vec<u64> = drain(&queue)
            .into_iter()
            .filter(|s| s.controller_number == 2)
            .map(|s| s.sequence)
            .collect();
        assert_eq!(pad1, vec![1, 2]);
    }

    #[test]
    fn change_filter_suppresses_idle_samples() {
        let queue = Arc::new(OutboundQueue::new(64));
        let mut values = vec![0.0f32, 0.0, 0.0, 0.5, 0.5].into_iter();
        let source = hw(move |_| Ok(raw_x(values.next().unwrap_or(0.5))));
        let mut cfg = config(&[("pad-0", 1)]);
        cfg.send_on_change_only = true;
        cfg.idle_resend_ticks = 100;
        let mut capture = CaptureScheduler::new(&cfg, source, queue.clone(), EventBus::default());

        for _ in 0..5 {
            capture.tick();
        }
        let samples = drain(&queue);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sequence, 1);
        assert_eq!(samples[1].sequence, 2);
        assert_eq!(samples[1].axes.left_stick_x, 0.5);
        assert_eq!(capture.stats().snapshot().suppressed, 3);
    }

    #[test]
    fn change_filter_resends_after_idle_ticks() {
        let queue = Arc::new(OutboundQueue::new(64));
        let source = hw(|_| Ok(RawControllerState::default()));
        let mut cfg = config(&[("pad-0", 1)]);
        cfg.send_on_change_only = true;
        cfg.idle_resend_ticks = 3;
        let mut capture = CaptureScheduler::new(&cfg, source, queue.clone(), EventBus::default());

        for _ in 0..7 {
            capture.tick();
        }
        // Ticks 1, 4 and 7 are emitted.
        assert_eq!(drain(&queue).len(), 3);
    }

    #[test]
    fn overflow_keeps_capture_running() {
        let queue = Arc::new(OutboundQueue::new(10));
        let source = hw(|_| Ok(RawControllerState::default()));
        let cfg = config(&[("pad-0", 1)]);
        let mut capture = CaptureScheduler::new(&cfg, source, queue.clone(), EventBus::default());

        for _ in 0..25 {
            capture.tick();
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.overflow_count(), 15);
        assert_eq!(capture.stats().snapshot().samples, 25);
        assert_eq!(drain(&queue)[0].sequence, 16);
    }

    #[test]
    fn schedule_is_absolute() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut schedule = TickSchedule::new(start, interval);

        assert_eq!(schedule.next(start), start);
        // Running slightly late does not shift later deadlines.
        let late = start + Duration::from_millis(13);
        assert_eq!(schedule.next(late), start + Duration::from_millis(10));
        assert_eq!(schedule.next(late), start + Duration::from_millis(20));
        assert_eq!(schedule.skipped(), 0);
    }

    #[test]
    fn schedule_skips_when_far_behind() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut schedule = TickSchedule::new(start, interval);
        schedule.next(start);

        let stalled = start + Duration::from_millis(55);
        assert_eq!(schedule.next(stalled), start + Duration::from_millis(50));
        assert_eq!(schedule.skipped(), 4);
        assert_eq!(schedule.next(stalled), start + Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_at_configured_rate() {
        let queue = Arc::new(OutboundQueue::new(1000));
        let source = hw(|_| Ok(RawControllerState::default()));
        let cfg = config(&[("pad-0", 1)]);
        let capture = CaptureScheduler::new(&cfg, source, queue.clone(), EventBus::default());
        let stats = capture.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(capture.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        task.await.unwrap();

        let ticks = stats.snapshot().ticks;
        assert!((59..=61).contains(&ticks), "ticks = {ticks}");
        assert_eq!(queue.len() as u64, ticks);
    }
}
