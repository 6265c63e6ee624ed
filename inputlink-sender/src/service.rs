//! Sender service core logic.
//!
//! Wires a [`HardwareSource`] into the capture scheduler and the outbound
//! link, logs status events and periodic statistics, and tears everything
//! down when its stop handle is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inputlink_core::{
    CaptureScheduler, EventBus, HardwareSource, LinkError, LinkEvent, OutboundLink, OutboundQueue,
};

use crate::config::SenderAppConfig;
use crate::hardware::SyntheticSource;

// ── SenderService ────────────────────────────────────────────────

pub struct SenderService {
    config: SenderAppConfig,
    cancel: CancellationToken,
    events: EventBus,
}

impl SenderService {
    pub fn new(config: SenderAppConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            events: EventBus::default(),
        }
    }

    /// Handle that stops the service when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Observe the service's status events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run with the synthetic hardware source until stopped.
    pub async fn run(&self) -> Result<(), LinkError> {
        let ids = self
            .config
            .sender
            .enabled_controllers()
            .map(|c| c.controller_id.clone());
        let source = SyntheticSource::new(ids, &self.config.hardware);
        self.run_with(source).await
    }

    /// Run with `source` until stopped.
    ///
    /// 1. Validates the configuration.
    /// 2. Starts the outbound link; it connects in the background.
    /// 3. Starts the capture scheduler on its own task.
    /// 4. On stop, halts the link (discarding the queue) and capture.
    pub async fn run_with<H: HardwareSource>(&self, source: H) -> Result<(), LinkError> {
        self.config.validate()?;
        let sender = &self.config.sender;

        let queue = Arc::new(OutboundQueue::new(sender.queue_capacity));
        let scheduler =
            CaptureScheduler::new(sender, source, Arc::clone(&queue), self.events.clone());
        let capture_stats = scheduler.stats();
        let mut link = OutboundLink::start(sender, queue, scheduler.claims(), self.events.clone());

        info!(
            "capturing {} controller(s) at {} Hz for {}",
            sender.enabled_controllers().count(),
            sender.polling_rate_hz,
            sender.receiver_addr()
        );

        let capture = tokio::spawn(scheduler.run(self.cancel.child_token()));
        let observer = tokio::spawn(log_events(
            self.events.subscribe(),
            self.cancel.child_token(),
        ));

        let stats_every = Duration::from_secs(self.config.logging.stats_interval_secs);
        let period = stats_every.max(Duration::from_secs(1));
        let mut stats_tick = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = stats_tick.tick(), if !stats_every.is_zero() => {
                    let capture = capture_stats.snapshot();
                    let link_stats = link.stats();
                    info!(
                        "link {} | ticks {} samples {} suppressed {} | sent {} queued {} overflow {} reconnects {}",
                        link.state(),
                        capture.ticks,
                        capture.samples,
                        capture.suppressed,
                        link_stats.sent,
                        link_stats.queued,
                        link_stats.overflow,
                        link_stats.reconnects,
                    );
                }
            }
        }

        link.stop().await;
        if let Err(e) = capture.await {
            warn!("capture task ended abnormally: {e}");
        }
        let _ = observer.await;
        info!("sender stopped");
        Ok(())
    }
}

/// Log status events until `cancel` fires.
async fn log_events(mut rx: broadcast::Receiver<LinkEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(LinkEvent::LinkState(state)) => info!("link: {state}"),
            Ok(LinkEvent::QueueOverflow { total }) => {
                warn!("outbound queue full, {total} envelope(s) evicted so far")
            }
            Ok(LinkEvent::ControllerDisconnected { controller_number }) => {
                warn!("controller {controller_number} disconnected")
            }
            Ok(LinkEvent::ControllerReconnected { controller_number }) => {
                info!("controller {controller_number} reconnected")
            }
            Ok(other) => debug!("event: {other:?}"),
            Err(RecvError::Lagged(n)) => debug!("event log skipped {n} event(s)"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
