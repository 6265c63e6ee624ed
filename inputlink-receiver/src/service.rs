//! Receiver service core logic.
//!
//! Binds the inbound server over a shared device registry, logs status
//! events and periodic STATUS lines, and stops the server (destroying
//! every virtual device) when its stop handle is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use inputlink_core::{
    Buttons, ControllerSample, DeviceRegistry, EventBus, InboundServer, LinkError, LinkEvent,
    VirtualDeviceCapability,
};

use crate::config::ReceiverAppConfig;

// ── TracingCapability ────────────────────────────────────────────

/// Backend that only logs what a platform backend would do.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCapability;

/// Per-device state of [`TracingCapability`].
#[derive(Debug)]
pub struct TracingDevice {
    controller_number: u32,
    applied: u64,
    buttons: Buttons,
}

impl TracingDevice {
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

impl VirtualDeviceCapability for TracingCapability {
    type Handle = TracingDevice;

    fn name(&self) -> &str {
        "tracing"
    }

    fn create(&self, controller_number: u32) -> Result<TracingDevice, LinkError> {
        info!("virtual controller {controller_number} plugged in");
        Ok(TracingDevice {
            controller_number,
            applied: 0,
            buttons: Buttons::empty(),
        })
    }

    fn apply(
        &self,
        device: &mut TracingDevice,
        sample: &ControllerSample,
    ) -> Result<(), LinkError> {
        device.applied += 1;
        if sample.buttons != device.buttons {
            debug!(
                "controller {}: buttons {:?}",
                device.controller_number, sample.buttons
            );
            device.buttons = sample.buttons;
        }
        trace!(
            "controller {} #{}: {:?}",
            device.controller_number, sample.sequence, sample.axes
        );
        Ok(())
    }

    fn destroy(&self, device: TracingDevice) -> Result<(), LinkError> {
        info!(
            "virtual controller {} unplugged after {} sample(s)",
            device.controller_number, device.applied
        );
        Ok(())
    }
}

// ── ReceiverService ──────────────────────────────────────────────

pub struct ReceiverService<C: VirtualDeviceCapability = TracingCapability> {
    config: ReceiverAppConfig,
    capability: C,
    cancel: CancellationToken,
    events: EventBus,
}

impl ReceiverService<TracingCapability> {
    pub fn new(config: ReceiverAppConfig) -> Self {
        Self::with_capability(config, TracingCapability)
    }
}

impl<C: VirtualDeviceCapability + Clone> ReceiverService<C> {
    pub fn with_capability(config: ReceiverAppConfig, capability: C) -> Self {
        Self {
            config,
            capability,
            cancel: CancellationToken::new(),
            events: EventBus::default(),
        }
    }

    /// Handle that stops the service when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run until stopped.
    ///
    /// 1. Validates the configuration and binds the listener.
    /// 2. Serves sessions until the stop handle is cancelled.
    /// 3. Stops the server, which ends every session and destroys every
    ///    virtual device before returning.
    pub async fn run(&self) -> Result<(), LinkError> {
        let config = &self.config.receiver;
        config.validate()?;

        let registry = Arc::new(DeviceRegistry::from_config(
            self.capability.clone(),
            config,
            self.events.clone(),
        ));
        info!(
            "device backend: {}, up to {} virtual controller(s)",
            registry.capability().name(),
            config.max_virtual_devices
        );

        let mut server = InboundServer::bind(config, registry, self.events.clone()).await?;
        let observer = tokio::spawn(log_events(
            self.events.subscribe(),
            self.cancel.child_token(),
        ));

        let status_every = Duration::from_secs(self.config.logging.status_interval_secs);
        let period = status_every.max(Duration::from_secs(1));
        let mut status_tick = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = status_tick.tick(), if !status_every.is_zero() => {
                    let status = server.status();
                    info!(
                        "status {:?} | sessions {} | active devices {} | rejected {}",
                        status.health,
                        status.live_sessions,
                        status.active_devices,
                        status.rejected_total,
                    );
                }
            }
        }

        let swept = server.stop().await;
        if swept > 0 {
            debug!("final sweep destroyed {swept} device(s)");
        }
        let _ = observer.await;
        info!("receiver stopped");
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
            Ok(LinkEvent::SessionStale { session }) => warn!("session {session} went stale"),
            Ok(LinkEvent::DeviceRejected { controller_number }) => {
                warn!("controller {controller_number} rejected: device limit reached")
            }
            Ok(LinkEvent::DeviceErrored {
                controller_number,
                reason,
            }) => warn!("controller {controller_number} failed: {reason}"),
            Ok(other) => debug!("event: {other:?}"),
            Err(RecvError::Lagged(n)) => debug!("event log skipped {n} event(s)"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use inputlink_core::sample::{Axes, InputMethod};

    fn sample(sequence: u64, buttons: Buttons) -> ControllerSample {
        ControllerSample {
            controller_number: 1,
            controller_id: "pad-0".into(),
            input_method: InputMethod::Xinput,
            buttons,
            axes: Axes::default(),
            sequence,
            capture_time_us: 0,
        }
    }

    #[test]
    fn tracing_device_counts_samples() {
        let cap = TracingCapability;
        let mut device = cap.create(1).unwrap();
        cap.apply(&mut device, &sample(1, Buttons::empty())).unwrap();
        cap.apply(&mut device, &sample(2, Buttons::A)).unwrap();
        assert_eq!(device.applied(), 2);
        assert_eq!(device.buttons, Buttons::A);
        cap.destroy(device).unwrap();
    }

    #[tokio::test]
    async fn runs_until_stopped() {
        let mut config = ReceiverAppConfig::default();
        config.receiver.listen_host = "127.0.0.1".into();
        config.receiver.listen_port = 0;
        config.logging.status_interval_secs = 0;

        let service = Arc::new(ReceiverService::new(config));
        let running = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.run().await }
        });

        // Give the listener a moment to bind before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("service did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = ReceiverAppConfig::default();
        config.receiver.listen_host = String::new();
        let service = ReceiverService::new(config);
        assert!(matches!(service.run().await, Err(LinkError::Config(_))));
    }
}
