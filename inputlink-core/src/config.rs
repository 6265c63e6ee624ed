//! Explicit configuration values for the sender and receiver.
//!
//! Both structs deserialize from TOML with every field optional
//! (`#[serde(default)]`), are validated once with `validate()` and are
//! then handed by value to the components that need them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::LinkError;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::sample::{AxisFilter, InputMethod, MAX_CONTROLLER_NUMBER, is_valid_controller_number};

/// Default TCP port of the receiver.
pub const DEFAULT_PORT: u16 = 8765;

/// Allowed capture rates.
pub const POLLING_RATE_RANGE: std::ops::RangeInclusive<u32> = 10..=240;

// ── ControllerConfig ─────────────────────────────────────────────

/// One physical controller known to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Stable hardware identifier passed to the hardware source.
    pub controller_id: String,
    /// Receiver-side slot number (the override), `>= 1`.
    pub assigned_number: u32,
    #[serde(default)]
    pub input_method: InputMethod,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ControllerConfig {
    pub fn new(controller_id: impl Into<String>, assigned_number: u32) -> Self {
        Self {
            controller_id: controller_id.into(),
            assigned_number,
            input_method: InputMethod::default(),
            enabled: true,
            display_name: None,
        }
    }
}

// ── Sender ───────────────────────────────────────────────────────

/// Reconnect backoff in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// A connected period at least this long resets the backoff.
    pub stability_threshold_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            stability_threshold_ms: 10_000,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            max: Duration::from_millis(self.max_ms),
            stability_threshold: Duration::from_millis(self.stability_threshold_ms),
        }
    }
}

/// Link timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect attempt.
    pub connect_ms: u64,
    /// HELLO → STATUS ack.
    pub handshake_ms: u64,
    /// PING period while connected. Silence for 3× this drops the link.
    pub keepalive_ms: u64,
    /// A failed in-flight envelope older than this is dropped, not retried.
    pub max_in_flight_age_ms: u64,
    /// How long `stop()` waits for the drain loop.
    pub stop_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 3_000,
            handshake_ms: 3_000,
            keepalive_ms: 2_000,
            max_in_flight_age_ms: 500,
            stop_grace_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    /// Silence after which the peer is considered dead.
    pub fn dead_after(&self) -> Duration {
        self.keepalive() * 3
    }

    pub fn max_in_flight_age(&self) -> Duration {
        Duration::from_millis(self.max_in_flight_age_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Everything the sender-side core needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub receiver_host: String,
    pub receiver_port: u16,
    /// Name announced in HELLO.
    pub sender_name: String,
    pub polling_rate_hz: u32,
    pub dead_zone: f32,
    /// Rescale the live band above the dead zone onto the full range.
    pub rescale_axes: bool,
    /// Only emit samples whose state changed (or every `idle_resend_ticks`).
    pub send_on_change_only: bool,
    pub idle_resend_ticks: u32,
    pub queue_capacity: usize,
    pub controllers: Vec<ControllerConfig>,
    pub backoff: BackoffConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            receiver_host: "127.0.0.1".into(),
            receiver_port: DEFAULT_PORT,
            sender_name: "inputlink-sender".into(),
            polling_rate_hz: 60,
            dead_zone: 0.1,
            rescale_axes: false,
            send_on_change_only: false,
            idle_resend_ticks: 30,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            controllers: Vec::new(),
            backoff: BackoffConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.receiver_host.trim().is_empty() {
            return Err(LinkError::Config("receiver_host is empty".into()));
        }
        if self.receiver_port == 0 {
            return Err(LinkError::Config("receiver_port must be non-zero".into()));
        }
        if !POLLING_RATE_RANGE.contains(&self.polling_rate_hz) {
            return Err(LinkError::Config(format!(
                "polling_rate_hz {} outside {}..={}",
                self.polling_rate_hz,
                POLLING_RATE_RANGE.start(),
                POLLING_RATE_RANGE.end()
            )));
        }
        if !(0.0..1.0).contains(&self.dead_zone) {
            return Err(LinkError::Config(format!(
                "dead_zone {} outside [0, 1)",
                self.dead_zone
            )));
        }
        if self.queue_capacity == 0 {
            return Err(LinkError::Config("queue_capacity must be >= 1".into()));
        }
        if self.timeouts.keepalive_ms == 0 {
            return Err(LinkError::Config("keepalive_ms must be non-zero".into()));
        }

        let mut ids = BTreeSet::new();
        let mut numbers = BTreeSet::new();
        for c in self.enabled_controllers() {
            if c.controller_id.trim().is_empty() {
                return Err(LinkError::Config("controller_id is empty".into()));
            }
            if !is_valid_controller_number(c.assigned_number) {
                return Err(LinkError::Config(format!(
                    "controller {} has assigned_number {} outside 1..={MAX_CONTROLLER_NUMBER}",
                    c.controller_id, c.assigned_number
                )));
            }
            if !ids.insert(c.controller_id.as_str()) {
                return Err(LinkError::Config(format!(
                    "controller {} listed twice",
                    c.controller_id
                )));
            }
            if !numbers.insert(c.assigned_number) {
                return Err(LinkError::Config(format!(
                    "controller number {} assigned twice",
                    c.assigned_number
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_controllers(&self) -> impl Iterator<Item = &ControllerConfig> {
        self.controllers.iter().filter(|c| c.enabled)
    }

    /// `controller_id → controller_number` for enabled controllers.
    pub fn controller_number_overrides(&self) -> BTreeMap<String, u32> {
        self.enabled_controllers()
            .map(|c| (c.controller_id.clone(), c.assigned_number))
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.polling_rate_hz.max(1)))
    }

    pub fn axis_filter(&self) -> AxisFilter {
        AxisFilter::new(self.dead_zone).with_rescale(self.rescale_axes)
    }

    pub fn receiver_addr(&self) -> String {
        format!("{}:{}", self.receiver_host, self.receiver_port)
    }
}

// ── Receiver ─────────────────────────────────────────────────────

/// Everything the receiver-side core needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Live virtual devices allowed at once (0 = unbounded).
    pub max_virtual_devices: usize,
    /// Concurrent sessions allowed at once (0 = unbounded).
    pub max_sessions: usize,
    /// Silence after which a session is stale.
    pub session_timeout_ms: u64,
    /// Wait before retrying `create` for a slot in Error.
    pub error_cooldown_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: DEFAULT_PORT,
            max_virtual_devices: 4,
            max_sessions: 0,
            session_timeout_ms: 6_000,
            error_cooldown_ms: 1_000,
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.listen_host.trim().is_empty() {
            return Err(LinkError::Config("listen_host is empty".into()));
        }
        if self.session_timeout_ms == 0 {
            return Err(LinkError::Config("session_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────
