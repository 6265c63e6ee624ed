//! Controller sample model.
//!
//! A [`ControllerSample`] is one normalized snapshot of a single
//! controller at a given capture tick. Raw hardware values pass through
//! an [`AxisFilter`] (dead-zone, optional rescale, clamp) before they
//! become a sample, so every sample that leaves the sender satisfies the
//! range invariants checked by [`ControllerSample::validate`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buttons::Buttons;
use crate::error::LinkError;

/// Declared range of stick axes.
pub const STICK_RANGE: (f32, f32) = (-1.0, 1.0);

/// Declared range of trigger axes.
pub const TRIGGER_RANGE: (f32, f32) = (0.0, 1.0);

/// Highest controller number a receiver exposes; numbers run `1..=8`.
pub const MAX_CONTROLLER_NUMBER: u32 = 8;

/// Whether `n` is a usable controller number.
pub fn is_valid_controller_number(n: u32) -> bool {
    (1..=MAX_CONTROLLER_NUMBER).contains(&n)
}

/// Axis movement below this is not considered a state change.
pub const CHANGE_THRESHOLD: f32 = 0.01;

// ── InputMethod ──────────────────────────────────────────────────

/// Which host API the controller is read through on the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMethod {
    Dinput,
    #[default]
    Xinput,
}

impl fmt::Display for InputMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputMethod::Dinput => write!(f, "dinput"),
            InputMethod::Xinput => write!(f, "xinput"),
        }
    }
}

// ── Axes ─────────────────────────────────────────────────────────

/// Analog axes. Sticks in `[-1, 1]`, triggers in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Axes {
    pub left_stick_x: f32,
    pub left_stick_y: f32,
    pub right_stick_x: f32,
    pub right_stick_y: f32,
    pub left_trigger: f32,
    pub right_trigger: f32,
}

impl Axes {
    fn sticks(&self) -> [(&'static str, f32); 4] {
        [
            ("left_stick_x", self.left_stick_x),
            ("left_stick_y", self.left_stick_y),
            ("right_stick_x", self.right_stick_x),
            ("right_stick_y", self.right_stick_y),
        ]
    }

    fn triggers(&self) -> [(&'static str, f32); 2] {
        [
            ("left_trigger", self.left_trigger),
            ("right_trigger", self.right_trigger),
        ]
    }

    /// Check every axis against its declared range.
    pub fn validate(&self) -> Result<(), LinkError> {
        for (name, value) in self.sticks() {
            check_range(name, value, STICK_RANGE)?;
        }
        for (name, value) in self.triggers() {
            check_range(name, value, TRIGGER_RANGE)?;
        }
        Ok(())
    }

    /// `true` if any axis moved by more than `threshold`.
    pub fn differs_from(&self, other: &Axes, threshold: f32) -> bool {
        self.sticks()
            .iter()
            .zip(other.sticks().iter())
            .chain(self.triggers().iter().zip(other.triggers().iter()))
            .any(|((_, a), (_, b))| (a - b).abs() > threshold)
    }
}

fn check_range(name: &str, value: f32, (lo, hi): (f32, f32)) -> Result<(), LinkError> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(LinkError::Validation(format!(
            "{name} = {value} outside [{lo}, {hi}]"
        )));
    }
    Ok(())
}

// ── RawControllerState ───────────────────────────────────────────

/// Unfiltered state as reported by the hardware collaborator.
///
/// Values may be noisy, slightly out of range or non-finite.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawControllerState {
    pub buttons: Buttons,
    pub axes: Axes,
}

// ── AxisFilter ───────────────────────────────────────────────────

/// Dead-zone and clamp rules applied to raw axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisFilter {
    /// Magnitudes at or below this snap to zero.
    pub dead_zone: f32,
    /// Rescale the live band `(dead_zone, 1]` back onto `(0, 1]`.
    pub rescale: bool,
}

impl Default for AxisFilter {
    fn default() -> Self {
        Self {
            dead_zone: 0.1,
            rescale: false,
        }
    }
}

impl AxisFilter {
    pub fn new(dead_zone: f32) -> Self {
        Self {
            dead_zone: dead_zone.clamp(0.0, 0.99),
            rescale: false,
        }
    }

    pub fn with_rescale(mut self, rescale: bool) -> Self {
        self.rescale = rescale;
        self
    }

    fn dead_zone(&self, value: f32) -> f32 {
        if !value.is_finite() || value.abs() <= self.dead_zone {
            return 0.0;
        }
        if self.rescale {
            let scaled = (value.abs() - self.dead_zone) / (1.0 - self.dead_zone);
            return value.signum() * scaled.min(1.0);
        }
        value
    }

    /// Filter a stick axis into `[-1, 1]`.
    pub fn stick(&self, value: f32) -> f32 {
        self.dead_zone(value).clamp(STICK_RANGE.0, STICK_RANGE.1)
    }

    /// Filter a trigger axis into `[0, 1]`.
    pub fn trigger(&self, value: f32) -> f32 {
        self.dead_zone(value).clamp(TRIGGER_RANGE.0, TRIGGER_RANGE.1)
    }

    /// Filter all axes of a raw state.
    pub fn apply(&self, raw: &Axes) -> Axes {
        Axes {
            left_stick_x: self.stick(raw.left_stick_x),
            left_stick_y: self.stick(raw.left_stick_y),
            right_stick_x: self.stick(raw.right_stick_x),
            right_stick_y: self.stick(raw.right_stick_y),
            left_trigger: self.trigger(raw.left_trigger),
            right_trigger: self.trigger(raw.right_trigger),
        }
    }
}

// ── ControllerSample ─────────────────────────────────────────────

/// One normalized snapshot of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSample {
    /// Receiver-side slot number, `1..=MAX_CONTROLLER_NUMBER`.
    pub controller_number: u32,
    /// Stable hardware identifier on the sender.
    pub controller_id: String,
    #[serde(default)]
    pub input_method: InputMethod,
    #[serde(default)]
    pub buttons: Buttons,
    #[serde(default)]
    pub axes: Axes,
    /// Monotonic per `controller_number`, starting at 1.
    pub sequence: u64,
    /// Microseconds on the sender's monotonic capture clock.
    pub capture_time_us: u64,
}

impl ControllerSample {
    /// Build a sample from a raw hardware state.
    pub fn from_raw(
        controller_number: u32,
        controller_id: impl Into<String>,
        input_method: InputMethod,
        raw: &RawControllerState,
        filter: &AxisFilter,
        sequence: u64,
        capture_time_us: u64,
    ) -> Self {
        Self {
            controller_number,
            controller_id: controller_id.into(),
            input_method,
            buttons: raw.buttons,
            axes: filter.apply(&raw.axes),
            sequence,
            capture_time_us,
        }
    }

    /// Check the sample against its declared domain.
    pub fn validate(&self) -> Result<(), LinkError> {
        if !is_valid_controller_number(self.controller_number) {
            return Err(LinkError::Validation(format!(
                "controller_number {} outside 1..={MAX_CONTROLLER_NUMBER}",
                self.controller_number
            )));
        }
        if self.controller_id.trim().is_empty() {
            return Err(LinkError::Validation("controller_id is empty".into()));
        }
        if self.sequence == 0 {
            return Err(LinkError::Validation("sequence must be >= 1".into()));
        }
        self.axes.validate()
    }

    /// `true` if buttons or axes differ enough to be worth sending.
    pub fn state_differs(&self, other: &ControllerSample) -> bool {
        self.buttons != other.buttons || self.axes.differs_from(&other.axes, CHANGE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(axes: Axes) -> ControllerSample {
        ControllerSample {
            controller_number: 1,
            controller_id: "pad-0".into(),
            input_method: InputMethod::Xinput,
            buttons: Buttons::empty(),
            axes,
            sequence: 1,
            capture_time_us: 0,
        }
    }

    #[test]
    fn dead_zone_snaps_small_values() {
        let filter = AxisFilter::new(0.1);
        assert_eq!(filter.stick(0.05), 0.0);
        assert_eq!(filter.stick(-0.1), 0.0);
        assert_eq!(filter.stick(0.5), 0.5);
        assert_eq!(filter.stick(-0.5), -0.5);
    }

    #[test]
    fn clamps_to_declared_range() {
        let filter = AxisFilter::new(0.1);
        assert_eq!(filter.stick(1.7), 1.0);
        assert_eq!(filter.stick(-3.0), -1.0);
        assert_eq!(filter.trigger(-0.6), 0.0);
        assert_eq!(filter.trigger(1.2), 1.0);
    }

    #[test]
    fn non_finite_becomes_zero() {
        let filter = AxisFilter::default();
        assert_eq!(filter.stick(f32::NAN), 0.0);
        assert_eq!(filter.trigger(f32::INFINITY), 0.0);
    }

    #[test]
    fn rescale_maps_live_band_to_full_range() {
        let filter = AxisFilter::new(0.2).with_rescale(true);
        assert!((filter.stick(0.6) - 0.5).abs() < 1e-6);
        assert_eq!(filter.stick(1.0), 1.0);
        assert_eq!(filter.stick(-1.0), -1.0);
    }

    #[test]
    fn filtered_sample_always_validates() {
        let filter = AxisFilter::new(0.1);
        let raw = RawControllerState {
            buttons: Buttons::A,
            axes: Axes {
                left_stick_x: 9.0,
                left_stick_y: -9.0,
                right_stick_x: f32::NAN,
                right_stick_y: 0.3,
                left_trigger: -1.0,
                right_trigger: 4.0,
            },
        };
        let s = ControllerSample::from_raw(2, "pad", InputMethod::Dinput, &raw, &filter, 7, 100);
        assert!(s.validate().is_ok());
        assert_eq!(s.axes.right_trigger, 1.0);
        assert_eq!(s.buttons, Buttons::A);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let s = sample(Axes {
            left_trigger: 1.5,
            ..Default::default()
        });
        assert!(matches!(s.validate(), Err(LinkError::Validation(_))));
    }

    #[test]
    fn validate_rejects_bad_identity() {
        let mut s = sample(Axes::default());
        s.controller_number = 0;
        assert!(s.validate().is_err());

        let mut s = sample(Axes::default());
        s.controller_number = MAX_CONTROLLER_NUMBER;
        assert!(s.validate().is_ok());
        s.controller_number = MAX_CONTROLLER_NUMBER + 1;
        assert!(matches!(s.validate(), Err(LinkError::Validation(_))));

        let mut s = sample(Axes::default());
        s.controller_id = "   ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn state_change_threshold() {
        let a = sample(Axes::default());
        let mut b = a.clone();
        b.axes.left_stick_x = 0.005;
        assert!(!a.state_differs(&b));
        b.axes.left_stick_x = 0.2;
        assert!(a.state_differs(&b));
        let mut c = a.clone();
        c.buttons = Buttons::START;
        assert!(a.state_differs(&c));
    }
}
