//! Synthetic hardware source.
//!
//! Each known controller id gets a pad whose left stick circles once per
//! period, whose right trigger ramps with it and whose `A` button is held
//! during the first half of every revolution. Pads are phase-shifted by
//! their position in the id list so that several of them are easy to tell
//! apart on the receiver.

use std::collections::BTreeSet;
use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use inputlink_core::{Axes, Buttons, HardwareSource, LinkError, RawControllerState};

use crate::config::HardwareConfig;

#[derive(Debug)]
pub struct SyntheticSource {
    ids: Vec<String>,
    unplugged: BTreeSet<String>,
    period: Duration,
    started: Instant,
}

impl SyntheticSource {
    pub fn new(ids: impl IntoIterator<Item = String>, config: &HardwareConfig) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            unplugged: config.unplugged.iter().cloned().collect(),
            period: Duration::from_secs_f32(config.synthetic_period_secs.max(0.1)),
            started: Instant::now(),
        }
    }

    /// Mark a pad as unplugged (or plug it back in).
    pub fn set_unplugged(&mut self, controller_id: &str, unplugged: bool) {
        if unplugged {
            self.unplugged.insert(controller_id.to_string());
        } else {
            self.unplugged.remove(controller_id);
        }
    }

    /// State of pad `index` at `elapsed` since start.
    pub fn state_at(&self, index: usize, elapsed: Duration) -> RawControllerState {
        let turns = elapsed.as_secs_f32() / self.period.as_secs_f32();
        let phase = (turns + index as f32 * 0.25).fract();
        let angle = phase * TAU;

        let mut buttons = Buttons::empty();
        buttons.set(Buttons::A, phase < 0.5);

        RawControllerState {
            buttons,
            axes: Axes {
                left_stick_x: angle.cos(),
                left_stick_y: angle.sin(),
                right_trigger: phase,
                ..Axes::default()
            },
        }
    }
}

impl HardwareSource for SyntheticSource {
    fn poll(&mut self, controller_id: &str) -> Result<RawControllerState, LinkError> {
        let index = self
            .ids
            .iter()
            .position(|id| id == controller_id)
            .filter(|_| !self.unplugged.contains(controller_id))
            .ok_or_else(|| LinkError::HardwareUnavailable(controller_id.to_string()))?;
        Ok(self.state_at(index, self.started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SyntheticSource {
        SyntheticSource::new(
            ["pad-a".to_string(), "pad-b".to_string()],
            &HardwareConfig {
                synthetic_period_secs: 4.0,
                unplugged: Vec::new(),
            },
        )
    }

    #[test]
    fn axes_stay_in_range() {
        let src = source();
        for ms in (0..8_000).step_by(37) {
            for index in 0..2 {
                let state = src.state_at(index, Duration::from_millis(ms));
                let axes = state.axes;
                assert!((-1.0..=1.0).contains(&axes.left_stick_x));
                assert!((-1.0..=1.0).contains(&axes.left_stick_y));
                assert!((0.0..=1.0).contains(&axes.right_trigger));
            }
        }
    }

    #[test]
    fn button_follows_half_revolution() {
        let src = source();
        assert!(src.state_at(0, Duration::from_millis(500)).buttons.contains(Buttons::A));
        assert!(!src.state_at(0, Duration::from_millis(2_500)).buttons.contains(Buttons::A));
    }

    #[test]
    fn pads_are_phase_shifted() {
        let src = source();
        let a = src.state_at(0, Duration::ZERO);
        let b = src.state_at(1, Duration::ZERO);
        assert_ne!(a.axes, b.axes);
    }

    #[test]
    fn unknown_or_unplugged_pad_is_unavailable() {
        let mut src = source();
        assert!(matches!(
            src.poll("pad-z"),
            Err(LinkError::HardwareUnavailable(_))
        ));

        assert!(src.poll("pad-b").is_ok());
        src.set_unplugged("pad-b", true);
        assert!(matches!(
            src.poll("pad-b"),
            Err(LinkError::HardwareUnavailable(_))
        ));
        src.set_unplugged("pad-b", false);
        assert!(src.poll("pad-b").is_ok());
    }
}
