//! Digital button set of a controller sample.
//!
//! Stored as a bitflag word; serialized on the wire as a map of named
//! booleans so that receivers built before a button was added simply
//! ignore the unknown name.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Pressed buttons, Xbox layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u16 {
        const A = 1 << 0;
        const B = 1 << 1;
        const X = 1 << 2;
        const Y = 1 << 3;
        /// Left bumper.
        const LB = 1 << 4;
        /// Right bumper.
        const RB = 1 << 5;
        const BACK = 1 << 6;
        const START = 1 << 7;
        /// Left stick click.
        const LS = 1 << 8;
        /// Right stick click.
        const RS = 1 << 9;
        const DPAD_UP = 1 << 10;
        const DPAD_DOWN = 1 << 11;
        const DPAD_LEFT = 1 << 12;
        const DPAD_RIGHT = 1 << 13;
    }
}

/// Wire names, in serialization order.
pub const BUTTON_NAMES: [(&str, Buttons); 14] = [
    ("a", Buttons::A),
    ("b", Buttons::B),
    ("x", Buttons::X),
    ("y", Buttons::Y),
    ("lb", Buttons::LB),
    ("rb", Buttons::RB),
    ("back", Buttons::BACK),
    ("start", Buttons::START),
    ("ls", Buttons::LS),
    ("rs", Buttons::RS),
    ("dpad_up", Buttons::DPAD_UP),
    ("dpad_down", Buttons::DPAD_DOWN),
    ("dpad_left", Buttons::DPAD_LEFT),
    ("dpad_right", Buttons::DPAD_RIGHT),
];

impl Buttons {
    /// Look up a button by its wire name.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        BUTTON_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, flag)| *flag)
    }

    /// Build a button set from a D-pad hat position (`x`, `y` in -1..=1,
    /// `y > 0` is up).
    pub fn from_hat(x: i8, y: i8) -> Self {
        let mut buttons = Self::empty();
        buttons.set(Self::DPAD_LEFT, x < 0);
        buttons.set(Self::DPAD_RIGHT, x > 0);
        buttons.set(Self::DPAD_UP, y > 0);
        buttons.set(Self::DPAD_DOWN, y < 0);
        buttons
    }
}

impl Serialize for Buttons {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(BUTTON_NAMES.len()))?;
        for (name, flag) in BUTTON_NAMES {
            map.serialize_entry(name, &self.contains(flag))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Buttons {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = HashMap::<String, bool>::deserialize(deserializer)?;
        let mut buttons = Buttons::empty();
        for (name, pressed) in raw {
            if let (true, Some(flag)) = (pressed, Buttons::from_wire_name(&name)) {
                buttons |= flag;
            }
        }
        Ok(buttons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_every_button_by_name() {
        let json = serde_json::to_value(Buttons::A | Buttons::DPAD_LEFT).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 14);
        assert_eq!(obj["a"], true);
        assert_eq!(obj["dpad_left"], true);
        assert_eq!(obj["b"], false);
    }

    #[test]
    fn unknown_names_are_ignored() {
        let buttons: Buttons =
            serde_json::from_str(r#"{"a":true,"guide":true,"start":false}"#).unwrap();
        assert_eq!(buttons, Buttons::A);
    }

    #[test]
    fn missing_names_default_to_released() {
        let buttons: Buttons = serde_json::from_str(r#"{"rb":true}"#).unwrap();
        assert_eq!(buttons, Buttons::RB);
    }

    #[test]
    fn hat_maps_to_dpad() {
        assert_eq!(Buttons::from_hat(-1, 1), Buttons::DPAD_LEFT | Buttons::DPAD_UP);
        assert_eq!(Buttons::from_hat(1, -1), Buttons::DPAD_RIGHT | Buttons::DPAD_DOWN);
        assert!(Buttons::from_hat(0, 0).is_empty());
    }
}
