//! Per-device control registry.
//!
//! Holds the keys and absolute axes a joystick declared at open time,
//! with their current state and the cached name of the Lua handler the
//! active profile bound to them.

use std::collections::BTreeMap;

use jsprog_types::{AxisSnapshot, ControlKind, KeySnapshot};

/// A key or button of a device.
#[derive(Debug, Clone)]
pub struct Key {
    code: u16,
    pressed: bool,
    handler: String,
}

impl Key {
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn pressed(&self) -> bool {
        self.pressed
    }
}

/// An absolute axis of a device.
#[derive(Debug, Clone)]
pub struct Axis {
    code: u16,
    value: i32,
    minimum: i32,
    maximum: i32,
    handler: String,
}

impl Axis {
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn minimum(&self) -> i32 {
        self.minimum
    }

    pub fn maximum(&self) -> i32 {
        self.maximum
    }
}

/// The canonical handler-function name for a control.
pub fn handler_name(kind: ControlKind, code: u16) -> String {
    format!("_jsprog_event_{kind}_{code:04x}")
}

/// The controls of one device, keyed by code.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    keys: BTreeMap<u16, Key>,
    axes: BTreeMap<u16, Axis>,
}

impl ControlRegistry {
    /// Build the registry from enumerated device capabilities.
    pub fn new(
        keys: impl IntoIterator<Item = (u16, bool)>,
        axes: impl IntoIterator<Item = (u16, i32, i32, i32)>,
    ) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|(code, pressed)| {
                    (
                        code,
                        Key {
                            code,
                            pressed,
                            handler: String::new(),
                        },
                    )
                })
                .collect(),
            axes: axes
                .into_iter()
                .map(|(code, value, minimum, maximum)| {
                    (
                        code,
                        Axis {
                            code,
                            value,
                            minimum,
                            maximum,
                            handler: String::new(),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn find_key(&self, code: u16) -> Option<&Key> {
        self.keys.get(&code)
    }

    pub fn find_axis(&self, code: u16) -> Option<&Axis> {
        self.axes.get(&code)
    }

    /// Update a key's pressed state. Returns false if the device never
    /// declared the code.
    pub fn set_key_pressed(&mut self, code: u16, pressed: bool) -> bool {
        match self.keys.get_mut(&code) {
            Some(key) => {
                key.pressed = pressed;
                true
            }
            None => false,
        }
    }

    /// Update an axis value. Returns false if the device never declared
    /// the code.
    pub fn set_axis_value(&mut self, code: u16, value: i32) -> bool {
        match self.axes.get_mut(&code) {
            Some(axis) => {
                axis.value = value;
                true
            }
            None => false,
        }
    }

    /// The handler name bound to a control, if any.
    pub fn handler_for(&self, kind: ControlKind, code: u16) -> Option<&str> {
        let name = match kind {
            ControlKind::Key => self.keys.get(&code).map(|k| k.handler.as_str()),
            ControlKind::Axis => self.axes.get(&code).map(|a| a.handler.as_str()),
        };
        name.filter(|n| !n.is_empty())
    }

    /// Wipe every cached handler name.
    pub fn clear_handler_names(&mut self) {
        for key in self.keys.values_mut() {
            key.handler.clear();
        }
        for axis in self.axes.values_mut() {
            axis.handler.clear();
        }
    }

    /// Install the canonical handler name on a control. Returns false
    /// if the device has no such control.
    pub fn set_handler_name(&mut self, kind: ControlKind, code: u16) -> bool {
        let name = handler_name(kind, code);
        match kind {
            ControlKind::Key => match self.keys.get_mut(&code) {
                Some(key) => {
                    key.handler = name;
                    true
                }
                None => false,
            },
            ControlKind::Axis => match self.axes.get_mut(&code) {
                Some(axis) => {
                    axis.handler = name;
                    true
                }
                None => false,
            },
        }
    }

    /// Key snapshots in code order, for listing.
    pub fn key_snapshots(&self) -> Vec<KeySnapshot> {
        self.keys
            .values()
            .map(|k| KeySnapshot(k.code, i32::from(k.pressed)))
            .collect()
    }

    /// Axis snapshots in code order, for listing.
    pub fn axis_snapshots(&self) -> Vec<AxisSnapshot> {
        self.axes
            .values()
            .map(|a| AxisSnapshot(a.code, a.value, a.minimum, a.maximum))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ControlRegistry {
        ControlRegistry::new(
            [(0x120, false), (0x121, true)],
            [(0x00, 12, -127, 127), (0x01, 0, 0, 255)],
        )
    }

    #[test]
    fn lookup_by_code() {
        let reg = registry();
        assert!(reg.find_key(0x120).is_some());
        assert!(reg.find_key(0x122).is_none());
        assert!(reg.find_key(0x121).unwrap().pressed());
        let axis = reg.find_axis(0x00).unwrap();
        assert_eq!((axis.value(), axis.minimum(), axis.maximum()), (12, -127, 127));
    }

    #[test]
    fn state_updates_only_known_codes() {
        let mut reg = registry();
        assert!(reg.set_key_pressed(0x120, true));
        assert!(reg.find_key(0x120).unwrap().pressed());
        assert!(!reg.set_key_pressed(0x1ff, true));
        assert!(reg.set_axis_value(0x01, 99));
        assert_eq!(reg.find_axis(0x01).unwrap().value(), 99);
        assert!(!reg.set_axis_value(0x05, 1));
    }

    #[test]
    fn handler_name_shape() {
        assert_eq!(handler_name(ControlKind::Key, 0x12c), "_jsprog_event_key_012c");
        assert_eq!(handler_name(ControlKind::Axis, 0x00), "_jsprog_event_axis_0000");
    }

    #[test]
    fn handler_names_cached_and_cleared() {
        let mut reg = registry();
        assert_eq!(reg.handler_for(ControlKind::Key, 0x120), None);
        assert!(reg.set_handler_name(ControlKind::Key, 0x120));
        assert!(!reg.set_handler_name(ControlKind::Key, 0x1ff));
        assert_eq!(
            reg.handler_for(ControlKind::Key, 0x120),
            Some("_jsprog_event_key_0120")
        );
        reg.clear_handler_names();
        assert_eq!(reg.handler_for(ControlKind::Key, 0x120), None);
    }

    #[test]
    fn snapshots_in_code_order() {
        let reg = registry();
        let keys = reg.key_snapshots();
        assert_eq!(keys, vec![KeySnapshot(0x120, 0), KeySnapshot(0x121, 1)]);
        let axes = reg.axis_snapshots();
        assert_eq!(axes[0], AxisSnapshot(0x00, 12, -127, 127));
    }
}
