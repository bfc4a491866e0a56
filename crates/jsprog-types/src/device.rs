//! Device descriptor types.

use serde::{Deserialize, Serialize};
use zvariant::Type;

/// Stable id of a joystick device. Monotonic, never reused for the
/// lifetime of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel input device identity (`struct input_id`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct InputId {
    pub bus_type: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl InputId {
    /// The tuple shape used on the bus.
    pub fn as_tuple(&self) -> (u16, u16, u16, u16) {
        (self.bus_type, self.vendor, self.product, self.version)
    }
}

/// Metadata captured from a joystick device at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMeta {
    pub input_id: InputId,
    /// Human-readable name.
    pub name: String,
    /// Physical location (e.g. a USB port path).
    pub phys: String,
    /// Unique id, often empty.
    pub uniq: String,
}

/// One key of a device: (code, pressed as 0/1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct KeySnapshot(pub u16, pub i32);

/// One absolute axis of a device: (code, value, minimum, maximum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct AxisSnapshot(pub u16, pub i32, pub i32, pub i32);

/// The `list_devices` element / `device_added` signal payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct DeviceSnapshot {
    pub id: u32,
    pub input_id: (u16, u16, u16, u16),
    pub name: String,
    pub phys: String,
    pub uniq: String,
    pub keys: Vec<KeySnapshot>,
    pub axes: Vec<AxisSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_signature_matches_wire_contract() {
        assert_eq!(
            DeviceSnapshot::SIGNATURE.to_string(),
            "(u(qqqq)sssa(qi)a(qiii))"
        );
    }
}
