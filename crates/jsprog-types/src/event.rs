//! Input event kinds and the raw type codes the core cares about.

use serde::{Deserialize, Serialize};

/// Raw evdev event type: synchronization.
pub const EV_SYN: u16 = 0x00;
/// Raw evdev event type: key or button transition.
pub const EV_KEY: u16 = 0x01;
/// Raw evdev event type: relative axis motion.
pub const EV_REL: u16 = 0x02;
/// Raw evdev event type: absolute axis sample.
pub const EV_ABS: u16 = 0x03;

/// Which kind of control an event or a profile entry addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    /// A key or button.
    Key,
    /// An absolute axis.
    Axis,
}

impl ControlKind {
    /// The raw evdev event type for this kind.
    pub fn event_type(self) -> u16 {
        match self {
            Self::Key => EV_KEY,
            Self::Axis => EV_ABS,
        }
    }
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key => write!(f, "key"),
            Self::Axis => write!(f, "axis"),
        }
    }
}
