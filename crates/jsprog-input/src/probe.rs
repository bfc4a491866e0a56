//! Joystick probing.
//!
//! Opens an event device, applies the joystick predicate and captures
//! the metadata and control set the rest of the daemon works with.

use std::path::Path;

use evdev::{Device, EventType};
use tracing::{debug, info, warn};

use jsprog_types::{DeviceMeta, InputId};

use crate::error::InputError;
use crate::names;

/// Startup state of one absolute axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisInfo {
    pub code: u16,
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
}

/// A device that passed the joystick predicate.
pub struct ProbedDevice {
    /// The open device; the caller turns this into an event stream.
    pub device: Device,
    pub meta: DeviceMeta,
    /// Declared keys with their pressed state at open time.
    pub keys: Vec<(u16, bool)>,
    /// Declared absolute axes with their state at open time.
    pub axes: Vec<AxisInfo>,
}

/// Open and probe an event device.
///
/// A joystick supports `EV_SYN` and `EV_ABS`, declares at least one
/// absolute axis and can report its key capability bits (an empty key
/// set is fine). Anything else is rejected with [`InputError::NotJoystick`].
pub fn probe(path: &Path) -> Result<ProbedDevice, InputError> {
    let device = Device::open(path)
        .map_err(|e| InputError::DeviceOpen(format!("{}: {e}", path.display())))?;

    let supported = device.supported_events();
    if !supported.contains(EventType::SYNCHRONIZATION) || !supported.contains(EventType::ABSOLUTE) {
        return Err(InputError::NotJoystick(format!(
            "{}: no absolute events",
            path.display()
        )));
    }

    let Some(abs_axes) = device.supported_absolute_axes() else {
        return Err(InputError::NotJoystick(format!(
            "{}: no absolute axes reported",
            path.display()
        )));
    };
    let abs_codes: Vec<u16> = abs_axes.iter().map(|a| a.0).collect();
    if abs_codes.is_empty() {
        return Err(InputError::NotJoystick(format!(
            "{}: none of the absolute axes are present",
            path.display()
        )));
    }

    let Some(supported_keys) = device.supported_keys() else {
        return Err(InputError::NotJoystick(format!(
            "{}: key capability bits unavailable",
            path.display()
        )));
    };
    let key_codes: Vec<u16> = supported_keys.iter().map(|k| k.0).collect();

    // A kernel that refuses EVIOCGKEY means "assume all released".
    let pressed = match device.get_key_state() {
        Ok(state) => state.iter().map(|k| k.0).collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e,
                "could not query key states, assuming all released");
            Vec::new()
        }
    };
    let keys: Vec<(u16, bool)> = key_codes
        .iter()
        .map(|&code| (code, pressed.contains(&code)))
        .collect();

    // Likewise a refused EVIOCGABS means value/min/max = 0.
    let abs_state = device.get_abs_state();
    let axes: Vec<AxisInfo> = abs_codes
        .iter()
        .map(|&code| match &abs_state {
            Ok(state) => {
                let info = state[usize::from(code)];
                AxisInfo {
                    code,
                    value: info.value,
                    minimum: info.minimum,
                    maximum: info.maximum,
                }
            }
            Err(e) => {
                warn!(code, error = %e,
                    "could not query axis state, assuming zero");
                AxisInfo {
                    code,
                    value: 0,
                    minimum: 0,
                    maximum: 0,
                }
            }
        })
        .collect();

    let raw_id = device.input_id();
    let meta = DeviceMeta {
        input_id: InputId {
            bus_type: raw_id.bus_type().0,
            vendor: raw_id.vendor(),
            product: raw_id.product(),
            version: raw_id.version(),
        },
        name: device.name().unwrap_or_default().to_string(),
        phys: device.physical_path().unwrap_or_default().to_string(),
        uniq: device.unique_name().unwrap_or_default().to_string(),
    };

    for axis in &axes {
        debug!(
            code = axis.code,
            name = names::axis_name(axis.code).unwrap_or("?"),
            value = axis.value,
            minimum = axis.minimum,
            maximum = axis.maximum,
            "axis state"
        );
    }
    info!(
        path = %path.display(),
        name = %meta.name,
        keys = keys.len(),
        axes = axes.len(),
        "joystick device"
    );

    Ok(ProbedDevice {
        device,
        meta,
        keys,
        axes,
    })
}
