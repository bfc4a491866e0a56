//! Input-side building blocks for jsprog: the static key/axis name
//! tables, the per-device control registry, the joystick probe and the
//! buffered virtual output device.

pub mod error;
pub mod mock;
pub mod names;
pub mod output;
pub mod probe;
pub mod registry;

pub use error::InputError;
pub use output::{EventWriter, OutputDevice, OutputIdentity, OutputRecord, UinputWriter};
pub use probe::{AxisInfo, ProbedDevice};
pub use registry::{Axis, ControlRegistry, Key};
