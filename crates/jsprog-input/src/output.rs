//! The virtual output device.
//!
//! Key transitions and relative motions emitted by script callbacks are
//! buffered and written to the kernel as one batch per `synchronize()`
//! call, so everything a scheduler iteration produced reaches the OS as
//! a single logically atomic report.

use evdev::uinput::VirtualDevice;
use evdev::{AttributeSet, BusType, EventType, InputEvent, KeyCode, RelativeAxisCode};
use tracing::{debug, error, info, warn};

use crate::error::InputError;
use crate::names;

/// The kernel rejects capability declarations past this many key bits.
const KEY_CAPABILITY_LIMIT: usize = 512;

/// One buffered output transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRecord {
    /// A key press (`press == true`) or release.
    Key { code: u16, press: bool },
    /// A relative motion on an axis.
    Rel { axis: u16, delta: i32 },
}

/// Writes one synchronized batch of output records to a sink.
pub trait EventWriter {
    fn write_batch(&mut self, batch: &[OutputRecord]) -> std::io::Result<()>;
}

/// Identity the synthetic device presents to downstream consumers.
#[derive(Debug, Clone)]
pub struct OutputIdentity {
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl Default for OutputIdentity {
    fn default() -> Self {
        Self {
            name: "JSProg keyboard & mouse".to_string(),
            vendor: 0x5649,
            product: 0x4a50,
            version: 1,
        }
    }
}

/// The buffered virtual output device shared by all sessions.
pub struct OutputDevice {
    writer: Box<dyn EventWriter>,
    batch: Vec<OutputRecord>,
    valid: bool,
}

impl OutputDevice {
    pub fn new(writer: Box<dyn EventWriter>) -> Self {
        Self {
            writer,
            batch: Vec::new(),
            valid: true,
        }
    }

    /// Whether the sink is still usable. A failed write invalidates it
    /// permanently.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Record a key press.
    pub fn press(&mut self, code: u16) {
        self.push(OutputRecord::Key { code, press: true });
    }

    /// Record a key release.
    pub fn release(&mut self, code: u16) {
        self.push(OutputRecord::Key { code, press: false });
    }

    /// Record a relative motion.
    pub fn move_relative(&mut self, axis: u16, delta: i32) {
        self.push(OutputRecord::Rel { axis, delta });
    }

    fn push(&mut self, record: OutputRecord) {
        if self.valid {
            self.batch.push(record);
        }
    }

    /// Commit everything recorded since the last synchronize. Does
    /// nothing when no transitions are pending.
    pub fn synchronize(&mut self) {
        if !self.valid || self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        if let Err(e) = self.writer.write_batch(&batch) {
            error!(error = %e, "output device write failed, disabling synthetic output");
            self.valid = false;
        }
    }
}

/// uinput-backed writer.
pub struct UinputWriter {
    device: VirtualDevice,
}

impl UinputWriter {
    /// Open `/dev/uinput` and declare the capability set: keyboard keys
    /// from the static table (up to the kernel's bit limit), the three
    /// main mouse buttons, and relative X/Y/wheel.
    pub fn create(identity: &OutputIdentity) -> Result<Self, InputError> {
        let mut keys = AttributeSet::<KeyCode>::new();
        let keyboard: Vec<u16> = names::KEYS
            .iter()
            .map(|&(_, code)| code)
            .filter(|&code| code < 0x100)
            .collect();
        if keyboard.len() > KEY_CAPABILITY_LIMIT {
            warn!(
                dropped = keyboard.len() - KEY_CAPABILITY_LIMIT,
                "key capability set exceeds the kernel limit, dropping excess codes"
            );
        }
        for &code in keyboard.iter().take(KEY_CAPABILITY_LIMIT) {
            keys.insert(KeyCode(code));
        }
        keys.insert(KeyCode::BTN_LEFT);
        keys.insert(KeyCode::BTN_RIGHT);
        keys.insert(KeyCode::BTN_MIDDLE);

        let mut rel = AttributeSet::<RelativeAxisCode>::new();
        rel.insert(RelativeAxisCode::REL_X);
        rel.insert(RelativeAxisCode::REL_Y);
        rel.insert(RelativeAxisCode::REL_WHEEL);

        let device = VirtualDevice::builder()
            .map_err(|e| InputError::OutputCreate(e.to_string()))?
            .name(&identity.name)
            .input_id(evdev::InputId::new(
                BusType::BUS_USB,
                identity.vendor,
                identity.product,
                identity.version,
            ))
            .with_keys(&keys)
            .map_err(|e| InputError::OutputCreate(e.to_string()))?
            .with_relative_axes(&rel)
            .map_err(|e| InputError::OutputCreate(e.to_string()))?
            .build()
            .map_err(|e| InputError::OutputCreate(e.to_string()))?;

        info!(name = %identity.name, "created virtual output device");
        Ok(Self { device })
    }
}

impl EventWriter for UinputWriter {
    fn write_batch(&mut self, batch: &[OutputRecord]) -> std::io::Result<()> {
        // VirtualDevice::emit appends the SYN_REPORT marker.
        let events: Vec<InputEvent> = batch
            .iter()
            .map(|record| match *record {
                OutputRecord::Key { code, press } => {
                    InputEvent::new(EventType::KEY.0, code, i32::from(press))
                }
                OutputRecord::Rel { axis, delta } => {
                    InputEvent::new(EventType::RELATIVE.0, axis, delta)
                }
            })
            .collect();
        self.device.emit(&events)?;
        debug!(count = events.len(), "committed output batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWriter;

    #[test]
    fn synchronize_writes_one_batch() {
        let (writer, handle) = MockWriter::new();
        let mut out = OutputDevice::new(Box::new(writer));
        out.press(34);
        out.release(34);
        out.move_relative(0, 5);
        out.synchronize();

        let batches = handle.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                OutputRecord::Key { code: 34, press: true },
                OutputRecord::Key { code: 34, press: false },
                OutputRecord::Rel { axis: 0, delta: 5 },
            ]
        );
    }

    #[test]
    fn synchronize_is_idempotent_when_clean() {
        let (writer, handle) = MockWriter::new();
        let mut out = OutputDevice::new(Box::new(writer));
        out.synchronize();
        out.press(1);
        out.synchronize();
        out.synchronize();
        assert_eq!(handle.batches().len(), 1);
    }

    #[test]
    fn write_failure_poisons_the_sink() {
        let (writer, handle) = MockWriter::new();
        let mut out = OutputDevice::new(Box::new(writer));
        handle.fail_next();
        out.press(1);
        out.synchronize();
        assert!(!out.is_valid());

        // Everything afterwards is a no-op.
        out.press(2);
        out.synchronize();
        assert_eq!(handle.batches().len(), 0);
    }
}
