//! Mock output writer for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::output::{EventWriter, OutputRecord};

#[derive(Debug, Default)]
struct MockWriterState {
    batches: Vec<Vec<OutputRecord>>,
}

/// Records each committed batch for later inspection.
pub struct MockWriter {
    state: Arc<Mutex<MockWriterState>>,
    fail: Arc<AtomicBool>,
}

impl MockWriter {
    /// Create a writer and an observer handle.
    pub fn new() -> (Self, MockWriterHandle) {
        let state = Arc::new(Mutex::new(MockWriterState::default()));
        let fail = Arc::new(AtomicBool::new(false));
        let writer = Self {
            state: Arc::clone(&state),
            fail: Arc::clone(&fail),
        };
        (writer, MockWriterHandle { state, fail })
    }
}

impl EventWriter for MockWriter {
    fn write_batch(&mut self, batch: &[OutputRecord]) -> std::io::Result<()> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::other("mock write failure"));
        }
        self.state.lock().unwrap().batches.push(batch.to_vec());
        Ok(())
    }
}

/// Clonable observer handle for [`MockWriter`].
#[derive(Clone)]
pub struct MockWriterHandle {
    state: Arc<Mutex<MockWriterState>>,
    fail: Arc<AtomicBool>,
}

impl MockWriterHandle {
    /// Snapshot of all committed batches, one entry per synchronize.
    pub fn batches(&self) -> Vec<Vec<OutputRecord>> {
        self.state.lock().unwrap().batches.clone()
    }

    /// All committed records in commit order, batch boundaries dropped.
    pub fn records(&self) -> Vec<OutputRecord> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Make the next `write_batch` fail with an I/O error.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}
