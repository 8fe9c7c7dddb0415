//! JSON-lines sink
//!
//! Appends one `{"destination": ..., "record": ...}` object per line. A batch
//! is serialized in full before anything is written, then written and
//! flushed with a single call.

use crate::output::traits::{OutputError, OutputResult, SinkBackend};
use crate::state::Item;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating it if needed
    pub fn new(path: &Path) -> OutputResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl SinkBackend for JsonLinesSink {
    fn store(&self, items: &[Item]) -> OutputResult<()> {
        let mut buffer = Vec::new();
        for item in items {
            serde_json::to_writer(&mut buffer, item)?;
            buffer.push(b'\n');
        }

        let mut file = self.file.lock().map_err(|_| OutputError::Poisoned)?;
        file.write_all(&buffer)?;
        file.flush()?;
        Ok(())
    }
}
