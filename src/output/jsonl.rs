//! JSON Lines output sink

use crate::backend::StorageLocation;
use crate::output::traits::{ExtractedItem, OutputError, OutputResult, OutputSink, RunStatus};
use crate::replay::ReplayStats;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Appends one JSON object per extracted item to a file
///
/// Each line is `{"location": .., "url": .., "item": ..}`. Skipped
/// locations are only logged; the SQLite sink keeps them.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating it if needed
    pub fn open(path: &Path) -> OutputResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut BufWriter<File>) -> OutputResult<T>) -> OutputResult<T> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| OutputError::Write(format!("Failed to lock output file: {}", e)))?;
        f(&mut writer)
    }
}

impl OutputSink for JsonLinesSink {
    fn begin_run(&self, _config_hash: &str, _source: &str) -> OutputResult<()> {
        Ok(())
    }

    fn write_item(&self, item: &ExtractedItem) -> OutputResult<()> {
        let line = serde_json::to_string(&json!({
            "location": item.location.to_string(),
            "url": item.url,
            "item": item.value,
        }))?;

        self.with_writer(|writer| {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            Ok(())
        })
    }

    fn record_skipped(&self, location: &StorageLocation, reason: &str) -> OutputResult<()> {
        tracing::debug!("Not writing skipped location {} to JSON lines: {}", location, reason);
        Ok(())
    }

    fn finalize(&self, _status: RunStatus, _stats: &ReplayStats) -> OutputResult<()> {
        self.with_writer(|writer| Ok(writer.flush()?))
    }
}
