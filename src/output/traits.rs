//! Output sink traits and types
//!
//! This module defines the trait interface for output sinks and the
//! records they persist.

use crate::backend::StorageLocation;
use crate::replay::ReplayStats;
use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Write(String),

    #[error("Failed to format output: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for OutputError {
    fn from(err: rusqlite::Error) -> Self {
        OutputError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(err: serde_json::Error) -> Self {
        OutputError::Format(err.to_string())
    }
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// One extraction result together with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedItem {
    /// Blob holding the record that produced the item
    pub location: StorageLocation,

    /// URL of the record whose handler produced the item
    pub url: String,

    /// The item itself, exactly as the handler produced it
    pub value: serde_json::Value,
}

/// Status of a replay run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Trait for output sinks
///
/// Sinks receive calls from every location being replayed at once, so
/// implementations must be thread-safe and append-only: an item is written
/// once and never read back or rewritten during the run.
pub trait OutputSink: Send + Sync {
    /// Opens a new run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - SHA-256 of the configuration file driving the run
    /// * `source` - The replayed source root
    fn begin_run(&self, config_hash: &str, source: &str) -> OutputResult<()>;

    /// Appends one extracted item
    fn write_item(&self, item: &ExtractedItem) -> OutputResult<()>;

    /// Records a location whose remaining records were abandoned
    ///
    /// # Arguments
    ///
    /// * `location` - The skipped blob
    /// * `reason` - Why replay of the blob stopped early
    fn record_skipped(&self, location: &StorageLocation, reason: &str) -> OutputResult<()>;

    /// Closes the run, performing any final writes
    ///
    /// # Arguments
    ///
    /// * `status` - The final status of the run
    /// * `stats` - Counters collected by the driver
    fn finalize(&self, status: RunStatus, stats: &ReplayStats) -> OutputResult<()>;
}

/// Forwards every call to each inner sink in order
pub struct FanoutSink {
    sinks: Vec<Box<dyn OutputSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn OutputSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl OutputSink for FanoutSink {
    fn begin_run(&self, config_hash: &str, source: &str) -> OutputResult<()> {
        self.sinks
            .iter()
            .try_for_each(|sink| sink.begin_run(config_hash, source))
    }

    fn write_item(&self, item: &ExtractedItem) -> OutputResult<()> {
        self.sinks.iter().try_for_each(|sink| sink.write_item(item))
    }

    fn record_skipped(&self, location: &StorageLocation, reason: &str) -> OutputResult<()> {
        self.sinks
            .iter()
            .try_for_each(|sink| sink.record_skipped(location, reason))
    }

    fn finalize(&self, status: RunStatus, stats: &ReplayStats) -> OutputResult<()> {
        self.sinks
            .iter()
            .try_for_each(|sink| sink.finalize(status, stats))
    }
}
