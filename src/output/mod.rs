//! Output module for persisting replay results
//!
//! This module handles:
//! - Appending extracted items to a SQLite database or a JSON Lines file
//! - Recording runs and skipped locations
//! - Summarizing the most recent run

mod jsonl;
mod schema;
mod sqlite_output;
pub mod stats;
mod traits;

pub use jsonl::JsonLinesSink;
pub use sqlite_output::SqliteSink;
pub use stats::{load_statistics, print_statistics, RunStatistics};
pub use traits::{ExtractedItem, FanoutSink, OutputError, OutputResult, OutputSink, RunStatus};

use crate::config::OutputConfig;
use std::path::Path;

/// Opens every sink the output section asks for
///
/// The SQLite sink always comes first; a JSON Lines sink follows when
/// `jsonl-path` is set.
pub fn open_sinks(config: &OutputConfig) -> OutputResult<FanoutSink> {
    let mut sinks: Vec<Box<dyn OutputSink>> =
        vec![Box::new(SqliteSink::open(Path::new(&config.database_path))?)];

    if let Some(path) = &config.jsonl_path {
        sinks.push(Box::new(JsonLinesSink::open(Path::new(path))?));
    }

    Ok(FanoutSink::new(sinks))
}
