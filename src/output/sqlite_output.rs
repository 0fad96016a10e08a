//! SQLite-based output sink
//!
//! Every run gets a row in `runs`; items and skipped locations reference it.
//! All writes are inserts except the final status update of the run row.

use crate::backend::StorageLocation;
use crate::output::schema::initialize_schema;
use crate::output::stats::{load_statistics, RunStatistics};
use crate::output::traits::{ExtractedItem, OutputError, OutputResult, OutputSink, RunStatus};
use crate::replay::ReplayStats;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

struct SinkState {
    conn: Connection,
    run_id: Option<i64>,
}

/// SQLite-based output sink
pub struct SqliteSink {
    state: Mutex<SinkState>,
}

impl SqliteSink {
    /// Opens (or creates) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteSink)` - Successfully opened/created database
    /// * `Err(OutputError)` - Failed to open database
    pub fn open(path: &Path) -> OutputResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self::from_connection(conn))
    }

    /// Creates an in-memory database
    pub fn in_memory() -> OutputResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            state: Mutex::new(SinkState { conn, run_id: None }),
        }
    }

    fn lock(&self) -> OutputResult<MutexGuard<'_, SinkState>> {
        self.state
            .lock()
            .map_err(|e| OutputError::Storage(format!("Failed to lock database: {}", e)))
    }

    /// Id of the run opened by [`OutputSink::begin_run`]
    pub fn run_id(&self) -> OutputResult<Option<i64>> {
        Ok(self.lock()?.run_id)
    }

    /// Statistics for the most recent run in the database
    pub fn statistics(&self) -> OutputResult<RunStatistics> {
        let state = self.lock()?;
        load_statistics(&state.conn)
    }
}

fn active_run(state: &SinkState) -> OutputResult<i64> {
    state
        .run_id
        .ok_or_else(|| OutputError::Write("no run has been started".to_string()))
}

impl OutputSink for SqliteSink {
    fn begin_run(&self, config_hash: &str, source: &str) -> OutputResult<()> {
        let mut state = self.lock()?;
        let now = Utc::now().to_rfc3339();
        state.conn.execute(
            "INSERT INTO runs (started_at, config_hash, source, status) VALUES (?1, ?2, ?3, ?4)",
            params![now, config_hash, source, RunStatus::Running.to_db_string()],
        )?;
        let run_id = state.conn.last_insert_rowid();
        state.run_id = Some(run_id);

        tracing::info!("Started replay run {} ({})", run_id, source);
        Ok(())
    }

    fn write_item(&self, item: &ExtractedItem) -> OutputResult<()> {
        let state = self.lock()?;
        let run_id = active_run(&state)?;
        let data = serde_json::to_string(&item.value)?;

        state.conn.execute(
            "INSERT INTO items (run_id, location, url, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                item.location.to_string(),
                item.url,
                data,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn record_skipped(&self, location: &StorageLocation, reason: &str) -> OutputResult<()> {
        let state = self.lock()?;
        let run_id = active_run(&state)?;

        state.conn.execute(
            "INSERT INTO skipped_locations (run_id, location, reason, skipped_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, location.to_string(), reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn finalize(&self, status: RunStatus, stats: &ReplayStats) -> OutputResult<()> {
        let state = self.lock()?;
        let run_id = active_run(&state)?;

        state.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2,
                locations_listed = ?3, locations_replayed = ?4, locations_skipped = ?5,
                records_decoded = ?6, items_emitted = ?7, follow_ups_queued = ?8
             WHERE id = ?9",
            params![
                status.to_db_string(),
                Utc::now().to_rfc3339(),
                stats.locations_listed as i64,
                stats.locations_replayed as i64,
                stats.locations_skipped as i64,
                stats.records_decoded as i64,
                stats.items_emitted as i64,
                stats.follow_ups_queued as i64,
                run_id
            ],
        )?;

        tracing::info!(
            "Replay run {} finished with status {}",
            run_id,
            status.to_db_string()
        );
        Ok(())
    }
}
