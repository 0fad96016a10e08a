//! Database schema for the SQLite sink

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track replay runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    locations_listed INTEGER NOT NULL DEFAULT 0,
    locations_replayed INTEGER NOT NULL DEFAULT 0,
    locations_skipped INTEGER NOT NULL DEFAULT 0,
    records_decoded INTEGER NOT NULL DEFAULT 0,
    items_emitted INTEGER NOT NULL DEFAULT 0,
    follow_ups_queued INTEGER NOT NULL DEFAULT 0
);

-- Extracted items, append only
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    location TEXT NOT NULL,
    url TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_run ON items(run_id);
CREATE INDEX IF NOT EXISTS idx_items_url ON items(url);

-- Locations abandoned part way through
CREATE TABLE IF NOT EXISTS skipped_locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    location TEXT NOT NULL,
    reason TEXT NOT NULL,
    skipped_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_skipped_run ON skipped_locations(run_id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
