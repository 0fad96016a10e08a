//! Statistics generation from the sink database
//!
//! This module provides functionality for extracting and displaying
//! replay statistics from a SQLite sink.

use crate::output::traits::{OutputError, OutputResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use url::Url;

/// How many hosts `print_statistics` lists
const TOP_HOSTS: usize = 10;

/// Replay statistics for one run
#[derive(Debug, Clone, Default)]
pub struct RunStatistics {
    pub run_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub config_hash: String,
    pub source: String,

    pub locations_listed: u64,
    pub locations_replayed: u64,
    pub locations_skipped: u64,
    pub records_decoded: u64,
    pub items_emitted: u64,
    pub follow_ups_queued: u64,

    /// Items actually stored for the run
    pub total_items: u64,

    /// Item counts per URL host, largest first
    pub items_by_host: Vec<(String, u64)>,

    /// Skipped locations with the reason each was abandoned
    pub skipped: Vec<(String, String)>,
}

/// Loads statistics for the most recent run
///
/// # Arguments
///
/// * `conn` - Connection to a sink database
///
/// # Returns
///
/// * `Ok(RunStatistics)` - Successfully loaded statistics
/// * `Err(OutputError)` - No runs recorded, or the query failed
pub fn load_statistics(conn: &Connection) -> OutputResult<RunStatistics> {
    let mut stats = conn
        .query_row(
            "SELECT id, started_at, finished_at, status, config_hash, source,
                    locations_listed, locations_replayed, locations_skipped,
                    records_decoded, items_emitted, follow_ups_queued
             FROM runs ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(RunStatistics {
                    run_id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    status: row.get(3)?,
                    config_hash: row.get(4)?,
                    source: row.get(5)?,
                    locations_listed: row.get::<_, i64>(6)? as u64,
                    locations_replayed: row.get::<_, i64>(7)? as u64,
                    locations_skipped: row.get::<_, i64>(8)? as u64,
                    records_decoded: row.get::<_, i64>(9)? as u64,
                    items_emitted: row.get::<_, i64>(10)? as u64,
                    follow_ups_queued: row.get::<_, i64>(11)? as u64,
                    ..RunStatistics::default()
                })
            },
        )
        .optional()?
        .ok_or_else(|| OutputError::Storage("No replay runs found in database".to_string()))?;

    stats.total_items = conn.query_row(
        "SELECT COUNT(*) FROM items WHERE run_id = ?1",
        params![stats.run_id],
        |row| row.get::<_, i64>(0),
    )? as u64;

    let mut stmt = conn.prepare("SELECT url FROM items WHERE run_id = ?1")?;
    let urls = stmt
        .query_map(params![stats.run_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    stats.items_by_host = count_hosts(&urls);

    let mut stmt = conn.prepare(
        "SELECT location, reason FROM skipped_locations WHERE run_id = ?1 ORDER BY id",
    )?;
    stats.skipped = stmt
        .query_map(params![stats.run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stats)
}

fn count_hosts(urls: &[String]) -> Vec<(String, u64)> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for url in urls {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "(unknown)".to_string());
        *counts.entry(host).or_insert(0) += 1;
    }

    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &RunStatistics) {
    println!("=== Replay Statistics ===\n");

    println!("Run:");
    println!("  Id: {}", stats.run_id);
    println!("  Source: {}", stats.source);
    println!("  Status: {}", stats.status);
    println!("  Started: {}", stats.started_at);
    if let Some(finished) = &stats.finished_at {
        println!("  Finished: {}", finished);
    }
    println!("  Config hash: {}", stats.config_hash);
    println!();

    println!("Overview:");
    println!(
        "  Locations: {} listed, {} replayed, {} skipped",
        stats.locations_listed, stats.locations_replayed, stats.locations_skipped
    );
    println!("  Records decoded: {}", stats.records_decoded);
    println!("  Items stored: {}", stats.total_items);
    println!("  Follow-ups queued: {}", stats.follow_ups_queued);
    println!();

    if !stats.items_by_host.is_empty() {
        println!("Items by Host:");
        for (host, count) in stats.items_by_host.iter().take(TOP_HOSTS) {
            let percentage = if stats.total_items > 0 {
                (*count as f64 / stats.total_items as f64) * 100.0
            } else {
                0.0
            };
            println!("  {}: {} ({:.1}%)", host, count, percentage);
        }
        println!();
    }

    if !stats.skipped.is_empty() {
        println!("Skipped Locations ({}):", stats.skipped.len());
        for (location, reason) in &stats.skipped {
            println!("  - {}: {}", location, reason);
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::schema::initialize_schema;

    #[test]
    fn test_no_runs_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(matches!(
            load_statistics(&conn),
            Err(OutputError::Storage(_))
        ));
    }

    #[test]
    fn test_count_hosts_orders_by_count() {
        let urls = vec![
            "http://b.example/1".to_string(),
            "http://a.example/1".to_string(),
            "http://b.example/2".to_string(),
            "not a url".to_string(),
        ];
        assert_eq!(
            count_hosts(&urls),
            vec![
                ("b.example".to_string(), 2),
                ("(unknown)".to_string(), 1),
                ("a.example".to_string(), 1),
            ]
        );
    }
}
