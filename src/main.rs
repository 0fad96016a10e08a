//! Twostage main entry point
//!
//! This is the command-line interface for the record/replay harvester.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use twostage::capture::{build_http_client, capture_urls};
use twostage::config::{load_config_with_hash, Config};
use twostage::output::{open_sinks, print_statistics, OutputSink, SqliteSink};
use twostage::router::{Action, Rule};
use twostage::{Compression, RecordWriter, ReplayDriver, Shutdown};

/// Twostage: record once, extract forever
///
/// Replays recorded pages from a directory or object storage prefix through
/// an ordered rule table, writing extracted items to SQLite and JSON Lines.
/// With --capture it runs the fetch stage instead and records pages.
#[derive(Parser, Debug)]
#[command(name = "twostage")]
#[command(version)]
#[command(about = "Record once, extract forever", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and list what would be replayed without decoding anything
    #[arg(long, conflicts_with_all = ["stats", "capture"])]
    dry_run: bool,

    /// Show statistics of the latest run from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "capture"])]
    stats: bool,

    /// Fetch these URLs into the configured capture blob instead of replaying
    #[arg(long, value_name = "URL", num_args = 1.., conflicts_with_all = ["dry_run", "stats"])]
    capture: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config).await?;
    } else if cli.stats {
        handle_stats(&config)?;
    } else if !cli.capture.is_empty() {
        handle_capture(&config, &cli.capture).await?;
    } else {
        handle_replay(config, &config_hash).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("twostage=info,warn"),
            1 => EnvFilter::new("twostage=debug,info"),
            2 => EnvFilter::new("twostage=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the rule table and every location
async fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Twostage Dry Run ===\n");

    let options = config.replay_options();
    println!("Replay Configuration:");
    println!("  Source: {}", config.source.root);
    println!("  Concurrency: {}", options.concurrency);
    println!("  Follow-ups: {}", options.follow_up);
    println!("  Fail on corrupt stream: {}", options.fail_on_corrupt);
    println!("  Max recursion depth: {}", options.max_recursion_depth);

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);
    if let Some(path) = &config.output.jsonl_path {
        println!("  JSON Lines: {}", path);
    }

    let router = config.build_router()?;
    println!("\nRules ({}):", router.rules().len());
    for (index, rule) in router.rules().iter().enumerate() {
        println!("  {}", rule_line(index, rule));
    }

    let backend = config.backend()?;
    let locations = backend
        .list()
        .await
        .with_context(|| format!("Failed to list {}", config.source.root))?;

    println!("\nLocations ({}):", locations.len());
    let mut unrecognized = 0;
    for location in &locations {
        let compression = match Compression::from_name(&location.name()) {
            Ok(Compression::None) => "plain",
            Ok(Compression::Gzip) => "gzip",
            Err(_) => {
                unrecognized += 1;
                "unrecognized"
            }
        };
        println!("  - {} ({})", location, compression);
    }

    println!("\n✓ Configuration is valid");
    if unrecognized > 0 {
        println!("✗ {} locations have no recognized extension", unrecognized);
    } else {
        println!("✓ Would replay {} locations", locations.len());
    }

    Ok(())
}

/// One numbered `pattern -> action` line of the rule table
fn rule_line(index: usize, rule: &Rule) -> String {
    let action = match rule.action() {
        Action::Handle { name, .. } => name.as_str(),
        Action::Drop => "drop",
    };
    format!("{}. {} -> {}", index + 1, rule.pattern(), action)
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let sink = SqliteSink::open(Path::new(&config.output.database_path))?;
    let stats = sink.statistics()?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --capture mode: records pages for later replay
async fn handle_capture(config: &Config, urls: &[String]) -> anyhow::Result<()> {
    let Some(capture) = &config.capture else {
        bail!("--capture needs a [capture] section in the configuration");
    };

    let blob_path = capture.blob_path();
    tracing::info!("Capturing {} URLs into {}", urls.len(), blob_path);

    let client = build_http_client(capture)?;
    let mut writer = RecordWriter::create(Path::new(&blob_path))?;
    let summary = capture_urls(&client, urls, &mut writer).await?;
    writer
        .finish()
        .with_context(|| format!("Failed to finish {}", blob_path))?;

    println!(
        "✓ Captured {} pages into {} ({} failed)",
        summary.captured, blob_path, summary.failed
    );
    Ok(())
}

/// Handles the main replay operation
async fn handle_replay(config: Config, config_hash: &str) -> anyhow::Result<()> {
    let router = config.build_router()?;
    let backend = config.backend()?;
    let options = config.replay_options();

    tracing::info!(
        "Replaying {} through {} rules ({} at a time)",
        config.source.root,
        router.rules().len(),
        options.concurrency
    );

    let sink: Arc<dyn OutputSink> = Arc::new(open_sinks(&config.output)?);
    sink.begin_run(config_hash, &config.source.root)?;

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing in-flight records");
            signal.trigger();
        }
    });

    let driver = ReplayDriver::new(backend, router, options);
    match driver.run(sink, &shutdown).await {
        Ok(stats) => {
            tracing::info!(
                "Replay completed: {} items from {} records",
                stats.items_emitted,
                stats.records_decoded
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Replay failed: {}", e);
            Err(e.into())
        }
    }
}
