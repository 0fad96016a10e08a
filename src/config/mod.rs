//! Configuration module for Twostage
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use twostage::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("twostage.toml")).unwrap();
//! println!("Replaying from {}", config.source.root);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{CaptureConfig, Config, OutputConfig, ReplayConfig, RuleConfig, SourceConfig};

// Re-export parser functions
pub use parser::{
    compute_config_hash, fill_credentials, load_config, load_config_with_hash, parse_config,
};
pub use validation::{validate, MAX_CONCURRENCY};

use crate::backend::{self, Backend};
use crate::replay::ReplayOptions;
use crate::router::{builtin, Router};
use crate::ConfigError;
use std::sync::Arc;

impl Config {
    /// Compiles the `[[rule]]` table, in file order
    pub fn build_router(&self) -> Result<Router, ConfigError> {
        let rules = self
            .rules
            .iter()
            .map(|rule| builtin::rule(&rule.pattern, &rule.action))
            .collect::<Result<Vec<_>, _>>()?;
        Router::new(rules)
    }

    /// Replay driver settings from the `[replay]` section
    pub fn replay_options(&self) -> ReplayOptions {
        ReplayOptions {
            fail_on_corrupt: self.replay.fail_on_corrupt,
            follow_up: self.replay.follow_up,
            concurrency: self.replay.concurrency,
            max_recursion_depth: self.replay.max_recursion_depth,
        }
    }

    /// Builds the storage backend named by `[source]` without any I/O
    pub fn backend(&self) -> Result<Arc<dyn Backend>, ConfigError> {
        backend::from_config(&self.source)
    }
}
