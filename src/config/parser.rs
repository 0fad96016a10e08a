use crate::config::types::{Config, SourceConfig};
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Environment variables consulted for object storage credentials
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Loads and parses a configuration file from the given path
///
/// Credentials missing from an `s3://` source are filled from the standard
/// AWS environment variables here, once; nothing downstream reads the
/// environment.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_config(&content)?;

    fill_credentials(&mut config.source, |name| std::env::var(name).ok());
    validate(&config)?;

    Ok(config)
}

/// Parses TOML text without consulting the environment or validating
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Fills absent credential keys of an object storage source from `lookup`
pub fn fill_credentials<F>(source: &mut SourceConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if !source.is_object_storage() {
        return;
    }

    let read = |name: &str| lookup(name).filter(|value| !value.is_empty());
    if source.access_key_id.is_none() {
        source.access_key_id = read(ENV_ACCESS_KEY_ID);
    }
    if source.secret_access_key.is_none() {
        source.secret_access_key = read(ENV_SECRET_ACCESS_KEY);
    }
    if source.session_token.is_none() {
        source.session_token = read(ENV_SESSION_TOKEN);
    }
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Recorded with every run so results can be tied to the rule table that
/// produced them.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
