use crate::config::types::{CaptureConfig, Config, OutputConfig, ReplayConfig, RuleConfig, SourceConfig};
use crate::record::Compression;
use crate::router::builtin;
use crate::ConfigError;
use regex::Regex;
use url::Url;

/// Largest accepted `concurrency`
pub const MAX_CONCURRENCY: usize = 64;

/// Validates the entire configuration
///
/// Nothing here touches the filesystem or the network.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_source_config(&config.source)?;
    validate_replay_config(&config.replay)?;
    validate_output_config(&config.output)?;
    validate_rules(&config.rules)?;
    if let Some(capture) = &config.capture {
        validate_capture_config(capture)?;
    }
    Ok(())
}

/// Validates the storage source
fn validate_source_config(config: &SourceConfig) -> Result<(), ConfigError> {
    if config.root.trim().is_empty() {
        return Err(ConfigError::Validation(
            "source root cannot be empty".to_string(),
        ));
    }

    if config.is_object_storage() {
        let rest = &config.root["s3://".len()..];
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigError::InvalidLocator(format!(
                "{}: bucket cannot be empty",
                config.root
            )));
        }
        if prefix.is_empty() {
            return Err(ConfigError::Validation(format!(
                "object storage prefix cannot be empty in {}",
                config.root
            )));
        }
        if config.access_key_id.is_some() != config.secret_access_key.is_some() {
            return Err(ConfigError::Validation(
                "access-key-id and secret-access-key must be set together".to_string(),
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            Url::parse(endpoint).map_err(|e| {
                ConfigError::InvalidLocator(format!("endpoint {}: {}", endpoint, e))
            })?;
        }
    } else if config.root.contains("://") && !config.root.starts_with("file://") {
        return Err(ConfigError::InvalidLocator(format!(
            "{}: expected a directory path or s3://bucket/prefix",
            config.root
        )));
    }

    Ok(())
}

/// Validates replay behavior settings
fn validate_replay_config(config: &ReplayConfig) -> Result<(), ConfigError> {
    if config.concurrency < 1 || config.concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY, config.concurrency
        )));
    }

    if config.max_recursion_depth < 1 {
        return Err(ConfigError::Validation(
            "max-recursion-depth must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if matches!(&config.jsonl_path, Some(path) if path.is_empty()) {
        return Err(ConfigError::Validation(
            "jsonl-path cannot be empty when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates the ordered rule table
fn validate_rules(rules: &[RuleConfig]) -> Result<(), ConfigError> {
    if rules.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[rule]] is required".to_string(),
        ));
    }

    for rule in rules {
        Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: rule.pattern.clone(),
            source,
        })?;
        builtin::action_for(&rule.action)?;
    }

    Ok(())
}

/// Validates fetch-stage settings
fn validate_capture_config(config: &CaptureConfig) -> Result<(), ConfigError> {
    Compression::from_name(&config.blob_path())?;

    if config.request_timeout == 0 {
        return Err(ConfigError::Validation(
            "request-timeout must be >= 1 second".to_string(),
        ));
    }

    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::Validation(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let (local, domain) = email.split_once('@').ok_or_else(|| {
        ConfigError::Validation(format!("Invalid email format: '{}'", email))
    })?;

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
