//! Storage backends holding record stream blobs
//!
//! A backend does two read-only things: enumerate every blob under its root
//! and fetch one blob's bytes. Two implementations exist:
//! - [`DirectoryBackend`]: every regular file below a local directory
//! - [`S3Backend`]: every object below an `s3://bucket/prefix` locator

mod local;
mod s3;
pub mod sigv4;

pub use local::DirectoryBackend;
pub use s3::{S3Backend, S3Config};
pub use sigv4::Credentials;

use crate::config::SourceConfig;
use crate::{BackendError, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Reference to one blob inside a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageLocation {
    /// Absolute path of a local file
    File(PathBuf),

    /// Object key inside a bucket
    Object { bucket: String, key: String },
}

impl StorageLocation {
    /// Parses `s3://bucket/key`, `file:///abs/path` or a bare filesystem path
    pub fn parse(locator: &str) -> Result<Self, ConfigError> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(ConfigError::InvalidLocator(
                "locator cannot be empty".to_string(),
            ));
        }

        // Keys are taken verbatim so that `Display` and `parse` agree
        if let Some(rest) = locator.strip_prefix("s3://") {
            return match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self::Object {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }),
                _ => Err(ConfigError::InvalidLocator(format!(
                    "{}: expected s3://bucket/key",
                    locator
                ))),
            };
        }

        if locator.starts_with("file://") {
            let url = Url::parse(locator)
                .map_err(|e| ConfigError::InvalidLocator(format!("{}: {}", locator, e)))?;
            let path = url.to_file_path().map_err(|_| {
                ConfigError::InvalidLocator(format!("{}: not an absolute file path", locator))
            })?;
            return Ok(Self::File(path));
        }

        Ok(Self::File(PathBuf::from(locator)))
    }

    /// The path or key, used to recognize the blob's stream format
    pub fn name(&self) -> String {
        match self {
            Self::File(path) => path.to_string_lossy().into_owned(),
            Self::Object { key, .. } => key.clone(),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Object { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

/// A read-only source of record stream blobs
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier for logging
    fn name(&self) -> &'static str;

    /// Lists every blob under the backend's root
    ///
    /// Order is whatever the backend produces; callers must not depend on it.
    async fn list(&self) -> Result<Vec<StorageLocation>, BackendError>;

    /// Fetches the raw bytes of one blob
    async fn fetch(&self, location: &StorageLocation) -> Result<Bytes, BackendError>;
}

/// Builds the backend a source section describes
///
/// `s3://` roots select [`S3Backend`]; anything else is a local directory.
pub fn from_config(source: &SourceConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    if source.root.starts_with("s3://") {
        let config = S3Config::from_source(source)?;
        Ok(Arc::new(S3Backend::new(config)?))
    } else {
        match StorageLocation::parse(&source.root)? {
            StorageLocation::File(path) => Ok(Arc::new(DirectoryBackend::new(path)?)),
            other => Err(ConfigError::InvalidLocator(format!(
                "{}: not a directory root",
                other
            ))),
        }
    }
}
