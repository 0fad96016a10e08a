//! Twostage: record once, extract forever
//!
//! This crate splits web harvesting into two independent stages. The capture
//! stage fetches pages and writes each outcome as a framed [`record::Record`]
//! into a blob. The replay stage enumerates those blobs from a storage
//! backend, rebuilds a [`response::Response`] for every record and routes it
//! through an ordered rule table to extraction handlers, without touching the
//! network.

pub mod backend;
pub mod capture;
pub mod config;
pub mod output;
pub mod record;
pub mod replay;
pub mod response;
pub mod router;

use thiserror::Error;

/// Main error type for replay operations
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    #[error("Corrupt record stream: {0}")]
    CorruptStream(#[from] CorruptStreamError),

    #[error("No rule matches URL: {url}")]
    UnroutedUrl { url: String },

    #[error("Handler '{rule}' failed for {url}: {source}")]
    Handler {
        rule: String,
        url: String,
        #[source]
        source: router::HandlerError,
    },

    #[error("Synthetic records nested deeper than {depth} levels at {url}")]
    RecursionLimit { url: String, depth: usize },

    #[error("Output error: {0}")]
    Output(#[from] output::OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
///
/// All of these are raised before any backend I/O, except
/// [`ConfigError::UnrecognizedBlob`] which surfaces when a blob is inspected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid storage locator: {0}")]
    InvalidLocator(String),

    #[error("Invalid rule pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Blob has no recognized record stream extension: {0}")]
    UnrecognizedBlob(String),
}

/// Storage backend failures (enumeration or blob fetch)
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Object storage returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed listing response: {0}")]
    Listing(String),

    #[error("Failed to sign request to {url}")]
    Signing { url: String },

    #[error("Location {location} does not belong to the {backend} backend")]
    ForeignLocation { location: String, backend: &'static str },
}

/// A record stream broke off or was garbled in the middle of a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {record_index} at byte {offset}: {reason}")]
pub struct CorruptStreamError {
    /// Zero-based index of the record that could not be decoded
    pub record_index: usize,

    /// Offset in the decompressed stream where that record's frame starts
    pub offset: u64,

    /// What went wrong
    pub reason: String,
}

/// Result type alias for replay operations
pub type ReplayResult<T> = std::result::Result<T, ReplayError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use backend::{Backend, DirectoryBackend, S3Backend, StorageLocation};
pub use config::Config;
pub use record::{decode_stream, encode, Compression, Headers, Record, RecordReader, RecordWriter};
pub use replay::{Replay, ReplayDriver, ReplayOptions, ReplayStats, Shutdown};
pub use response::{reconstruct, Response};
pub use router::{Action, Handler, HandlerOutput, HandlerResult, Router, Rule};
