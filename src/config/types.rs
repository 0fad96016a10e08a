use serde::Deserialize;
use std::fmt;

/// Main configuration structure for Twostage
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

/// Where recorded blobs are stored
///
/// `Debug` never prints the secret access key or session token.
#[derive(Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Local directory path or `s3://bucket/prefix`
    pub root: String,

    /// Object storage region (defaults to `us-east-1`)
    #[serde(default)]
    pub region: Option<String>,

    /// Endpoint override for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default, rename = "access-key-id")]
    pub access_key_id: Option<String>,

    #[serde(default, rename = "secret-access-key")]
    pub secret_access_key: Option<String>,

    #[serde(default, rename = "session-token")]
    pub session_token: Option<String>,
}

impl SourceConfig {
    /// Whether the root names an object storage prefix
    pub fn is_object_storage(&self) -> bool {
        self.root.starts_with("s3://")
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("root", &self.root)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Replay behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Abort the run on the first corrupt stream instead of skipping it
    #[serde(default, rename = "fail-on-corrupt")]
    pub fail_on_corrupt: bool,

    /// Replay blobs that handlers point at
    #[serde(default = "default_follow_up", rename = "follow-up")]
    pub follow_up: bool,

    /// Number of locations replayed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How deeply handler-produced records may nest
    #[serde(default = "default_max_recursion_depth", rename = "max-recursion-depth")]
    pub max_recursion_depth: usize,
}

fn default_follow_up() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_max_recursion_depth() -> usize {
    8
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            fail_on_corrupt: false,
            follow_up: default_follow_up(),
            concurrency: default_concurrency(),
            max_recursion_depth: default_max_recursion_depth(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Optional JSON Lines copy of every extracted item
    #[serde(default, rename = "jsonl-path")]
    pub jsonl_path: Option<String>,
}

/// Fetch-stage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Blob written by `--capture`; its extension selects compression
    #[serde(rename = "output-path")]
    pub output_path: String,

    /// Gzip the blob; a plain `.records` output path gains a `.gz` suffix
    #[serde(default)]
    pub compress: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout", rename = "request-timeout")]
    pub request_timeout: u64,

    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

fn default_request_timeout() -> u64 {
    30
}

impl CaptureConfig {
    /// Path the capture blob is written to, honoring `compress`
    pub fn blob_path(&self) -> String {
        if self.compress && !self.output_path.ends_with(".gz") {
            format!("{}.gz", self.output_path)
        } else {
            self.output_path.clone()
        }
    }

    /// User agent sent with every capture request
    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// One `[[rule]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// Regular expression searched for in the record URL
    pub pattern: String,

    /// `drop`, `summary` or `links`
    pub action: String,
}
