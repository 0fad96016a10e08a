//! Object storage backend (S3 and S3-compatible services)
//!
//! Listing uses path-style `ListObjectsV2` with continuation tokens, so
//! prefixes holding more than one page of keys are enumerated completely.
//! Requests are signed with SigV4 when credentials are configured and sent
//! anonymously otherwise.

use crate::backend::sigv4::{self, canonical_query, uri_encode, Credentials, SigningRequest};
use crate::backend::{Backend, StorageLocation};
use crate::config::SourceConfig;
use crate::{BackendError, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Explicit settings for one object storage source
///
/// Built by the configuration layer and handed to [`S3Backend::new`]; the
/// backend never reads credentials from anywhere else.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// `s3://bucket/prefix`
    pub locator: String,
    pub region: String,
    /// Overrides `https://s3.{region}.amazonaws.com`
    pub endpoint: Option<String>,
    pub credentials: Option<Credentials>,
}

impl S3Config {
    pub fn from_source(source: &SourceConfig) -> Result<Self, ConfigError> {
        let credentials = match (&source.access_key_id, &source.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: source.session_token.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Validation(
                    "access-key-id and secret-access-key must be set together".to_string(),
                ))
            }
        };

        Ok(Self {
            locator: source.root.clone(),
            region: source
                .region
                .clone()
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            endpoint: source.endpoint.clone(),
            credentials,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ObjectEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectEntry {
    key: String,
}

/// Every object under a bucket prefix is one blob
pub struct S3Backend {
    client: Client,
    endpoint: Url,
    region: String,
    bucket: String,
    prefix: String,
    credentials: Option<Credentials>,
}

impl S3Backend {
    /// Validates the locator and builds the HTTP client
    ///
    /// No request is sent until [`Backend::list`] or [`Backend::fetch`].
    pub fn new(config: S3Config) -> Result<Self, ConfigError> {
        let rest = config.locator.strip_prefix("s3://").ok_or_else(|| {
            ConfigError::InvalidLocator(format!("{}: expected s3://bucket/prefix", config.locator))
        })?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigError::InvalidLocator(format!(
                "{}: bucket cannot be empty",
                config.locator
            )));
        }
        if prefix.is_empty() {
            return Err(ConfigError::Validation(format!(
                "object storage prefix cannot be empty in {}",
                config.locator
            )));
        }

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| ConfigError::InvalidLocator(format!("endpoint {}: {}", endpoint, e)))?;
        if endpoint.host_str().is_none() {
            return Err(ConfigError::InvalidLocator(format!(
                "endpoint {} has no host",
                endpoint
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            region: config.region,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            credentials: config.credentials,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Sends a (signed) GET for a bucket-relative path and returns the body
    async fn get(
        &self,
        bucket: &str,
        key: Option<&str>,
        query: &[(&str, &str)],
    ) -> Result<Bytes, BackendError> {
        let mut canonical_uri = format!(
            "{}/{}",
            self.endpoint.path().trim_end_matches('/'),
            uri_encode(bucket, true)
        );
        if let Some(key) = key {
            canonical_uri.push('/');
            canonical_uri.push_str(&uri_encode(key, false));
        }
        let query = canonical_query(query);

        let mut url = format!(
            "{}://{}{}",
            self.endpoint.scheme(),
            self.host(),
            canonical_uri
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut request = self.client.get(&url);
        if let Some(credentials) = &self.credentials {
            let host = self.host();
            let signing = SigningRequest {
                host: &host,
                canonical_uri: &canonical_uri,
                canonical_query: &query,
                region: &self.region,
                service: "s3",
                now: Utc::now(),
            };
            let headers = sigv4::sign(credentials, &signing)
                .map_err(|_| BackendError::Signing { url: url.clone() })?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request.send().await.map_err(|source| BackendError::Request {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|source| BackendError::Request { url, source })
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn list(&self) -> Result<Vec<StorageLocation>, BackendError> {
        let mut locations = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0;

        loop {
            let mut query = vec![("list-type", "2"), ("prefix", self.prefix.as_str())];
            if let Some(token) = &continuation {
                query.push(("continuation-token", token.as_str()));
            }

            let body = self.get(&self.bucket, None, &query).await?;
            let body = std::str::from_utf8(&body)
                .map_err(|e| BackendError::Listing(format!("listing is not UTF-8: {}", e)))?;
            let page: ListBucketResult =
                quick_xml::de::from_str(body).map_err(|e| BackendError::Listing(e.to_string()))?;
            pages += 1;

            for entry in page.contents {
                if entry.key.ends_with('/') {
                    tracing::debug!("Skipping folder marker {}", entry.key);
                    continue;
                }
                locations.push(StorageLocation::Object {
                    bucket: self.bucket.clone(),
                    key: entry.key,
                });
            }

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(token)) => continuation = Some(token),
                (true, None) => {
                    return Err(BackendError::Listing(
                        "truncated listing without a continuation token".to_string(),
                    ))
                }
                (false, _) => break,
            }
        }

        tracing::info!(
            "Found {} objects under s3://{}/{} ({} listing pages)",
            locations.len(),
            self.bucket,
            self.prefix,
            pages
        );
        Ok(locations)
    }

    async fn fetch(&self, location: &StorageLocation) -> Result<Bytes, BackendError> {
        match location {
            StorageLocation::Object { bucket, key } => self.get(bucket, Some(key), &[]).await,
            other => Err(BackendError::ForeignLocation {
                location: other.to_string(),
                backend: self.name(),
            }),
        }
    }
}
