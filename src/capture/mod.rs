//! Fetch stage
//!
//! This module handles the network side of the pipeline:
//! - Building HTTP clients with proper user agent strings
//! - GET requests that keep the response exactly as served
//! - Appending each fetched page to a record stream for later replay

use crate::config::CaptureConfig;
use crate::record::{Headers, Record, RecordWriter};
use crate::response::Response;
use chrono::Utc;
use reqwest::Client;
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;

/// Fetch-stage failures
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to write record: {0}")]
    Write(#[from] io::Error),
}

/// Outcome counts of one capture pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub captured: usize,
    pub failed: usize,
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The capture configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(CaptureError)` - Failed to build client
pub fn build_http_client(config: &CaptureConfig) -> Result<Client, CaptureError> {
    Client::builder()
        .user_agent(config.user_agent())
        .timeout(Duration::from_secs(config.request_timeout))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
        .map_err(CaptureError::Client)
}

/// Fetches one page with a single GET
///
/// Redirects are followed by the client; the response carries the final
/// URL. Non-success statuses are not errors: a 404 page is recorded like
/// any other.
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - The URL to fetch
///
/// # Returns
///
/// * `Ok(Response)` - The page, stamped with the current time
/// * `Err(CaptureError)` - Transport failure
pub async fn fetch_page(client: &Client, url: &str) -> Result<Response, CaptureError> {
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            CaptureError::Timeout {
                url: url.to_string(),
            }
        } else {
            CaptureError::Request {
                url: url.to_string(),
                source: e,
            }
        }
    };

    let response = client.get(url).send().await.map_err(classify)?;
    let final_url = response.url().to_string();
    let status = response.status().as_u16();

    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        headers.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
    }

    let text = response.text().await.map_err(classify)?;

    Ok(Response::new(final_url, status, headers, text).with_fetched_at(Utc::now()))
}

/// Fetches every URL in turn and appends each page to `writer`
///
/// A URL that cannot be fetched is logged and left out of the stream; the
/// rest are still captured. Links found on each page are stored alongside
/// it. Write failures stop the pass.
pub async fn capture_urls<W: Write>(
    client: &Client,
    urls: &[String],
    writer: &mut RecordWriter<W>,
) -> Result<CaptureSummary, CaptureError> {
    let mut summary = CaptureSummary::default();

    for url in urls {
        match fetch_page(client, url).await {
            Ok(response) => {
                let record = Record::from_response(&response).with_extra_urls(response.links());
                writer.write(&record)?;
                summary.captured += 1;
                tracing::info!("Captured {} (HTTP {})", response.url(), response.status());
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!("Failed to capture {}: {}", url, e);
            }
        }
    }

    tracing::info!(
        "Capture finished: {} captured, {} failed",
        summary.captured,
        summary.failed
    );
    Ok(summary)
}
