//! Responses handed to extraction handlers
//!
//! A [`Response`] has the same shape whether it came from a live fetch in the
//! capture stage or was rebuilt from a [`Record`] during replay, so a handler
//! written against one runs unchanged against the other.

pub mod html;

use crate::record::{Headers, Record};
use chrono::{DateTime, Utc};
use scraper::Html;
use std::collections::BTreeSet;
use url::Url;

/// Status assumed for records that were persisted without one
pub const DEFAULT_STATUS: u16 = 200;

/// Text encoding of every response body
pub const BODY_ENCODING: &str = "utf-8";

/// A fetched (or re-materialized) page
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    url: String,
    status: u16,
    headers: Headers,
    flags: BTreeSet<String>,
    text: String,
    fetched_at: Option<DateTime<Utc>>,
    extra_urls: Vec<String>,
}

/// Rebuilds the response a live fetch of `record.url` produced
///
/// Pure and deterministic: optional fields missing from the record take
/// their defaults ([`DEFAULT_STATUS`], no headers, no flags).
pub fn reconstruct(record: &Record) -> Response {
    Response {
        url: record.url.clone(),
        status: record.status.unwrap_or(DEFAULT_STATUS),
        headers: record.headers.clone(),
        flags: record.flags.clone(),
        text: record.body_text.clone(),
        fetched_at: record.fetch_timestamp,
        extra_urls: record.extra_urls.clone(),
    }
}

impl From<Record> for Response {
    fn from(record: Record) -> Self {
        Self {
            url: record.url,
            status: record.status.unwrap_or(DEFAULT_STATUS),
            headers: record.headers,
            flags: record.flags,
            text: record.body_text,
            fetched_at: record.fetch_timestamp,
            extra_urls: record.extra_urls,
        }
    }
}

impl Response {
    /// Builds a response from live fetch results
    pub fn new(url: impl Into<String>, status: u16, headers: Headers, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            headers,
            flags: BTreeSet::new(),
            text: text.into(),
            fetched_at: None,
            extra_urls: Vec::new(),
        }
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(fetched_at);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of a header, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Decoded body text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Body bytes in [`BODY_ENCODING`]
    pub fn body(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn encoding(&self) -> &'static str {
        BODY_ENCODING
    }

    /// When the page was originally fetched, if recorded
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    /// Related URLs the fetch stage attached to this page
    pub fn extra_urls(&self) -> &[String] {
        &self.extra_urls
    }

    /// Resolves a possibly relative href against this page's URL
    pub fn urljoin(&self, href: &str) -> Option<String> {
        let base = Url::parse(&self.url).ok()?;
        base.join(href.trim()).ok().map(|url| url.to_string())
    }

    /// Parses the body as an HTML document
    pub fn html(&self) -> Html {
        Html::parse_document(&self.text)
    }

    /// Trimmed `<title>` of the page
    pub fn title(&self) -> Option<String> {
        html::extract_title(&self.html())
    }

    /// Absolute http(s) links found on the page
    ///
    /// Empty when the page URL itself cannot be parsed.
    pub fn links(&self) -> Vec<String> {
        match Url::parse(&self.url) {
            Ok(base) => html::extract_links(&self.html(), &base),
            Err(_) => Vec::new(),
        }
    }
}
