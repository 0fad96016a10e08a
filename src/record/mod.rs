//! Persisted fetch outcomes and their on-disk framing
//!
//! This module handles:
//! - The [`Record`] envelope written once per fetched page
//! - Length-prefixed framing of records into a stream, optionally gzipped
//! - Lazy, resumable decoding of such streams
//! - Append-only writing of streams for the capture stage

mod codec;
mod headers;
mod writer;

pub use codec::{
    decode_bytes, decode_stream, encode, encode_into, Compression, RecordReader, MAX_FRAME_LEN,
    PLAIN_EXTENSION, GZIP_EXTENSION,
};
pub use headers::Headers;
pub use writer::RecordWriter;

use crate::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One persisted fetch outcome
///
/// `url` and `body_text` are always present. Every other field may be absent
/// on the wire; absent fields decode to their defaults and are omitted again
/// when encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub url: String,

    /// HTTP status; replay substitutes 200 when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,

    pub body_text: String,

    /// Markers such as "cached" attached by the fetch stage
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_timestamp: Option<DateTime<Utc>>,

    /// Related URLs discovered at fetch time (image links and the like)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_urls: Vec<String>,
}

impl Record {
    /// Creates a record with only the required fields set
    pub fn new(url: impl Into<String>, body_text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            headers: Headers::new(),
            body_text: body_text.into(),
            flags: BTreeSet::new(),
            fetch_timestamp: None,
            extra_urls: Vec::new(),
        }
    }

    /// Captures a live response as a record
    ///
    /// The fetch timestamp is taken from the response when it carries one,
    /// otherwise the current time is used.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url().to_string(),
            status: Some(response.status()),
            headers: response.headers().clone(),
            body_text: response.text().to_string(),
            flags: response.flags().clone(),
            fetch_timestamp: Some(response.fetched_at().unwrap_or_else(Utc::now)),
            extra_urls: response.extra_urls().to_vec(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.fetch_timestamp = Some(timestamp);
        self
    }

    pub fn with_extra_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_urls.extend(urls.into_iter().map(Into::into));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_are_omitted() {
        let record = Record::new("http://example.com/", "hello");
        let json = serde_json::to_string(&record).unwrap();

        assert_eq!(json, r#"{"url":"http://example.com/","body_text":"hello"}"#);
    }

    #[test]
    fn test_missing_optional_fields_decode_to_defaults() {
        let record: Record =
            serde_json::from_str(r#"{"url":"http://example.com/","body_text":""}"#).unwrap();

        assert_eq!(record.status, None);
        assert!(record.headers.is_empty());
        assert!(record.flags.is_empty());
        assert!(record.fetch_timestamp.is_none());
        assert!(record.extra_urls.is_empty());
    }

    #[test]
    fn test_required_fields_are_enforced() {
        let missing_body = serde_json::from_str::<Record>(r#"{"url":"http://example.com/"}"#);
        assert!(missing_body.is_err());

        let missing_url = serde_json::from_str::<Record>(r#"{"body_text":"x"}"#);
        assert!(missing_url.is_err());
    }

    #[test]
    fn test_from_response_keeps_fetch_metadata() {
        let original = Record::new("http://example.com/a", "<p>a</p>")
            .with_status(404)
            .with_header("Content-Type", "text/html")
            .with_flag("cached")
            .with_extra_urls(["http://example.com/a.png"]);
        let response = crate::response::reconstruct(&original);

        let captured = Record::from_response(&response);

        assert_eq!(captured.url, original.url);
        assert_eq!(captured.status, Some(404));
        assert_eq!(captured.headers, original.headers);
        assert_eq!(captured.flags, original.flags);
        assert_eq!(captured.extra_urls, original.extra_urls);
        assert!(captured.fetch_timestamp.is_some());
    }
}
