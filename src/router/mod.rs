//! Ordered URL rules dispatching responses to extraction handlers
//!
//! Design: a [`Router`] holds rules in caller-defined order. The first rule
//! whose pattern matches a record's URL decides what happens to it; later
//! rules are never consulted, however specific they are. A record that
//! matches no rule is an error, because a silent drop would hide a gap in
//! extraction coverage.

pub mod builtin;

use crate::backend::StorageLocation;
use crate::record::Record;
use crate::response::{reconstruct, Response};
use crate::{ConfigError, ReplayError};
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Error raised by an extraction handler, passed through untouched
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything a handler produced for one response, in order
pub type HandlerResult = Result<Vec<HandlerOutput>, HandlerError>;

/// One item produced by a handler
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// A terminal extraction result for the output sink
    Item(serde_json::Value),

    /// Another blob that should be replayed
    FollowUp(StorageLocation),

    /// A synthetic record that should itself be routed
    Record(Record),
}

/// Extraction logic for one kind of page
///
/// Any `Fn(&Response) -> HandlerResult` closure is a handler.
pub trait Handler: Send + Sync {
    fn handle(&self, response: &Response) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Response) -> HandlerResult + Send + Sync,
{
    fn handle(&self, response: &Response) -> HandlerResult {
        self(response)
    }
}

/// What a matching rule does with a record
#[derive(Clone)]
pub enum Action {
    /// Rebuild the response and run the named handler on it
    Handle {
        name: String,
        handler: Arc<dyn Handler>,
    },

    /// Discard the record without extraction
    Drop,
}

impl Action {
    /// Name used in logs and errors
    pub fn label(&self) -> &str {
        match self {
            Self::Handle { name, .. } => name,
            Self::Drop => "drop",
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle { name, .. } => f.debug_struct("Handle").field("name", name).finish(),
            Self::Drop => f.write_str("Drop"),
        }
    }
}

/// A URL pattern paired with an action
///
/// Patterns use search semantics: they may match anywhere in the URL unless
/// anchored with `^`/`$`.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    action: Action,
}

impl Rule {
    /// Compiles `pattern` once for the lifetime of the rule
    pub fn new(pattern: &str, action: Action) -> Result<Self, ConfigError> {
        let compiled = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self::from_regex(compiled, action))
    }

    /// Uses an already compiled pattern
    pub fn from_regex(pattern: Regex, action: Action) -> Self {
        Self { pattern, action }
    }

    /// Routes matching records to `handler`
    pub fn handle<H>(pattern: &str, name: impl Into<String>, handler: H) -> Result<Self, ConfigError>
    where
        H: Handler + 'static,
    {
        Self::new(
            pattern,
            Action::Handle {
                name: name.into(),
                handler: Arc::new(handler),
            },
        )
    }

    /// Discards matching records
    pub fn drop(pattern: &str) -> Result<Self, ConfigError> {
        Self::new(pattern, Action::Drop)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

/// First-match dispatcher over an ordered rule list
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<Rule>,
}

impl Router {
    /// Creates a router; an empty rule table is a configuration error
    pub fn new(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        if rules.is_empty() {
            return Err(ConfigError::Validation(
                "rule table must contain at least one rule".to_string(),
            ));
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Returns the rule that governs `url`, if any
    pub fn resolve(&self, url: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(url))
    }

    /// Runs the first matching rule for a record
    ///
    /// Returns the handler's outputs in the order it produced them, or
    /// nothing for a drop rule. Outputs are relayed uninterpreted.
    pub fn route(&self, record: &Record) -> Result<Vec<HandlerOutput>, ReplayError> {
        let rule = self
            .resolve(&record.url)
            .ok_or_else(|| ReplayError::UnroutedUrl {
                url: record.url.clone(),
            })?;

        match &rule.action {
            Action::Drop => {
                tracing::debug!("Routing result for '{}': dropped by rule {}", record.url, rule.pattern());
                Ok(Vec::new())
            }
            Action::Handle { name, handler } => {
                tracing::debug!("Routing result for '{}': {}", record.url, name);
                let response = reconstruct(record);
                handler
                    .handle(&response)
                    .map_err(|source| ReplayError::Handler {
                        rule: name.clone(),
                        url: record.url.clone(),
                        source,
                    })
            }
        }
    }
}
