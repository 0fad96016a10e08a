//! Handlers available to rule tables loaded from a config file

use crate::router::{Action, HandlerOutput, HandlerResult, Rule};
use crate::response::Response;
use crate::ConfigError;
use serde_json::json;
use std::sync::Arc;

/// Action names accepted in `[[rule]]` tables
pub const ACTION_NAMES: &[&str] = &["drop", "summary", "links"];

/// One item describing the page as a whole
pub fn summary(response: &Response) -> HandlerResult {
    Ok(vec![HandlerOutput::Item(json!({
        "url": response.url(),
        "status": response.status(),
        "title": response.title(),
        "fetched_at": response.fetched_at().map(|t| t.to_rfc3339()),
        "flags": response.flags().iter().collect::<Vec<_>>(),
    }))])
}

/// One `{from, to}` item per outgoing link, in document order
pub fn links(response: &Response) -> HandlerResult {
    Ok(response
        .links()
        .into_iter()
        .map(|to| {
            HandlerOutput::Item(json!({
                "from": response.url(),
                "to": to,
            }))
        })
        .collect())
}

/// Maps an action name from the config file to an [`Action`]
pub fn action_for(name: &str) -> Result<Action, ConfigError> {
    match name {
        "drop" => Ok(Action::Drop),
        "summary" => Ok(Action::Handle {
            name: name.to_string(),
            handler: Arc::new(summary),
        }),
        "links" => Ok(Action::Handle {
            name: name.to_string(),
            handler: Arc::new(links),
        }),
        other => Err(ConfigError::Validation(format!(
            "unknown rule action '{}' (expected one of: {})",
            other,
            ACTION_NAMES.join(", ")
        ))),
    }
}

/// Builds a rule from a pattern and a built-in action name
pub fn rule(pattern: &str, action: &str) -> Result<Rule, ConfigError> {
    Rule::new(pattern, action_for(action)?)
}
