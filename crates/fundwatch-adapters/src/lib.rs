//! Source adapter contracts, the source-type registry and the built-in adapters.

pub mod competition_cards;
pub mod embedded_json;
pub mod feed;
pub mod job_board;
pub mod registry;
pub mod text;

use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use fundwatch_core::{Opportunity, SourceSettings};
use fundwatch_storage::FetchError;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

pub use competition_cards::CompetitionCardsAdapter;
pub use embedded_json::EmbeddedJsonAdapter;
pub use feed::FeedAdapter;
pub use job_board::JobBoardAdapter;
pub use registry::{global_registry, SourceFactory, SourceRegistry};

pub const CRATE_NAME: &str = "fundwatch-adapters";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing page artifact: {0}")]
    MissingArtifact(String),
    #[error("invalid option `{key}` for source {source_id}: {message}")]
    InvalidOption {
        source_id: String,
        key: String,
        message: String,
    },
    #[error("unknown source type `{requested}` (available: {})", available.join(", "))]
    UnknownSourceType {
        requested: String,
        available: Vec<String>,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn source_type(&self) -> &'static str;

    /// Fetch and normalize the source's current listings, in the adapter's
    /// declared order.
    async fn fetch(&self) -> Result<Vec<Opportunity>, AdapterError>;
}

pub(crate) fn invalid_option(settings: &SourceSettings, key: &str, message: impl Into<String>) -> AdapterError {
    AdapterError::InvalidOption {
        source_id: settings.id.clone(),
        key: key.to_string(),
        message: message.into(),
    }
}

/// Per-request timeout from the `timeout_seconds` option.
pub fn timeout_option(settings: &SourceSettings) -> Result<Duration, AdapterError> {
    let seconds = u64_option(settings, "timeout_seconds")?.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
    if seconds == 0 {
        return Err(invalid_option(settings, "timeout_seconds", "must be at least 1"));
    }
    Ok(Duration::from_secs(seconds))
}

pub(crate) fn u64_option(settings: &SourceSettings, key: &str) -> Result<Option<u64>, AdapterError> {
    match settings.options.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid_option(settings, key, "expected a non-negative integer")),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| invalid_option(settings, key, format!("`{s}` is not an integer"))),
        Some(other) => Err(invalid_option(settings, key, format!("expected an integer, got {other}"))),
    }
}

pub(crate) fn f64_option(settings: &SourceSettings, key: &str) -> Result<Option<f64>, AdapterError> {
    match settings.options.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => Ok(n.as_f64()),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid_option(settings, key, format!("`{s}` is not a number"))),
        Some(other) => Err(invalid_option(settings, key, format!("expected a number, got {other}"))),
    }
}

/// A list option given either as a YAML sequence or a comma-separated string.
pub(crate) fn string_list_option(settings: &SourceSettings, key: &str) -> Vec<String> {
    let values: Vec<String> = match settings.options.get(key) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(json_scalar_text)
            .collect(),
        Some(JsonValue::String(s)) => s.split(',').map(ToString::to_string).collect(),
        _ => Vec::new(),
    };
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Text of a JSON string or number, trimmed; `None` for anything else or blank.
pub(crate) fn json_scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub(crate) fn json_field_text(record: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| record.get(*key).and_then(json_scalar_text))
}

/// Resolve a possibly relative link against the page it was found on.
pub(crate) fn absolutize(base: &str, link: &str) -> String {
    let link = link.trim();
    if link.is_empty() || link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    Url::parse(base)
        .and_then(|base| base.join(link))
        .map(|joined| joined.to_string())
        .unwrap_or_else(|_| link.to_string())
}

/// Closing date ascending, undated items last. Stable.
pub(crate) fn sort_by_closing_date(items: &mut [Opportunity]) {
    items.sort_by(|a, b| match (a.closing_date, b.closing_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

pub(crate) fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>())
        .filter(|s| !s.trim().is_empty()))
}
