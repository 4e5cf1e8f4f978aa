//! Core domain model for fundwatch: opportunities, dedupe records and source settings.

pub mod datetime;
pub mod identity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub use datetime::{is_midnight, parse_datetime_utc};
pub use identity::{canonicalize_url, derive_external_id, stable_hash};

pub const CRATE_NAME: &str = "fundwatch-core";

/// One normalized funding or job listing, rebuilt on every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub closing_date: Option<DateTime<Utc>>,
    pub opening_date: Option<DateTime<Utc>>,
    pub funder: Option<String>,
    pub funding_type: Option<String>,
    pub total_fund: Option<String>,
    /// Primitive-only snapshot of the upstream item, kept for audit.
    pub raw: JsonValue,
}

impl Opportunity {
    /// Minimal opportunity with every optional field unset.
    pub fn new(
        source_id: impl Into<String>,
        external_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
            title: title.into(),
            url: url.into(),
            published_at: None,
            summary: String::new(),
            closing_date: None,
            opening_date: None,
            funder: None,
            funding_type: None,
            total_fund: None,
            raw: JsonValue::Object(Map::new()),
        }
    }
}

/// Where an opportunity stands in the posting lifecycle.
///
/// `Unseen` on a persisted record means it was recorded (usually as a filter
/// rejection) but delivery was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Unseen,
    Pending,
    Posted { at: DateTime<Utc> },
    PostFailed { reason: String },
}

impl DeliveryState {
    pub fn is_posted(&self) -> bool {
        matches!(self, Self::Posted { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Durable bookkeeping row, one per external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub external_id: String,
    pub source_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub title: String,
    pub url: String,
    pub match_reason: Option<String>,
    pub delivery: DeliveryState,
}

/// Validated settings for one configured source.
///
/// Keys other than `id`, `type` and `url` are kept in `options` and decoded by
/// the adapter that owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub url: String,
    #[serde(flatten)]
    pub options: Map<String, JsonValue>,
}

impl SourceSettings {
    pub fn new(id: impl Into<String>, source_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_type: source_type.into(),
            url: url.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Human-facing name, falling back to the source id.
    pub fn display_name(&self) -> &str {
        self.option_str("display_name").unwrap_or(&self.id)
    }
}

/// Serialize any value into a JSON object for `Opportunity::raw`.
///
/// Non-object values are wrapped as `{"value": ...}`; values that fail to
/// serialize degrade to their error string rather than aborting the fetch.
pub fn raw_snapshot<T: Serialize>(value: &T) -> JsonValue {
    let serialized = serde_json::to_value(value).unwrap_or_else(|err| JsonValue::String(err.to_string()));
    match serialized {
        JsonValue::Object(_) => serialized,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            JsonValue::Object(map)
        }
    }
}
