//! Listing pages that ship their data as JSON inside a script tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fundwatch_core::{canonicalize_url, derive_external_id, parse_datetime_utc, raw_snapshot, Opportunity, SourceSettings};
use fundwatch_storage::HttpTransport;
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::text::{html_to_text, normalize_whitespace, unescape_text};
use crate::{absolutize, json_field_text, select_first_text, timeout_option, AdapterError, SourceAdapter};

pub const SOURCE_TYPE: &str = "wellcome_schemes";

const DEFAULT_SCRIPT_ID: &str = "__NEXT_DATA__";
const DEFAULT_LISTINGS_PATH: &str = "props.pageProps.initialListings";
const DEFAULT_FUNDER: &str = "Wellcome";
const OPEN_STATUS: &str = "open to applications";

pub struct EmbeddedJsonAdapter {
    settings: SourceSettings,
    http: Arc<dyn HttpTransport>,
    timeout: Duration,
    script_id: String,
    listings_path: Vec<String>,
    funder: String,
}

impl EmbeddedJsonAdapter {
    pub fn new(settings: &SourceSettings, http: Arc<dyn HttpTransport>) -> Result<Self, AdapterError> {
        let listings_path = settings
            .option_str("listings_path")
            .unwrap_or(DEFAULT_LISTINGS_PATH)
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        Ok(Self {
            timeout: timeout_option(settings)?,
            script_id: settings.option_str("script_id").unwrap_or(DEFAULT_SCRIPT_ID).to_string(),
            listings_path,
            funder: settings.option_str("funder").unwrap_or(DEFAULT_FUNDER).to_string(),
            settings: settings.clone(),
            http,
        })
    }

    pub fn factory(
        settings: &SourceSettings,
        http: Arc<dyn HttpTransport>,
    ) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        Ok(Box::new(Self::new(settings, http)?))
    }

    /// Extract the open listings from a fetched page, ordered by title.
    pub fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<Opportunity>, AdapterError> {
        let payload = self.embedded_payload(html)?;
        let Some(listings) = self.listings(&payload) else {
            debug!(source_id = %self.settings.id, "no listing array in embedded payload");
            return Ok(Vec::new());
        };

        let mut items: Vec<Opportunity> = listings
            .iter()
            .filter(|listing| listing.is_object())
            .filter(|listing| is_open(listing))
            .map(|listing| self.listing_to_opportunity(page_url, listing))
            .collect();
        items.sort_by_key(|item| item.title.to_lowercase());
        Ok(items)
    }

    fn embedded_payload(&self, html: &str) -> Result<JsonValue, AdapterError> {
        let document = Html::parse_document(html);
        let selector = format!(r#"script[id="{}"]"#, self.script_id);
        let Some(script) = select_first_text(&document, &selector)? else {
            return Err(AdapterError::MissingArtifact(format!(
                "source {} response has no {} payload",
                self.settings.id, self.script_id
            )));
        };
        serde_json::from_str(&script).map_err(|err| {
            AdapterError::Parse(format!(
                "source {} {} payload is not valid JSON: {err}",
                self.settings.id, self.script_id
            ))
        })
    }

    /// Walk the configured path; when the leading segment is absent, retry
    /// without it (some pages hoist `pageProps` to the top level).
    fn listings<'a>(&self, payload: &'a JsonValue) -> Option<&'a Vec<JsonValue>> {
        let walk = |segments: &[String]| {
            segments
                .iter()
                .try_fold(payload, |cur, segment| cur.get(segment.as_str()))
                .and_then(JsonValue::as_array)
        };
        walk(&self.listings_path).or_else(|| {
            self.listings_path
                .split_first()
                .and_then(|(_, rest)| if rest.is_empty() { None } else { walk(rest) })
        })
    }

    fn listing_to_opportunity(&self, page_url: &str, listing: &JsonValue) -> Opportunity {
        let title = json_field_text(listing, &["title"])
            .map(|t| unescape_text(&t))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled opportunity".to_string());
        let raw_url = json_field_text(listing, &["url"]).unwrap_or_default();
        let url = canonicalize_url(&absolutize(page_url, &raw_url));

        let fallback_seed = if url.is_empty() {
            format!("{}:{title}", self.settings.id)
        } else {
            url.clone()
        };
        let raw_id = json_field_text(listing, &["id"]);
        let external_id = derive_external_id(raw_id.as_deref(), &fallback_seed);

        let date = |key: &str| json_field_text(listing, &[key]).and_then(|v| parse_datetime_utc(&v));
        let total_fund = listing
            .get("level_of_funding")
            .and_then(JsonValue::as_str)
            .map(html_to_text)
            .filter(|v| !v.is_empty());

        Opportunity {
            source_id: self.settings.id.clone(),
            external_id,
            title,
            url,
            published_at: None,
            summary: html_to_text(listing.get("listing_summary").and_then(JsonValue::as_str).unwrap_or_default()),
            closing_date: date("scheme_closes_for_applications"),
            opening_date: date("scheme_opens_for_applications"),
            funder: Some(self.funder.clone()),
            funding_type: json_field_text(listing, &["frequency"]).map(|v| normalize_whitespace(&v)),
            total_fund,
            raw: raw_snapshot(listing),
        }
    }
}

fn is_open(listing: &JsonValue) -> bool {
    listing
        .get("scheme_accepting_applications")
        .and_then(JsonValue::as_str)
        .map(|status| normalize_whitespace(status).to_lowercase() == OPEN_STATUS)
        .unwrap_or(false)
}

#[async_trait]
impl SourceAdapter for EmbeddedJsonAdapter {
    fn source_id(&self) -> &str {
        &self.settings.id
    }

    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    async fn fetch(&self) -> Result<Vec<Opportunity>, AdapterError> {
        let response = self
            .http
            .get(&self.settings.url, self.timeout)
            .await?
            .error_for_status()?;
        self.parse_page(&response.final_url, &response.text())
    }
}
