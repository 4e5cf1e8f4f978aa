//! Job boards that hand out a session token pair on an HTML entry page and
//! serve listings from a JSON search endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fundwatch_core::{canonicalize_url, derive_external_id, parse_datetime_utc, raw_snapshot, Opportunity, SourceSettings};
use fundwatch_storage::HttpTransport;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::text::html_to_text;
use crate::{
    absolutize, invalid_option, json_field_text, sort_by_closing_date, string_list_option, timeout_option, u64_option,
    AdapterError, SourceAdapter,
};

pub const SOURCE_TYPE: &str = "job_board";

const DEFAULT_SESSION_TOKEN_PATTERN: &str = r#"(?i)["']?sessionId["']?\s*[:=]\s*["']([^"']+)["']"#;
const DEFAULT_REQUEST_TOKEN_PATTERN: &str =
    r#"(?i)name=["']__RequestVerificationToken["'][^>]*?value=["']([^"']+)["']"#;
const MOVED_LINK_PATTERN: &str = r#"(?is)moved.{0,200}?<a[^>]+href=["']([^"']+)["']"#;
const META_REFRESH_PATTERN: &str =
    r#"(?is)<meta[^>]+http-equiv=["']?refresh["']?[^>]*content=["'][^"']*?url=([^"'>\s]+)"#;

const DEFAULT_PAGE_SIZE: u64 = 50;
const DEFAULT_MAX_PAGES: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub session_id: String,
    pub request_token: String,
}

pub struct JobBoardAdapter {
    settings: SourceSettings,
    http: Arc<dyn HttpTransport>,
    timeout: Duration,
    api_url: String,
    session_pattern: Regex,
    request_pattern: Regex,
    moved_pattern: Regex,
    refresh_pattern: Regex,
    include_keywords: Vec<String>,
    exclude_keywords: Vec<String>,
    page_size: u64,
    max_pages: u64,
}

impl JobBoardAdapter {
    pub fn new(settings: &SourceSettings, http: Arc<dyn HttpTransport>) -> Result<Self, AdapterError> {
        let Some(api_url) = settings.option_str("api_url") else {
            return Err(invalid_option(settings, "api_url", "required for job_board sources"));
        };
        let pattern = |key: &str, default: &str| {
            Regex::new(settings.option_str(key).unwrap_or(default))
                .map_err(|err| invalid_option(settings, key, err.to_string()))
        };
        let fixed = |source: &str| Regex::new(source).map_err(|err| AdapterError::Message(err.to_string()));

        let page_size = u64_option(settings, "page_size")?.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(invalid_option(settings, "page_size", "must be at least 1"));
        }

        let lowered = |key: &str| {
            string_list_option(settings, key)
                .into_iter()
                .map(|k| k.to_lowercase())
                .collect::<Vec<_>>()
        };
        let include_keywords = lowered("include_keywords");
        if include_keywords.is_empty() {
            return Err(invalid_option(settings, "include_keywords", "must list at least one keyword"));
        }

        Ok(Self {
            timeout: timeout_option(settings)?,
            api_url: absolutize(&settings.url, api_url),
            session_pattern: pattern("session_token_pattern", DEFAULT_SESSION_TOKEN_PATTERN)?,
            request_pattern: pattern("request_token_pattern", DEFAULT_REQUEST_TOKEN_PATTERN)?,
            moved_pattern: fixed(MOVED_LINK_PATTERN)?,
            refresh_pattern: fixed(META_REFRESH_PATTERN)?,
            include_keywords,
            exclude_keywords: lowered("exclude_keywords"),
            page_size,
            max_pages: u64_option(settings, "max_pages")?.unwrap_or(DEFAULT_MAX_PAGES).max(1),
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

    pub fn extract_tokens(&self, html: &str) -> Option<SessionTokens> {
        let capture = |re: &Regex| {
            re.captures(html)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Some(SessionTokens {
            session_id: capture(&self.session_pattern)?,
            request_token: capture(&self.request_pattern)?,
        })
    }

    /// Link to follow when the entry page says it has moved.
    pub fn moved_link(&self, page_url: &str, html: &str) -> Option<String> {
        [&self.moved_pattern, &self.refresh_pattern]
            .iter()
            .find_map(|re| re.captures(html).and_then(|caps| caps.get(1)))
            .map(|m| absolutize(page_url, &m.as_str().replace("&amp;", "&")))
    }

    async fn session(&self) -> Result<SessionTokens, AdapterError> {
        let entry = self
            .http
            .get(&self.settings.url, self.timeout)
            .await?
            .error_for_status()?;
        let html = entry.text();
        if let Some(tokens) = self.extract_tokens(&html) {
            return Ok(tokens);
        }

        let Some(moved) = self.moved_link(&entry.final_url, &html) else {
            return Err(self.missing_tokens(&entry.final_url));
        };
        info!(source_id = %self.settings.id, from = %entry.final_url, to = %moved, "entry page moved; following once");
        let relocated = self.http.get(&moved, self.timeout).await?.error_for_status()?;
        self.extract_tokens(&relocated.text())
            .ok_or_else(|| self.missing_tokens(&relocated.final_url))
    }

    fn missing_tokens(&self, page_url: &str) -> AdapterError {
        AdapterError::MissingArtifact(format!(
            "source {} could not find session tokens on {page_url}",
            self.settings.id
        ))
    }

    async fn fetch_records(&self, tokens: &SessionTokens) -> Result<Vec<JsonValue>, AdapterError> {
        let headers = vec![("RequestVerificationToken".to_string(), tokens.request_token.clone())];
        let mut records = Vec::new();

        for page in 1..=self.max_pages {
            let body = json!({
                "sessionId": tokens.session_id,
                "page": page,
                "pageSize": self.page_size,
            });
            let response = self
                .http
                .post_json(&self.api_url, &headers, &body, self.timeout)
                .await?
                .error_for_status()?;
            let payload: JsonValue = serde_json::from_slice(&response.body).map_err(|err| {
                AdapterError::Parse(format!("source {} page {page} is not valid JSON: {err}", self.settings.id))
            })?;

            let batch = page_records(&payload);
            debug!(source_id = %self.settings.id, page, count = batch.len(), "fetched job board page");
            if batch.is_empty() {
                break;
            }
            records.extend(batch.iter().cloned());

            let total_pages = payload.get("totalPages").and_then(JsonValue::as_u64);
            if total_pages.is_some_and(|total| page >= total) {
                break;
            }
            if page == self.max_pages {
                if let Some(total) = total_pages {
                    warn!(
                        source_id = %self.settings.id,
                        max_pages = self.max_pages,
                        total_pages = total,
                        "max_pages reached; remaining pages not fetched"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Lowercased substring relevance over title and description.
    pub fn is_relevant(&self, title: &str, description: &str) -> bool {
        let haystack = format!("{title} {description}").to_lowercase();
        self.include_keywords.iter().any(|k| haystack.contains(k.as_str()))
            && !self.exclude_keywords.iter().any(|k| haystack.contains(k.as_str()))
    }

    pub fn records_to_opportunities(&self, records: &[JsonValue]) -> Vec<Opportunity> {
        let mut items: Vec<Opportunity> = records
            .iter()
            .filter(|record| record.is_object())
            .filter_map(|record| self.record_to_opportunity(record))
            .collect();
        sort_by_closing_date(&mut items);
        items
    }

    fn record_to_opportunity(&self, record: &JsonValue) -> Option<Opportunity> {
        let title = json_field_text(record, &["title", "jobTitle"]).map(|t| html_to_text(&t).replace('\n', " "))?;
        let summary = record
            .get("description")
            .and_then(JsonValue::as_str)
            .map(html_to_text)
            .unwrap_or_default();
        if !self.is_relevant(&title, &summary) {
            return None;
        }

        let link = json_field_text(record, &["url", "link"]).unwrap_or_default();
        let url = canonicalize_url(&absolutize(&self.api_url, &link));
        let fallback_seed = if url.is_empty() {
            format!("{}:{title}", self.settings.id)
        } else {
            url.clone()
        };
        let raw_id = json_field_text(record, &["id", "jobId"]);
        let date = |keys: &[&str]| json_field_text(record, keys).and_then(|v| parse_datetime_utc(&v));

        Some(Opportunity {
            source_id: self.settings.id.clone(),
            external_id: derive_external_id(raw_id.as_deref(), &fallback_seed),
            title,
            url,
            published_at: date(&["postedDate", "datePosted"]),
            summary,
            closing_date: date(&["closingDate", "closeDate"]),
            opening_date: None,
            funder: json_field_text(record, &["department", "employer"]),
            funding_type: json_field_text(record, &["contractType"]),
            total_fund: json_field_text(record, &["salary"]),
            raw: raw_snapshot(record),
        })
    }
}

fn page_records(payload: &JsonValue) -> &[JsonValue] {
    if let Some(items) = payload.as_array() {
        return items;
    }
    ["results", "items", "jobs"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(JsonValue::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for JobBoardAdapter {
    fn source_id(&self) -> &str {
        &self.settings.id
    }

    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    async fn fetch(&self) -> Result<Vec<Opportunity>, AdapterError> {
        let tokens = self.session().await?;
        let records = self.fetch_records(&tokens).await?;
        Ok(self.records_to_opportunities(&records))
    }
}
