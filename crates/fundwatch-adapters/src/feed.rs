//! RSS 2.0 / Atom syndication feed adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundwatch_core::{canonicalize_url, derive_external_id, parse_datetime_utc, raw_snapshot, Opportunity, SourceSettings};
use fundwatch_storage::HttpTransport;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::text::{extract_labelled_fields, html_to_text, normalize_whitespace};
use crate::{timeout_option, AdapterError, SourceAdapter};

pub const SOURCE_TYPE: &str = "rss";

const DEFAULT_TITLE: &str = "Untitled opportunity";

pub struct FeedAdapter {
    settings: SourceSettings,
    http: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl FeedAdapter {
    pub fn new(settings: &SourceSettings, http: Arc<dyn HttpTransport>) -> Result<Self, AdapterError> {
        Ok(Self {
            timeout: timeout_option(settings)?,
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
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
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
        let items = parse_feed(&self.settings.id, &response.body)?;
        debug!(source_id = %self.settings.id, count = items.len(), "parsed feed");
        Ok(items)
    }
}

/// The fields every feed dialect can supply.
struct FeedEntry<'a> {
    title: Option<&'a str>,
    link: Option<&'a str>,
    raw_id: Option<&'a str>,
    published_at: Option<DateTime<Utc>>,
    summary_html: Option<&'a str>,
    tags: Vec<&'a str>,
    raw: JsonValue,
}

/// Parse a feed document, trying RSS first and Atom second.
///
/// Items come back newest first; undated items sort last.
pub fn parse_feed(source_id: &str, body: &[u8]) -> Result<Vec<Opportunity>, AdapterError> {
    let mut items = if let Ok(channel) = rss::Channel::read_from(body) {
        channel
            .items()
            .iter()
            .map(|item| entry_to_opportunity(source_id, rss_entry(item)))
            .collect::<Vec<_>>()
    } else if let Ok(feed) = atom_syndication::Feed::read_from(body) {
        feed.entries()
            .iter()
            .map(|entry| entry_to_opportunity(source_id, atom_entry(entry)))
            .collect::<Vec<_>>()
    } else {
        return Err(AdapterError::Parse(format!(
            "source {source_id}: response is neither an RSS nor an Atom document"
        )));
    };

    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    Ok(items)
}

fn rss_entry(item: &rss::Item) -> FeedEntry<'_> {
    let dublin_core_date = item
        .dublin_core_ext()
        .and_then(|dc| dc.dates().iter().find_map(|d| parse_datetime_utc(d)));

    FeedEntry {
        title: item.title(),
        link: item.link(),
        raw_id: item.guid().map(|guid| guid.value()),
        published_at: item.pub_date().and_then(parse_datetime_utc).or(dublin_core_date),
        summary_html: item.description().or_else(|| item.content()),
        tags: item.categories().iter().map(|c| c.name()).collect(),
        raw: raw_snapshot(item),
    }
}

fn atom_entry(entry: &atom_syndication::Entry) -> FeedEntry<'_> {
    let link = entry
        .links()
        .iter()
        .find(|l| l.rel() == "alternate")
        .or_else(|| entry.links().first())
        .map(|l| l.href());
    let updated = Some(entry.updated().with_timezone(&Utc)).filter(|t| t.timestamp() != 0);

    FeedEntry {
        title: Some(entry.title().as_str()),
        link,
        raw_id: Some(entry.id()),
        published_at: entry.published().map(|p| p.with_timezone(&Utc)).or(updated),
        summary_html: entry
            .summary()
            .map(|s| s.as_str())
            .or_else(|| entry.content().and_then(|c| c.value())),
        tags: entry.categories().iter().map(|c| c.term()).collect(),
        raw: raw_snapshot(entry),
    }
}

fn entry_to_opportunity(source_id: &str, entry: FeedEntry<'_>) -> Opportunity {
    let title = entry
        .title
        .map(normalize_whitespace)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let url = canonicalize_url(entry.link.unwrap_or_default());

    let fallback_seed = if url.is_empty() {
        format!("{source_id}:{title}")
    } else {
        url.clone()
    };
    let external_id = derive_external_id(entry.raw_id, &fallback_seed);

    let summary = html_to_text(entry.summary_html.unwrap_or_default());
    let fields = extract_labelled_fields(&summary);
    let tags: Vec<&str> = entry.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
    let funder = fields.funder.or_else(|| (!tags.is_empty()).then(|| tags.join(", ")));

    Opportunity {
        source_id: source_id.to_string(),
        external_id,
        title,
        url,
        published_at: entry.published_at,
        summary,
        closing_date: fields.closing_date,
        opening_date: fields.opening_date,
        funder,
        funding_type: fields.funding_type,
        total_fund: fields.total_fund,
        raw: entry.raw,
    }
}
