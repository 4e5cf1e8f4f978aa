//! Slack incoming-webhook delivery and message rendering.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundwatch_core::{is_midnight, Opportunity, SourceSettings};
use fundwatch_storage::{FetchError, HttpTransport};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

const SUMMARY_LIMIT: usize = 300;
const NOT_SPECIFIED: &str = "Not specified";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Slack webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Slack webhook request failed: {0}")]
    Transport(#[from] FetchError),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, opportunity: &Opportunity, match_reason: &str) -> Result<(), NotifyError>;
}

/// Source id to human-facing name, taken from each source's `display_name`.
#[derive(Debug, Clone, Default)]
pub struct SourceDisplayNames {
    names: BTreeMap<String, String>,
}

impl SourceDisplayNames {
    pub fn from_sources(sources: &[SourceSettings]) -> Self {
        let names = sources
            .iter()
            .map(|s| (s.id.clone(), s.display_name().to_string()))
            .collect();
        Self { names }
    }

    pub fn insert(&mut self, source_id: impl Into<String>, display_name: impl Into<String>) {
        self.names.insert(source_id.into(), display_name.into());
    }

    pub fn get<'a>(&'a self, source_id: &'a str) -> &'a str {
        self.names.get(source_id).map(String::as_str).unwrap_or(source_id)
    }
}

pub struct SlackWebhookNotifier {
    http: Arc<dyn HttpTransport>,
    webhook_url: String,
    display_names: SourceDisplayNames,
    timeout: Duration,
}

impl SlackWebhookNotifier {
    pub fn new(http: Arc<dyn HttpTransport>, webhook_url: impl Into<String>) -> Self {
        Self {
            http,
            webhook_url: webhook_url.into(),
            display_names: SourceDisplayNames::default(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_display_names(mut self, display_names: SourceDisplayNames) -> Self {
        self.display_names = display_names;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    async fn post(&self, opportunity: &Opportunity, match_reason: &str) -> Result<(), NotifyError> {
        let display = self.display_names.get(&opportunity.source_id);
        let payload = build_payload(opportunity, match_reason, display);
        let resp = self
            .http
            .post_json(&self.webhook_url, &[], &payload, self.timeout)
            .await?;

        let status = resp.status.as_u16();
        if status >= 400 {
            return Err(NotifyError::Rejected {
                status,
                body: resp.text(),
            });
        }
        debug!(external_id = %opportunity.external_id, status, "posted to slack");
        Ok(())
    }
}

struct SlackMessage {
    text: String,
    title_link: String,
    metadata: Vec<String>,
    why: String,
    summary: String,
    context: String,
}

impl SlackMessage {
    fn new(opportunity: &Opportunity, match_reason: &str, display_name: &str) -> Self {
        let closes = format_optional(opportunity.closing_date);
        let text = format!(
            "{} ({}) | Closes: {} | Source: {}",
            opportunity.title, opportunity.url, closes, display_name
        );

        let title_link = if opportunity.url.is_empty() {
            format!("*{}*", opportunity.title)
        } else {
            format!("*<{}|{}>*", opportunity.url, opportunity.title)
        };

        let metadata = vec![
            format!("*Source:* {display_name}"),
            format!("*Funder:* {}", text_or_default(opportunity.funder.as_deref())),
            format!("*Funding Type:* {}", text_or_default(opportunity.funding_type.as_deref())),
            format!("*Total Fund:* {}", text_or_default(opportunity.total_fund.as_deref())),
            format!("*Opens:* {}", format_optional(opportunity.opening_date)),
            format!("*Closes:* {closes}"),
            format!("*Published:* {}", format_optional(opportunity.published_at)),
        ];

        let summary = if opportunity.summary.is_empty() {
            "(no summary provided)".to_string()
        } else {
            truncate_summary(&opportunity.summary)
        };

        Self {
            text,
            title_link,
            metadata,
            why: format!("*Why it matched:* {match_reason}"),
            summary,
            context: format!("{} · {}", opportunity.source_id, opportunity.external_id),
        }
    }
}

fn section(text: &str) -> JsonValue {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": text } })
}

/// Webhook JSON body for one opportunity.
pub fn build_payload(opportunity: &Opportunity, match_reason: &str, display_name: &str) -> JsonValue {
    let message = SlackMessage::new(opportunity, match_reason, display_name);
    json!({
        "text": message.text,
        "blocks": [
            section(&message.title_link),
            section(&message.metadata.join("\n")),
            section(&message.why),
            section(&message.summary),
            {
                "type": "context",
                "elements": [{ "type": "mrkdwn", "text": message.context }]
            }
        ]
    })
}

/// Plain-text rendering of the message body, used for dry-run previews.
pub fn render_message_text(opportunity: &Opportunity, match_reason: &str, display_name: &str) -> String {
    let message = SlackMessage::new(opportunity, match_reason, display_name);
    let mut lines = Vec::with_capacity(message.metadata.len() + 4);
    lines.push(message.text);
    lines.push(message.title_link);
    lines.extend(message.metadata);
    lines.push(message.why);
    lines.push(message.summary);
    lines.join("\n")
}

/// Midnight UTC values are treated as date-only.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    if is_midnight(value) {
        value.format("%Y-%m-%d").to_string()
    } else {
        value.format("%Y-%m-%d %H:%M UTC").to_string()
    }
}

fn format_optional(value: Option<DateTime<Utc>>) -> String {
    value
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| NOT_SPECIFIED.to_string())
}

fn text_or_default(value: Option<&str>) -> &str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(NOT_SPECIFIED)
}

fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_LIMIT {
        return summary.to_string();
    }
    let head: String = summary.chars().take(SUMMARY_LIMIT - 3).collect();
    format!("{head}...")
}
