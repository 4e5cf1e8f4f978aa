//! Competition listing pages scraped card by card, with fuzzy removal of
//! competitions another feed already announces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fundwatch_core::{canonicalize_url, derive_external_id, parse_datetime_utc, raw_snapshot, Opportunity, SourceSettings};
use fundwatch_storage::HttpTransport;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::feed::parse_feed;
use crate::text::{html_to_text, normalize_whitespace, unescape_text};
use crate::{absolutize, f64_option, invalid_option, sort_by_closing_date, timeout_option, AdapterError, SourceAdapter};

pub const SOURCE_TYPE: &str = "competition_cards";

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.92;
const DEFAULT_FUNDER: &str = "Innovate UK";

const DEFAULT_CARD_PATTERN: &str = r#"(?s)<h2[^>]*>\s*<a[^>]+href="(?P<href>[^"]+)"[^>]*>(?P<title>.*?)</a>\s*</h2>(?P<body>.*?)<dl[^>]*>(?P<dates>.*?)</dl>"#;
const DATE_PAIR_PATTERN: &str = r"(?s)<dt[^>]*>(?P<label>.*?)</dt>\s*<dd[^>]*>(?P<value>.*?)</dd>";

const NUMBER_WORDS: [&str; 21] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen", "twenty",
];

/// One card as it appeared on the listing page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetitionCard {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub opens: Option<String>,
    pub closes: Option<String>,
}

pub struct CompetitionCardsAdapter {
    settings: SourceSettings,
    http: Arc<dyn HttpTransport>,
    timeout: Duration,
    card_pattern: Regex,
    date_pattern: Regex,
    canonical_titles_feed: Option<String>,
    similarity_threshold: f64,
    funder: String,
}

impl CompetitionCardsAdapter {
    pub fn new(settings: &SourceSettings, http: Arc<dyn HttpTransport>) -> Result<Self, AdapterError> {
        let card_pattern = Regex::new(settings.option_str("card_pattern").unwrap_or(DEFAULT_CARD_PATTERN))
            .map_err(|err| invalid_option(settings, "card_pattern", err.to_string()))?;
        for group in ["href", "title", "body", "dates"] {
            if !card_pattern.capture_names().flatten().any(|name| name == group) {
                return Err(invalid_option(settings, "card_pattern", format!("missing capture group `{group}`")));
            }
        }
        let date_pattern = Regex::new(DATE_PAIR_PATTERN).map_err(|err| AdapterError::Message(err.to_string()))?;

        let similarity_threshold = f64_option(settings, "similarity_threshold")?.unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(invalid_option(settings, "similarity_threshold", "must be between 0 and 1"));
        }

        Ok(Self {
            timeout: timeout_option(settings)?,
            card_pattern,
            date_pattern,
            canonical_titles_feed: settings.option_str("canonical_titles_feed").map(ToString::to_string),
            similarity_threshold,
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

    pub fn parse_cards(&self, page_url: &str, html: &str) -> Vec<CompetitionCard> {
        self.card_pattern
            .captures_iter(html)
            .map(|caps| {
                let group = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or_default();
                let mut card = CompetitionCard {
                    title: unescape_text(group("title")),
                    link: absolutize(page_url, &unescape_text(group("href"))),
                    summary: html_to_text(group("body")),
                    opens: None,
                    closes: None,
                };
                for pair in self.date_pattern.captures_iter(group("dates")) {
                    let label = unescape_text(&pair["label"]).to_lowercase();
                    let value = Some(unescape_text(&pair["value"])).filter(|v| !v.is_empty());
                    match label.trim_end_matches(':') {
                        "opened" | "opens" | "opening" => card.opens = value,
                        "closes" | "closed" | "closing" => card.closes = value,
                        _ => {}
                    }
                }
                card
            })
            .filter(|card| !card.title.is_empty())
            .collect()
    }

    /// Drop cards whose titles duplicate a canonical title, then normalize
    /// the rest in closing-date order.
    pub fn select_unique(&self, cards: Vec<CompetitionCard>, canonical_titles: &[String]) -> Vec<Opportunity> {
        let mut items: Vec<Opportunity> = cards
            .into_iter()
            .filter(|card| {
                let normalized = normalize_title(&card.title);
                let duplicate = canonical_titles.iter().any(|canonical| {
                    *canonical == normalized || similarity_ratio(canonical, &normalized) >= self.similarity_threshold
                });
                if duplicate {
                    debug!(source_id = %self.settings.id, title = %card.title, "dropping card already listed in canonical feed");
                }
                !duplicate
            })
            .map(|card| self.card_to_opportunity(card))
            .collect();
        sort_by_closing_date(&mut items);
        items
    }

    fn card_to_opportunity(&self, card: CompetitionCard) -> Opportunity {
        let url = canonicalize_url(&card.link);
        let external_id = if url.is_empty() {
            derive_external_id(None, &format!("{}:{}", self.settings.id, card.title))
        } else {
            derive_external_id(Some(&url), &url)
        };

        Opportunity {
            source_id: self.settings.id.clone(),
            external_id,
            title: normalize_whitespace(&card.title),
            url,
            published_at: None,
            summary: card.summary.clone(),
            closing_date: card.closes.as_deref().and_then(parse_datetime_utc),
            opening_date: card.opens.as_deref().and_then(parse_datetime_utc),
            funder: Some(self.funder.clone()),
            funding_type: None,
            total_fund: None,
            raw: raw_snapshot(&card),
        }
    }

    async fn fetch_feed(&self, feed_url: &str) -> Result<Vec<Opportunity>, AdapterError> {
        let response = self.http.get(feed_url, self.timeout).await?.error_for_status()?;
        parse_feed(&self.settings.id, &response.body)
    }

    async fn canonical_titles(&self) -> Vec<String> {
        let Some(feed_url) = &self.canonical_titles_feed else {
            return Vec::new();
        };
        match self.fetch_feed(feed_url).await {
            Ok(items) => items.iter().map(|item| normalize_title(&item.title)).collect(),
            Err(err) => {
                warn!(source_id = %self.settings.id, feed_url, error = %err, "cross-reference feed unavailable; keeping every card");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for CompetitionCardsAdapter {
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
        let cards = self.parse_cards(&response.final_url, &response.text());
        let canonical = self.canonical_titles().await;
        debug!(source_id = %self.settings.id, cards = cards.len(), canonical = canonical.len(), "parsed competition cards");
        Ok(self.select_unique(cards, &canonical))
    }
}

/// Comparable form of a competition title.
pub fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();

    stripped
        .split_whitespace()
        .map(|token| {
            if token == "eoi" {
                return "expression of interest";
            }
            match token.parse::<usize>() {
                Ok(n) if n < NUMBER_WORDS.len() => NUMBER_WORDS[n],
                _ => token,
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ratcliff/Obershelp similarity: twice the matched characters over the
/// combined length, matching blocks found by recursive longest common run.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, size) = longest_common_run(a, b);
    if size == 0 {
        return 0;
    }
    size + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + size..], &b[j + size..])
}

/// Earliest longest common run as (start in a, start in b, length).
fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let run = previous[j] + 1;
                current[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        previous = current;
    }
    best
}
