//! Markup-to-text helpers shared by the adapters.

use chrono::{DateTime, Utc};
use fundwatch_core::parse_datetime_utc;
use scraper::{ElementRef, Html, Node};

const BLOCK_TAGS: &[&str] = &[
    "br", "p", "li", "div", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "table",
];
const SKIPPED_TAGS: &[&str] = &["script", "style"];

pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Flatten an HTML fragment into plain text lines.
///
/// Block-level tags start a new line, other tags become a space, entities are
/// decoded and blank lines are dropped.
pub fn html_to_text(value: &str) -> String {
    if value.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(value);
    let mut out = String::new();
    collect_text(fragment.root_element(), &mut out);

    out.lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                let separator = if BLOCK_TAGS.contains(&name) { '\n' } else { ' ' };
                out.push(separator);
                if let Some(child_element) = ElementRef::wrap(child) {
                    collect_text(child_element, out);
                }
                out.push(separator);
            }
            _ => {}
        }
    }
}

/// Decode entities in a single-line value such as a title.
pub fn unescape_text(value: &str) -> String {
    normalize_whitespace(&html_to_text(value))
}

/// Structured fields found in "Label: value" lines of a summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelledFields {
    pub opening_date: Option<DateTime<Utc>>,
    pub closing_date: Option<DateTime<Utc>>,
    pub funder: Option<String>,
    pub funding_type: Option<String>,
    pub total_fund: Option<String>,
}

/// Scan plain-text lines for the labels funders commonly publish.
///
/// Labels match case-insensitively as line prefixes; a later line with the
/// same label replaces an earlier one, except that a blank funder never
/// clears a known one.
pub fn extract_labelled_fields(summary: &str) -> LabelledFields {
    let mut fields = LabelledFields::default();

    for line in summary.lines() {
        let line = normalize_whitespace(line);
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        let value = line
            .split_once(':')
            .map(|(_, v)| v.trim().to_string())
            .unwrap_or_default();
        let non_empty = || Some(value.clone()).filter(|v| !v.is_empty());

        if lowered.starts_with("opening date") {
            fields.opening_date = parse_datetime_utc(&value);
        } else if lowered.starts_with("closing date") {
            fields.closing_date = parse_datetime_utc(&value);
        } else if lowered.starts_with("funder") || lowered.starts_with("council") {
            if let Some(funder) = non_empty() {
                fields.funder = Some(funder);
            }
        } else if lowered.starts_with("funding type") {
            fields.funding_type = non_empty();
        } else if lowered.starts_with("total fund") {
            fields.total_fund = non_empty();
        }
    }

    fields
}
