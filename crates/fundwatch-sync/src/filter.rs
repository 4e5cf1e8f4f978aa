//! Rule-based matching of opportunities against configured interests.

use chrono::{DateTime, Utc};
use fundwatch_core::Opportunity;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSettings {
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub include_councils: Vec<String>,
    pub include_funding_types: Vec<String>,
    pub min_days_until_deadline: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterResult {
    pub matched: bool,
    pub reasons: Vec<String>,
}

impl FilterResult {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            matched: false,
            reasons: vec![reason.into()],
        }
    }

    pub fn reason_text(&self) -> String {
        if self.reasons.is_empty() {
            "no specific reason".to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

pub trait OpportunityFilter: Send + Sync {
    fn evaluate(&self, opportunity: &Opportunity) -> FilterResult;
}

#[derive(Debug, Clone)]
struct KeywordPattern {
    keyword: String,
    regex: Regex,
}

#[derive(Debug, Clone)]
pub struct RuleBasedFilter {
    settings: FilterSettings,
    include: Vec<KeywordPattern>,
    exclude: Vec<KeywordPattern>,
}

impl RuleBasedFilter {
    pub fn new(settings: FilterSettings) -> Result<Self, regex::Error> {
        let include = compile_keywords(&settings.include_keywords)?;
        let exclude = compile_keywords(&settings.exclude_keywords)?;
        Ok(Self {
            settings,
            include,
            exclude,
        })
    }

    /// Evaluate with an explicit clock.
    pub fn evaluate_at(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> FilterResult {
        let mut reasons = Vec::new();
        let searchable = format!("{}\n{}", opportunity.title, opportunity.summary);

        let include_hits = hits(&self.include, &searchable);
        if !self.settings.include_keywords.is_empty() && include_hits.is_empty() {
            return FilterResult::rejected("no include keywords matched");
        }
        if !include_hits.is_empty() {
            reasons.push(format!("keywords: {}", include_hits.join(", ")));
        }

        let exclude_hits = hits(&self.exclude, &searchable);
        if !exclude_hits.is_empty() {
            return FilterResult::rejected(format!("excluded by keyword: {}", exclude_hits.join(", ")));
        }

        if !self.settings.include_councils.is_empty() {
            if !contains_any(opportunity.funder.as_deref(), &self.settings.include_councils) {
                return FilterResult::rejected("funder/council filter not matched");
            }
            reasons.push(format!("council/funder: {}", opportunity.funder.as_deref().unwrap_or_default()));
        }

        if !self.settings.include_funding_types.is_empty() {
            if !contains_any(opportunity.funding_type.as_deref(), &self.settings.include_funding_types) {
                return FilterResult::rejected("funding_type filter not matched");
            }
            reasons.push(format!(
                "funding type: {}",
                opportunity.funding_type.as_deref().unwrap_or_default()
            ));
        }

        if let Some(min_days) = self.settings.min_days_until_deadline {
            let Some(closing) = opportunity.closing_date else {
                return FilterResult::rejected("missing closing date required by deadline filter");
            };
            let days = (closing - now).num_milliseconds().div_euclid(86_400_000);
            if days < min_days {
                return FilterResult::rejected(format!("deadline too soon ({days}d < {min_days}d)"));
            }
            reasons.push(format!("deadline in {days} days"));
        }

        if reasons.is_empty() {
            reasons.push("matched default pass-through rules".to_string());
        }
        FilterResult {
            matched: true,
            reasons,
        }
    }
}

impl OpportunityFilter for RuleBasedFilter {
    fn evaluate(&self, opportunity: &Opportunity) -> FilterResult {
        self.evaluate_at(opportunity, Utc::now())
    }
}

fn compile_keywords(keywords: &[String]) -> Result<Vec<KeywordPattern>, regex::Error> {
    keywords
        .iter()
        .filter_map(|keyword| {
            let parts: Vec<String> = keyword.split_whitespace().map(regex::escape).collect();
            if parts.is_empty() {
                return None;
            }
            let pattern = format!(r"(?:^|[^A-Za-z0-9]){}(?:$|[^A-Za-z0-9])", parts.join(r"\s+"));
            Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| KeywordPattern {
                        keyword: keyword.clone(),
                        regex,
                    }),
            )
        })
        .collect()
}

fn hits<'a>(patterns: &'a [KeywordPattern], text: &str) -> Vec<&'a str> {
    patterns
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| p.keyword.as_str())
        .collect()
}

fn contains_any(value: Option<&str>, needles: &[String]) -> bool {
    let haystack = value.unwrap_or_default().to_lowercase();
    needles.iter().any(|needle| haystack.contains(&needle.to_lowercase()))
}
