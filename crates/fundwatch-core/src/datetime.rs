//! Tolerant timestamp parsing for third-party listings.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d %B %Y %H:%M:%S",
    "%d %B %Y %H:%M",
    "%d %B %Y %I:%M%p",
    "%B %d %Y %H:%M",
    "%B %d %Y %I:%M%p",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d %B %Y", "%B %d %Y", "%d/%m/%Y", "%Y/%m/%d"];

const WEEKDAYS: &[&str] = &[
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday", "mon", "tue",
    "tues", "wed", "thu", "thur", "thurs", "fri", "sat", "sun",
];

const NOISE_WORDS: &[&str] = &["at", "on", "uk", "time", "gmt", "bst", "utc", "z"];

/// Parse a timestamp in any of the shapes funding sites publish.
///
/// Values without an offset are taken as UTC.
pub fn parse_datetime_utc(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    let cleaned = clean_human_date(value);
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, format) {
            return Some(date.and_time(NaiveTime::MIN).and_utc());
        }
    }
    None
}

/// True when a timestamp carries no time-of-day information worth showing.
pub fn is_midnight(value: &DateTime<Utc>) -> bool {
    value.hour() == 0 && value.minute() == 0 && value.second() == 0
}

fn clean_human_date(value: &str) -> String {
    value
        .replace(',', " ")
        .split_whitespace()
        .filter(|token| {
            let lowered = token.to_ascii_lowercase();
            !WEEKDAYS.contains(&lowered.as_str()) && !NOISE_WORDS.contains(&lowered.as_str())
        })
        .map(strip_ordinal_suffix)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_ordinal_suffix(token: &str) -> String {
    let lowered = token.to_ascii_lowercase();
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(digits) = lowered.strip_suffix(suffix) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return digits.to_string();
            }
        }
    }
    token.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn parses_feed_timestamps() {
        assert_eq!(
            parse_datetime_utc("Tue, 06 Jan 2026 10:00:00 +0000"),
            Some(utc(2026, 1, 6, 10, 0))
        );
        assert_eq!(
            parse_datetime_utc("2026-01-06T11:00:00+01:00"),
            Some(utc(2026, 1, 6, 10, 0))
        );
        assert_eq!(parse_datetime_utc("2026-03-30T17:00:00"), Some(utc(2026, 3, 30, 17, 0)));
    }

    #[test]
    fn parses_human_dates() {
        assert_eq!(parse_datetime_utc("30 March 2026"), Some(utc(2026, 3, 30, 0, 0)));
        assert_eq!(parse_datetime_utc("March 30, 2026"), Some(utc(2026, 3, 30, 0, 0)));
        assert_eq!(parse_datetime_utc("2026-03-30"), Some(utc(2026, 3, 30, 0, 0)));
        assert_eq!(parse_datetime_utc("30/03/2026"), Some(utc(2026, 3, 30, 0, 0)));
        assert_eq!(
            parse_datetime_utc("Wednesday 5th November 2025 11:00am"),
            Some(utc(2025, 11, 5, 11, 0))
        );
        assert_eq!(
            parse_datetime_utc("Monday 1 September 2025 4:00pm UK time"),
            Some(utc(2025, 9, 1, 16, 0))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_datetime_utc(""), None);
        assert_eq!(parse_datetime_utc("   "), None);
        assert_eq!(parse_datetime_utc("rolling deadline"), None);
    }

    #[test]
    fn midnight_detection() {
        assert!(is_midnight(&utc(2026, 3, 30, 0, 0)));
        assert!(!is_midnight(&utc(2026, 3, 30, 17, 0)));
    }
}
