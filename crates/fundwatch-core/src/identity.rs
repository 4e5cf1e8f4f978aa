//! URL canonicalization and stable external-id derivation.

use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_QUERY_PARAMS: &[&str] = &[
    "fbclid", "gclid", "igshid", "mc_cid", "mc_eid", "mkt_tok", "ref", "source",
];

fn is_tracking_param(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    lowered.starts_with("utm_") || TRACKING_QUERY_PARAMS.contains(&lowered.as_str())
}

/// Normalize a URL for identity and display.
///
/// Input that is not an absolute URL with a host is returned trimmed but
/// otherwise untouched.
pub fn canonicalize_url(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }

    let Ok(mut url) = Url::parse(value) else {
        return value.to_string();
    };
    if url.cannot_be_a_base() || url.host_str().map_or(true, str::is_empty) {
        return value.to_string();
    }

    let path = url.path().to_string();
    if path != "/" {
        let trimmed = path.trim_end_matches('/');
        url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.set_fragment(None);

    url.to_string()
}

pub fn stable_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable cross-run identity for an item.
///
/// A raw id that is itself an absolute URL is canonicalized (feeds often reuse
/// the link as guid); any other non-blank raw id is used verbatim. Without a
/// raw id the canonical URL (or other seed) is hashed.
pub fn derive_external_id(raw_id: Option<&str>, canonical_url: &str) -> String {
    if let Some(raw) = raw_id.map(str::trim).filter(|s| !s.is_empty()) {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return canonicalize_url(raw);
        }
        return raw.to_string();
    }
    format!("urlhash:{}", stable_hash(canonical_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_params_fragment_and_trailing_slash() {
        assert_eq!(
            canonicalize_url("HTTPS://WWW.UKRI.org/opportunity/example/?utm_source=rss&fbclid=x#apply"),
            "https://www.ukri.org/opportunity/example"
        );
    }

    #[test]
    fn sorts_remaining_query_params() {
        let a = canonicalize_url("https://example.org/search?b=2&a=1&ref=home");
        let b = canonicalize_url("https://example.org/search?a=1&b=2");
        assert_eq!(a, "https://example.org/search?a=1&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn preserves_root_path() {
        assert_eq!(canonicalize_url("https://Example.org"), "https://example.org/");
        assert_eq!(canonicalize_url("https://example.org/?utm_medium=email"), "https://example.org/");
    }

    #[test]
    fn drops_default_port() {
        assert_eq!(canonicalize_url("http://example.org:80/calls/"), "http://example.org/calls");
    }

    #[test]
    fn tracking_keys_match_case_insensitively() {
        assert_eq!(
            canonicalize_url("https://example.org/a?UTM_Campaign=x&Source=feed&id=7"),
            "https://example.org/a?id=7"
        );
    }

    #[test]
    fn leaves_relative_and_unparseable_input_alone() {
        assert_eq!(canonicalize_url("/opportunity/relative/"), "/opportunity/relative/");
        assert_eq!(canonicalize_url("  not a url  "), "not a url");
        assert_eq!(canonicalize_url("mailto:grants@example.org"), "mailto:grants@example.org");
        assert_eq!(canonicalize_url(""), "");
    }

    #[test]
    fn canonicalization_is_a_fixed_point() {
        let urls = [
            "https://www.ukri.org/opportunity/example-opportunity/?utm_source=rss",
            "https://example.org/search?q=digital+twin&b=2&a=1&gclid=abc",
            "https://example.org/a%20b/?x=%C3%A9&x=a",
            "http://Example.org:8080/path//?ref=x#frag",
            "https://example.org",
            "relative/path",
        ];
        for url in urls {
            let once = canonicalize_url(url);
            assert_eq!(canonicalize_url(&once), once, "not a fixed point for {url}");
        }
    }

    #[test]
    fn url_guid_is_canonicalized() {
        let id = derive_external_id(
            Some("https://www.ukri.org/opportunity/example-opportunity/?utm_source=rss"),
            "ignored",
        );
        assert_eq!(id, "https://www.ukri.org/opportunity/example-opportunity");
    }

    #[test]
    fn opaque_guid_is_used_trimmed() {
        assert_eq!(derive_external_id(Some("  tag:ukri,2026:123 "), "x"), "tag:ukri,2026:123");
    }

    #[test]
    fn missing_guid_falls_back_to_url_hash() {
        let first = canonicalize_url("https://www.ukri.org/opportunity/another/?utm_medium=rss&utm_campaign=test");
        let second = canonicalize_url("https://www.ukri.org/opportunity/another?mc_cid=99");
        let id_a = derive_external_id(None, &first);
        let id_b = derive_external_id(Some("   "), &second);
        assert!(id_a.starts_with("urlhash:"));
        assert_eq!(id_a, id_b);
        assert_eq!(id_a, format!("urlhash:{}", stable_hash("https://www.ukri.org/opportunity/another")));
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            stable_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
