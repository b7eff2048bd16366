/// URL normalization.
///
/// Every URL entering the system is reduced to a canonical comparison form.
/// The canonical string is what the queue, the duplicate set and every mirror
/// map are keyed by; the pieces that normalization strips but that still
/// matter for fetching or rewriting (original scheme, fragment) are carried
/// alongside in [`LossyData`].
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum InvalidUrl {
    #[error("unparseable url: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("url has no host")]
    MissingHost,
}

/// Data removed by [`normalize`] that round-trips next to the canonical URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossyData {
    pub protocol: String,
    pub fragment: Option<String>,
}

/// Normalize `raw` into `(canonical, lossy)`.
///
/// Canonicalization: lower-cased scheme and host, default port removed,
/// empty path becomes `/`, an empty query is dropped, the fragment is
/// stripped into `lossy`, and `https` is folded to `http` so the two
/// protocols share one identity (the real scheme is kept in
/// `lossy.protocol` and restored by [`request_url`]).
///
/// Idempotent: normalizing a canonical URL yields the same string.
pub fn normalize(raw: &str) -> Result<(String, LossyData), InvalidUrl> {
    let mut parsed = Url::parse(raw.trim())?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(InvalidUrl::UnsupportedScheme(other.to_string())),
    }
    if parsed.host_str().is_none() {
        return Err(InvalidUrl::MissingHost);
    }

    let lossy = LossyData {
        protocol: parsed.scheme().to_string(),
        fragment: parsed.fragment().map(str::to_string),
    };
    parsed.set_fragment(None);
    if parsed.query() == Some("") {
        parsed.set_query(None);
    }
    if parsed.scheme() == "https" {
        // Both schemes are "special" in the url crate, so this cannot fail.
        let _ = parsed.set_scheme("http");
        if parsed.port() == Some(80) {
            let _ = parsed.set_port(None);
        }
    }

    Ok((parsed.to_string(), lossy))
}

/// The URL to actually fetch: canonical form with the original scheme back.
pub fn request_url(canonical: &str, lossy: &LossyData) -> String {
    if lossy.protocol == "https" {
        canonical.replacen("http://", "https://", 1)
    } else {
        canonical.to_string()
    }
}

/// True when `value` looks like an absolute URL (has a scheme).
///
/// Used by the parsers to decide whether a raw attribute value may be passed
/// through byte-identically instead of being resolved against a base.
pub fn has_scheme(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    for c in chars {
        match c {
            ':' => return true,
            c if c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.') => {}
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: &str) -> String {
        normalize(raw).unwrap().0
    }

    #[test]
    fn test_basic_normalization() {
        assert_eq!(canon("http://example.org"), "http://example.org/");
        assert_eq!(canon("HTTP://Example.ORG/Path"), "http://example.org/Path");
        assert_eq!(canon("http://example.com:80/x"), "http://example.com/x");
        assert_eq!(canon("http://example.com:8080/x"), "http://example.com:8080/x");
    }

    #[test]
    fn test_https_folds_into_http() {
        assert_eq!(canon("https://example.org/a"), "http://example.org/a");
        let (_, lossy) = normalize("https://example.org/a").unwrap();
        assert_eq!(lossy.protocol, "https");
    }

    #[test]
    fn test_fragment_is_stripped_and_kept() {
        let (url, lossy) = normalize("http://example.org/page#section-2").unwrap();
        assert_eq!(url, "http://example.org/page");
        assert_eq!(lossy.fragment.as_deref(), Some("section-2"));
    }

    #[test]
    fn test_empty_query_dropped_nonempty_kept() {
        assert_eq!(canon("http://example.org/x?"), "http://example.org/x");
        assert_eq!(canon("http://example.org/x?a=1"), "http://example.org/x?a=1");
    }

    #[test]
    fn test_idempotent() {
        for raw in [
            "http://Example.COM:80/x",
            "https://example.org/a?b=c#d",
            "http://example.org",
        ] {
            let first = canon(raw);
            assert_eq!(canon(&first), first);
        }
    }

    #[test]
    fn test_equivalent_spellings_share_identity() {
        assert_eq!(canon("http://Example.COM:80/x"), canon("http://example.com/x"));
        assert_eq!(canon("https://example.com/x"), canon("http://example.com/x"));
    }

    #[test]
    fn test_invalid_urls() {
        assert!(matches!(
            normalize("mailto:someone@example.org"),
            Err(InvalidUrl::UnsupportedScheme(_))
        ));
        assert!(matches!(
            normalize("javascript:void(0)"),
            Err(InvalidUrl::UnsupportedScheme(_))
        ));
        assert!(normalize("not a url").is_err());
        assert!(normalize("/relative/path").is_err());
    }

    #[test]
    fn test_request_url_restores_scheme() {
        let (url, lossy) = normalize("https://example.org/a").unwrap();
        assert_eq!(request_url(&url, &lossy), "https://example.org/a");
        let (url, lossy) = normalize("http://example.org/a").unwrap();
        assert_eq!(request_url(&url, &lossy), "http://example.org/a");
    }

    #[test]
    fn test_has_scheme() {
        assert!(has_scheme("http://example.org"));
        assert!(has_scheme("mailto:x@y"));
        assert!(!has_scheme("/path/only"));
        assert!(!has_scheme("page.html"));
        assert!(!has_scheme("//example.org/x"));
    }
}
