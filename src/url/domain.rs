use url::Url;

/// Extracts the lowercase host from a parsed URL
///
/// Returns `None` for URLs without a host (e.g. `mailto:` or `data:` URLs).
///
/// # Examples
///
/// ```
/// use url::Url;
/// use sumi_frontier::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM:8080/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_lowercase())
}

/// Parses a raw URL string and returns its lowercase hostname
///
/// This is the key used for host-locality partitioning and for the queue's
/// host bucket. Anything that does not parse, or parses without a host, yields
/// `None` so the caller can decide how to degrade.
pub fn hostname_of(url_str: &str) -> Option<String> {
    Url::parse(url_str.trim())
        .ok()
        .and_then(|url| extract_domain(&url))
}
