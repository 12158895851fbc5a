use crate::UrlError;
use url::Url;

/// Produces the canonical form of a URL used for fingerprinting
///
/// # Canonicalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Lowercase the host (the `url` crate already does this for special schemes)
/// 3. Drop the port when it is the scheme default (done by the parser)
/// 4. Collapse empty and dot path segments, keeping a trailing slash
/// 5. Remove the fragment
/// 6. Sort query parameters by key (stable, so repeated keys keep their order)
/// 7. Remove an empty query string
///
/// Two URLs that differ only in the steps above map to the same fingerprint.
///
/// # Examples
///
/// ```
/// use sumi_frontier::url::canonicalize_url;
///
/// let url = canonicalize_url("HTTP://Example.COM:80/a/./b?z=1&a=2#top").unwrap();
/// assert_eq!(url.as_str(), "http://example.com/a/b?a=2&z=1");
/// ```
pub fn canonicalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    let host = url
        .host_str()
        .map(|h| h.to_lowercase())
        .ok_or(UrlError::MissingHost)?;
    url.set_host(Some(&host))
        .map_err(|e| UrlError::Malformed(format!("Failed to set host: {}", e)))?;

    let path = canonical_path(url.path());
    url.set_path(&path);

    url.set_fragment(None);

    if url.query().is_some() {
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

/// Removes empty and dot segments; a trailing slash is significant and kept
fn canonical_path(path: &str) -> String {
    let trailing = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut result = format!("/{}", segments.join("/"));
    if trailing {
        result.push('/');
    }
    result
}
