use crate::url::canonicalize_url;
use sha2::{Digest, Sha256};

/// Computes the fingerprint of a URL
///
/// The fingerprint is the lowercase hex SHA-256 digest of the URL's canonical
/// form. URLs that cannot be canonicalized are hashed verbatim, so every input
/// still gets a stable identifier.
///
/// # Examples
///
/// ```
/// use sumi_frontier::request::fingerprint;
///
/// let a = fingerprint("https://Example.com/page?b=2&a=1#frag");
/// let b = fingerprint("https://example.com/page?a=1&b=2");
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn fingerprint(url: &str) -> String {
    let mut hasher = Sha256::new();
    match canonicalize_url(url) {
        Ok(canonical) => hasher.update(canonical.as_str().as_bytes()),
        Err(_) => hasher.update(url.as_bytes()),
    }
    hex::encode(hasher.finalize())
}
