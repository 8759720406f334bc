//! Content fingerprinting for fetched engine config text.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `text`. Empty text yields an empty digest.
pub fn fingerprint(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// True iff both digests are present and differ.
///
/// An empty digest means "no data", so it never counts as a change.
pub fn has_changed(new_digest: &str, cached_digest: &str) -> bool {
    !new_digest.is_empty() && !cached_digest.is_empty() && new_digest != cached_digest
}
