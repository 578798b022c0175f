//! Deterministic cache keys.
//!
//! Keys are derived from normalized input so that questions differing only in
//! case or spacing share one entry. Parts are hashed with SHA-256 under a
//! namespace (`answer:`, `retrieval:`, `embedding:`) so the different payload
//! classes never collide.

use sha2::{Digest, Sha256};

/// Lower-case and collapse all whitespace runs to single spaces.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `"{namespace}:{sha256(parts)}"`. Parts are separated by a unit separator
/// so `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{namespace}:{:x}", hasher.finalize())
}
