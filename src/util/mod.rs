//! Shared helpers for key routing, glob matching, and UTC day arithmetic.
//!
//! Everything quota-shaped in this crate (credentials, cache shards) resets at
//! UTC midnight, so the day math lives here in one place.

mod glob;
mod time;

pub use glob::glob_match;
pub use time::{next_utc_midnight, utc_day};

use sha2::{Digest, Sha256};

/// Stable article identifier derived from the canonical URL.
///
/// Publishers disagree on identifier formats (some expose opaque URIs, some
/// nothing at all), so the URL — the deduplication key — is hashed into a
/// short stable id used for cache keys and job ids.
pub fn article_id_from_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// Stable hash of a cache key, used for shard routing.
///
/// A full SHA-256 is more than routing needs, but it is already in the
/// dependency tree and guarantees identical placement across processes
/// and restarts.
pub fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
