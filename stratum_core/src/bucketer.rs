//! Bucketer implementation.
use xxhash_rust::xxh3::xxh3_64;

/// Number of traffic slots a layer's key space is divided into (0.01% granularity).
pub const TOTAL_BUCKETS: u32 = 10_000;

pub trait Bucketer {
    /// Map an identifying key and a layer salt to a bucket in `[0, TOTAL_BUCKETS)`.
    ///
    /// Must be pure: identical `(key, salt)` inputs produce identical outputs, including across
    /// processes and restarts.
    fn bucket(&self, key: &str, salt: &str) -> u32;
}

/// The default (and only) bucketer: XXH3-64 over the concatenation `key ‖ salt`.
///
/// The salt decorrelates layers, so the same key lands in independent buckets per layer.
pub struct Xxh3Bucketer;

impl Bucketer for Xxh3Bucketer {
    fn bucket(&self, key: &str, salt: &str) -> u32 {
        let mut input = Vec::with_capacity(key.len() + salt.len());
        input.extend_from_slice(key.as_bytes());
        input.extend_from_slice(salt.as_bytes());
        (xxh3_64(&input) % TOTAL_BUCKETS as u64) as u32
    }
}
