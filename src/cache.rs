//! Fingerprinted response cache with time-based expiry.
//!
//! Maps a deterministic fingerprint of (normalized query, source mode,
//! source identifiers) to a previously computed [`CacheRecord`]. Expiry is
//! TTL-at-read: stale entries are popped lazily on lookup, never swept in
//! the background. An optional capacity bound evicts least-recently-used
//! entries on insert.
//!
//! Concurrent `get`/`put` are safe; a racing miss-compute-store pair
//! resolves last-writer-wins, which is all the answer path needs since
//! generation is idempotent for identical context.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::models::{CacheRecord, SourceMode};

struct Slot {
    record: CacheRecord,
    stored_at: Instant,
}

/// TTL + LRU cache over answer payloads.
pub struct ResponseCache {
    ttl: Duration,
    inner: Mutex<LruCache<String, Slot>>,
}

impl ResponseCache {
    /// Create a cache with the given TTL and capacity. `capacity = 0`
    /// means unbounded.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let inner = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            ttl,
            inner: Mutex::new(inner),
        }
    }

    /// Look up a fingerprint. Expired entries are treated as absent and
    /// evicted on the spot. A TTL of zero makes every entry stale.
    pub fn get(&self, fingerprint: &str) -> Option<CacheRecord> {
        let mut cache = self.inner.lock();

        let expired = match cache.get(fingerprint) {
            Some(slot) => {
                if slot.stored_at.elapsed() < self.ttl {
                    return Some(slot.record.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            cache.pop(fingerprint);
        }
        None
    }

    /// Store or overwrite a record, evicting the least-recently-used entry
    /// if the capacity bound is exceeded.
    pub fn put(&self, fingerprint: &str, record: CacheRecord) {
        let mut cache = self.inner.lock();
        cache.put(
            fingerprint.to_string(),
            Slot {
                record,
                stored_at: Instant::now(),
            },
        );
    }

    /// Number of stored entries, including not-yet-evicted stale ones.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Compute the cache fingerprint for a question against a source scope.
///
/// Pure function of (normalized query text, mode tag, sorted source ids):
/// repeated identical questions against the same sources always collide,
/// questions differing in any component never do. Source ids are the
/// document ids consulted, the schema name, or the literal `"web"`.
pub fn fingerprint(query: &str, mode: SourceMode, source_ids: &[String]) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut sorted: Vec<&str> = source_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(mode.tag().as_bytes());
    for id in sorted {
        hasher.update([0x1f]);
        hasher.update(id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(answer: &str) -> CacheRecord {
        CacheRecord {
            answer: answer.to_string(),
            citations: vec![],
            sql: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let cache = ResponseCache::new(Duration::from_secs(60), 0);
        cache.put("fp1", record("hello"));
        let got = cache.get("fp1").unwrap();
        assert_eq!(got.answer, "hello");
    }

    #[test]
    fn test_zero_ttl_always_misses() {
        let cache = ResponseCache::new(Duration::ZERO, 0);
        cache.put("fp1", record("hello"));
        assert!(cache.get("fp1").is_none());
    }

    #[test]
    fn test_expired_entry_is_absent_and_evicted() {
        let cache = ResponseCache::new(Duration::from_millis(20), 0);
        cache.put("fp1", record("hello"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("fp1").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_overwrite_wins() {
        let cache = ResponseCache::new(Duration::from_secs(60), 0);
        cache.put("fp1", record("first"));
        cache.put("fp1", record("second"));
        assert_eq!(cache.get("fp1").unwrap().answer, "second");
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.put("a", record("a"));
        cache.put("b", record("b"));
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("a").is_some());
        cache.put("c", record("c"));

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let ids = vec!["d1".to_string(), "d2".to_string()];
        let a = fingerprint("What is X?", SourceMode::Document, &ids);
        let b = fingerprint("What is X?", SourceMode::Document, &ids);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace_and_case() {
        let ids = vec!["d1".to_string()];
        let a = fingerprint("What   is\tX?", SourceMode::Document, &ids);
        let b = fingerprint("what is x?", SourceMode::Document, &ids);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinct_across_modes() {
        let ids = vec!["sales".to_string()];
        let doc = fingerprint("total revenue", SourceMode::Document, &ids);
        let tab = fingerprint("total revenue", SourceMode::Tabular, &ids);
        assert_ne!(doc, tab);
    }

    #[test]
    fn test_fingerprint_distinct_across_schemas() {
        let q = "sum of amounts by region";
        let a = fingerprint(q, SourceMode::Tabular, &["sales_2023".to_string()]);
        let b = fingerprint(q, SourceMode::Tabular, &["sales_2024".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_order_insensitive_for_sources() {
        let q = "anything";
        let a = fingerprint(
            q,
            SourceMode::Document,
            &["d1".to_string(), "d2".to_string()],
        );
        let b = fingerprint(
            q,
            SourceMode::Document,
            &["d2".to_string(), "d1".to_string()],
        );
        assert_eq!(a, b);
    }
}
