//! Short-lived memoization of lookup results
//!
//! Entries expire lazily: an expired entry is dropped the next time its key
//! is read. Keys that are never read again are swept out on every
//! [`DEFAULT_SWEEP_EVERY`]th insert, so the map stays bounded by the number
//! of live keys.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Inserts between two sweeps of expired entries
pub const DEFAULT_SWEEP_EVERY: u64 = 1024;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Hit and miss counters since the cache was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Concurrent TTL cache keyed by query subject
///
/// Keys are independent; writers to the same key race and the last write
/// wins.
pub struct ResultCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    sweep_every: u64,
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }

    /// Sweep expired entries every `inserts` inserts instead of the default
    pub fn with_sweep_every(mut self, inserts: u64) -> Self {
        self.sweep_every = inserts.max(1);
        self
    }

    /// Cached value for `key`, unless it is missing or expired
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        // the read guard is gone here, removing cannot deadlock
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .insert(key.into(), CacheEntry { value, expires_at });

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_every == 0 {
            self.purge_expired();
        }
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Number of stored entries, expired ones included until read or swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set() {
        let cache: ResultCache<String> = ResultCache::new();
        assert!(cache.get("1.1.1.1").is_none());

        cache.set("1.1.1.1", "cloudflare".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("1.1.1.1").as_deref(), Some("cloudflare"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_removed() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.set("AS13335", 13335, Duration::from_millis(30));
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("AS13335").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unread_expired_entries_are_swept() {
        let cache: ResultCache<u32> = ResultCache::new().with_sweep_every(4);
        for ip in ["192.0.2.1", "192.0.2.2", "192.0.2.3"] {
            cache.set(ip, 1, Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.len(), 3);

        // the fourth insert triggers a sweep without any reads
        cache.set("192.0.2.4", 2, Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("192.0.2.4"), Some(2));
    }

    #[test]
    fn test_purge_expired() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.set("old", 1, Duration::ZERO);
        cache.set("live", 2, Duration::from_secs(60));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_last_write_wins() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.set("key", 1, Duration::from_secs(60));
        cache.set("key", 2, Duration::from_secs(60));
        assert_eq!(cache.get("key"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.set("key", 1, Duration::ZERO);
        assert!(cache.get("key").is_none());
    }

    #[test]
    fn test_clear() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.set("a", 1, Duration::from_secs(60));
        cache.set("b", 2, Duration::from_secs(60));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = std::sync::Arc::new(ResultCache::<usize>::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.set(format!("{}-{}", i, j), j, Duration::from_secs(60));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
        assert_eq!(cache.get("7-99"), Some(99));
    }
}
