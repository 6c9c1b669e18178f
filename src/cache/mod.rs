//! Validation cache: memoizes per-pattern validation verdicts keyed by
//! content fingerprint.
//!
//! Bounded size with least-recently-used eviction; every entry also
//! carries a TTL and is treated as a miss once expired, regardless of its
//! LRU position. Expiry is checked lazily on access, with an optional
//! background sweep calling `purge_expired`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;

/// A memoized sequence-validation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVerdict {
    pub ok: bool,
    pub adjusted_confidence: f64,
    pub reason: Option<String>,
}

struct CacheEntry {
    value: CachedVerdict,
    inserted_at: Instant,
    expires_at: Instant,
    /// Logical access clock tick; larger = more recently used
    last_access: u64,
}

/// Cache counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub inserts: u64,
}

/// Bounded LRU + TTL cache for validation verdicts.
///
/// Internally synchronized; shared freely across tasks behind an `Arc`.
/// A verdict is only ever returned for the exact fingerprint it was
/// stored under, so a stale entry can never describe different inputs.
pub struct ValidationCache {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
    default_ttl: Duration,
    /// Monotonic logical clock for LRU ordering
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    inserts: AtomicU64,
}

impl ValidationCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: config.capacity.max(1),
            default_ttl: Duration::from_secs(config.ttl_secs),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a verdict. An expired entry is removed and reported as a
    /// miss.
    pub fn get(&self, key: &str) -> Option<CachedVerdict> {
        let now = Instant::now();
        let tick = self.tick();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at <= now {
                drop(entry);
                self.entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_access = tick;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert with the configured default TTL.
    pub fn put(&self, key: impl Into<String>, value: CachedVerdict) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL, evicting the least-recently-used
    /// entry if the cache is over capacity afterwards.
    pub fn put_with_ttl(&self, key: impl Into<String>, value: CachedVerdict, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at: now + ttl,
            last_access: self.tick(),
        };
        self.entries.insert(key.into(), entry);
        self.inserts.fetch_add(1, Ordering::Relaxed);

        while self.entries.len() > self.capacity {
            if !self.evict_lru() {
                break;
            }
        }
    }

    /// Remove a specific fingerprint.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop the least-recently-used entry. Returns false when empty.
    fn evict_lru(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_access)
            .map(|e| e.key().clone());

        match victim {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "evicted LRU cache entry");
                true
            }
            None => false,
        }
    }

    /// Remove every expired entry. Called by the background sweep;
    /// lazy expiry on access does not depend on it.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let purged = stale.len();
        for key in stale {
            self.entries.remove(&key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        if purged > 0 {
            debug!(purged, "cache sweep removed expired entries");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the oldest entry, for diagnostics.
    pub fn oldest_entry_age(&self) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|e| now.duration_since(e.value().inserted_at))
            .max()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl_secs: u64) -> ValidationCache {
        ValidationCache::new(&CacheConfig {
            capacity,
            ttl_secs,
            sweep_interval_secs: 60,
        })
    }

    fn verdict(ok: bool) -> CachedVerdict {
        CachedVerdict {
            ok,
            adjusted_confidence: 0.8,
            reason: None,
        }
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let c = cache(8, 300);
        assert!(c.get("a").is_none());
        c.put("a", verdict(true));
        assert!(c.get("a").is_some());

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.inserts, 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let c = cache(3, 300);
        c.put("a", verdict(true));
        c.put("b", verdict(true));
        c.put("c", verdict(true));

        // Touch "a" so "b" becomes the least recently used
        assert!(c.get("a").is_some());

        c.put("d", verdict(true));
        assert_eq!(c.len(), 3);
        assert!(c.get("b").is_none(), "LRU entry should be evicted");
        assert!(c.get("a").is_some());
        assert!(c.get("c").is_some());
        assert!(c.get("d").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn test_insert_n_plus_one_evicts_exactly_one() {
        let c = cache(4, 300);
        for key in ["k1", "k2", "k3", "k4", "k5"] {
            c.put(key, verdict(true));
        }
        assert_eq!(c.len(), 4);
        assert_eq!(c.stats().evictions, 1);
        // The first inserted, never accessed key is the victim
        assert!(c.get("k1").is_none());
        assert!(c.get("k5").is_some());
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let c = cache(8, 300);
        c.put_with_ttl("a", verdict(true), Duration::from_millis(20));
        assert!(c.get("a").is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(c.get("a").is_none(), "expired entry must read as a miss");
        assert_eq!(c.stats().expirations, 1);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_expired_entry_ignores_lru_position() {
        let c = cache(8, 300);
        c.put_with_ttl("short", verdict(true), Duration::from_millis(20));
        c.put("long", verdict(true));

        // Keep "short" the most recently used right up to expiry
        assert!(c.get("short").is_some());
        std::thread::sleep(Duration::from_millis(30));

        assert!(c.get("short").is_none());
        assert!(c.get("long").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let c = cache(8, 300);
        c.put_with_ttl("a", verdict(true), Duration::from_millis(10));
        c.put_with_ttl("b", verdict(true), Duration::from_millis(10));
        c.put("c", verdict(false));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.purge_expired(), 2);
        assert_eq!(c.len(), 1);
        // Purged entries were never served, so no hit/miss skew
        assert!(c.get("c").is_some());
    }

    #[test]
    fn test_invalidate() {
        let c = cache(8, 300);
        c.put("a", verdict(true));
        c.invalidate("a");
        assert!(c.get("a").is_none());
    }

    #[test]
    fn test_overwrite_same_key_keeps_len() {
        let c = cache(8, 300);
        c.put("a", verdict(true));
        c.put("a", verdict(false));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("a").unwrap().ok, false);
    }
}
