// TTL Cache - key -> (value, absolute expiry) with lazy expiry-on-read
// Entries past their expiry are treated as absent and evicted on the next read.

use dashmap::DashMap;
use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics;

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default, Debug)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired_evictions: AtomicU64,
}

/// Generic TTL cache.
///
/// Timestamps come from `tokio::time::Instant`, so a paused test clock drives expiry.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
    counters: CacheCounters,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, default_ttl: Duration) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            default_ttl,
            counters: CacheCounters::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the value if present and not expired. An expired entry is removed.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let lookup = self.entries.get(key).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.value.clone())
            }
        });

        match lookup {
            Some(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_hit(self.name);
                Some(value)
            }
            Some(None) => {
                // Guard is released above; re-check under remove_if in case of a concurrent refresh.
                if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
                    self.counters.expired_evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.record_miss();
                None
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_miss(self.name);
    }

    /// Inserts with the cache's default TTL, overwriting any existing entry.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Sweeps every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        self.counters
            .expired_evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        metrics::set_cache_size(self.name, self.entries.len() as f64);
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        metrics::set_cache_size(self.name, 0.0);
    }

    /// Raw entry count, including entries that have expired but were not read yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheMetricsSnapshot {
            name: self.name,
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            cache_size: self.entries.len(),
            expired_evictions: self.counters.expired_evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheMetricsSnapshot {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cache_size: usize,
    pub expired_evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_value_visible_before_expiry_and_evicted_after() {
        let cache: TtlCache<String, f64> = TtlCache::new("test", Duration::from_secs(30));
        cache.insert("sol".to_string(), 142.5);

        assert_eq!(cache.get("sol"), Some(142.5));
        assert_eq!(cache.len(), 1);

        advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("sol"), Some(142.5));

        advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("sol"), None);
        assert_eq!(cache.len(), 0, "expired entry should be removed on read");

        let m = cache.metrics();
        assert_eq!(m.hits, 2);
        assert_eq!(m.misses, 1);
        assert_eq!(m.expired_evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entry_ttl_and_sweep() {
        let cache: TtlCache<String, Option<f64>> = TtlCache::new("test", Duration::from_secs(30));
        cache.insert("hit".to_string(), Some(1.0));
        cache.insert_with_ttl("fail".to_string(), None, Duration::from_secs(5));

        advance(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("hit"), Some(Some(1.0)));
        assert_eq!(cache.get("fail"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_refreshes_expiry() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", Duration::from_secs(10));
        cache.insert("k".to_string(), 1);
        advance(Duration::from_secs(8)).await;
        cache.insert("k".to_string(), 2);
        advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(2));

        cache.clear();
        assert!(cache.is_empty());
    }
}
