//! Short-lived caches with stale-while-revalidate semantics.
//!
//! The adapter caches price lists (60 s) and provider metadata (24 h).
//! Entries past 80% of their TTL are still served, but the caller is told
//! to kick off a background revalidation so hot keys never go cold.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quick_cache::sync::Cache;

/// What a cache lookup found.
pub enum Lookup<V> {
    /// Fresh entry; serve it.
    Fresh(V),
    /// Still valid but past the revalidation threshold; serve it and
    /// refresh in the background.
    Stale(V),
    /// Missing or expired; load synchronously.
    Miss,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct SwrCache<K: Eq + Hash, V: Clone> {
    cache: Cache<K, Arc<Entry<V>>>,
    ttl: Duration,
    revalidate_after: Duration,
}

impl<K: Eq + Hash, V: Clone> SwrCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Cache::new(capacity),
            ttl,
            // Revalidate at 80% of TTL.
            revalidate_after: ttl.mul_f64(0.8),
        }
    }

    pub fn get(&self, key: &K) -> Lookup<V> {
        match self.cache.get(key) {
            None => Lookup::Miss,
            Some(entry) => {
                let age = entry.inserted_at.elapsed();
                if age >= self.ttl {
                    Lookup::Miss
                } else if age >= self.revalidate_after {
                    Lookup::Stale(entry.value.clone())
                } else {
                    Lookup::Fresh(entry.value.clone())
                }
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.cache.insert(
            key,
            Arc::new(Entry {
                value,
                inserted_at: Instant::now(),
            }),
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.remove(key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_stale_miss() {
        let cache: SwrCache<&str, u32> =
            SwrCache::new(16, Duration::from_millis(50));
        assert!(matches!(cache.get(&"k"), Lookup::Miss));

        cache.insert("k", 7);
        assert!(matches!(cache.get(&"k"), Lookup::Fresh(7)));

        // Past 80% of TTL: stale but served.
        std::thread::sleep(Duration::from_millis(42));
        assert!(matches!(cache.get(&"k"), Lookup::Stale(7)));

        // Past TTL: miss.
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(cache.get(&"k"), Lookup::Miss));
    }

    #[test]
    fn invalidate_removes() {
        let cache: SwrCache<&str, u32> =
            SwrCache::new(16, Duration::from_secs(60));
        cache.insert("k", 7);
        cache.invalidate(&"k");
        assert!(matches!(cache.get(&"k"), Lookup::Miss));
    }
}
