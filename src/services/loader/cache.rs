//! Process-wide loader cache with TTL and LRU eviction
//!
//! Backs loaders registered with [`LoaderFactories::register_shared`](super::registry::LoaderFactories::register_shared).
//! Only read-mostly reference data that looks the same to every viewer belongs here.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A cached entry with expiration time and recency stamp
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_used: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Recency stamp -> key, oldest first
    recency: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Clone + Eq + Hash, V> CacheState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_used);
        Some(entry)
    }
}

/// TTL cache bounded by entry count, evicting the least recently used entry
pub struct TtlLruCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a new cache. A `max_entries` of zero is treated as one.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached value if it exists and hasn't expired, marking it as recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) => Instant::now() >= entry.expires_at,
            None => return None,
        };
        if expired {
            state.remove(key);
            return None;
        }

        let tick = state.next_tick();
        let entry = state.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.last_used, tick);
        let value = entry.value.clone();
        state.recency.remove(&previous);
        state.recency.insert(tick, key.clone());
        Some(value)
    }

    /// Insert or replace a value, evicting the least recently used entry when full
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.remove(&key);

        while state.entries.len() >= self.max_entries {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
                last_used: tick,
            },
        );
    }

    /// Remove a cached value
    pub fn remove(&self, key: &K) {
        self.state.lock().remove(key);
    }

    /// Remove everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
    }

    /// Remove all expired entries
    pub fn cleanup_expired(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_cache_set_and_get() {
        let cache = TtlLruCache::new(Duration::from_secs(60), 10);
        cache.insert("key".to_string(), "value".to_string());
        assert_eq!(cache.get(&"key".to_string()), Some("value".to_string()));
    }

    #[test]
    fn test_cache_expiration() {
        let cache = TtlLruCache::new(Duration::from_millis(50), 10);
        cache.insert("key".to_string(), "value".to_string());
        assert_eq!(cache.get(&"key".to_string()), Some("value".to_string()));

        sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&"key".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_keeps_recently_used() {
        let cache = TtlLruCache::new(Duration::from_secs(60), 2);
        cache.insert(1, "one");
        cache.insert(2, "two");

        // Touch 1 so 2 becomes the eviction candidate
        assert_eq!(cache.get(&1), Some("one"));
        cache.insert(3, "three");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some("three"));
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = TtlLruCache::new(Duration::from_secs(60), 2);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(1, "uno");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some("uno"));
        assert_eq!(cache.get(&2), Some("two"));
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = TtlLruCache::new(Duration::from_millis(20), 10);
        cache.insert(1, 1);
        cache.insert(2, 2);
        sleep(Duration::from_millis(30));
        cache.cleanup_expired();
        assert!(cache.is_empty());
    }
}
