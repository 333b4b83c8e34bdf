//! Bounded LRU store with an optional secondary index, used for every
//! size-bounded map the spec calls for: the client correlation store, the
//! server session store, the server route store, and the gateway's
//! per-client backend cache (§3, P13).
//!
//! Grounded on the host daemon's `SessionManager` handle map
//! (`RwLock<HashMap<String, Arc<SessionHandle>>>`), generalized to actually
//! evict — the spec requires bounded LRU and the teacher's map does not
//! evict at all.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// A value evicted from the store, handed back to the caller so it can run
/// cleanup (drop a waiter, tear down a per-client transport, etc.).
pub struct Evicted<K, V> {
    pub key: K,
    pub value: V,
}

pub struct LruStore<K: Hash + Eq + Clone, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq + Clone, V> LruStore<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: LruCache::new(cap),
        }
    }

    /// Insert `key -> value`, returning the evicted entry if the store was
    /// at capacity (P13: "registering N+1 entries in a store of capacity N
    /// evicts exactly one oldest entry").
    pub fn insert(&mut self, key: K, value: V) -> Option<Evicted<K, V>> {
        self.inner
            .push(key, value)
            .map(|(key, value)| Evicted { key, value })
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.inner.len());
        while let Some(pair) = self.inner.pop_lru() {
            out.push(pair);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_drops_exactly_one_oldest_entry() {
        let mut store: LruStore<u32, &'static str> = LruStore::new(2);
        assert!(store.insert(1, "a").is_none());
        assert!(store.insert(2, "b").is_none());
        let evicted = store.insert(3, "c").expect("capacity exceeded, must evict");
        assert_eq!(evicted.key, 1);
        assert_eq!(evicted.value, "a");
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&1));
        assert!(store.contains(&2));
        assert!(store.contains(&3));
    }

    #[test]
    fn get_refreshes_recency() {
        let mut store: LruStore<u32, &'static str> = LruStore::new(2);
        store.insert(1, "a");
        store.insert(2, "b");
        // touch 1 so 2 becomes the oldest
        store.get(&1);
        let evicted = store.insert(3, "c").unwrap();
        assert_eq!(evicted.key, 2);
    }
}
