//! Route cache mapping named resources to the cluster that owns them
//!
//! Populated by the aggregator when a fan-out observes a named object in
//! exactly one cluster; consulted by the dispatcher so later requests for
//! that name skip the fan-out. Entries are best effort: a miss only costs
//! a fan-out, never correctness. Bounded with least-recently-used
//! eviction so a busy proxy cannot grow without limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Default maximum number of cached routes
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Cache key: a named resource within a namespace
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RouteKey {
    /// Tenant namespace
    pub namespace: String,
    /// Resource type segment from the path
    pub resource_type: String,
    /// Resource name; never empty for cached entries
    pub resource_name: String,
}

impl RouteKey {
    /// Build a key; returns `None` when the name is empty, since only
    /// named resources have a stable home cluster
    pub fn new(namespace: &str, resource_type: &str, resource_name: &str) -> Option<Self> {
        if resource_name.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
        })
    }
}

struct Entry {
    cluster: String,
    /// Last access order (higher = more recent)
    order: u64,
}

/// Bounded route cache, safe for concurrent request handling
pub struct RouteCache {
    max_size: usize,
    entries: RwLock<HashMap<RouteKey, Entry>>,
    counter: AtomicU64,
}

impl RouteCache {
    /// Create a cache holding at most `max_size` routes
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn next_order(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up the cluster for a named resource, refreshing its recency
    pub fn get(&self, key: &RouteKey) -> Option<String> {
        let cluster = {
            let entries = self.entries.read().expect("route cache lock poisoned");
            entries.get(key).map(|e| e.cluster.clone())?
        };
        let order = self.next_order();
        if let Ok(mut entries) = self.entries.try_write() {
            if let Some(entry) = entries.get_mut(key) {
                entry.order = order;
            }
        }
        Some(cluster)
    }

    /// Record the cluster owning a named resource.
    ///
    /// Concurrent writers that observed the same cluster are idempotent;
    /// a later writer with a different cluster wins, which matches the
    /// object having moved.
    pub fn insert(&self, key: RouteKey, cluster: String) {
        let order = self.next_order();
        let mut entries = self.entries.write().expect("route cache lock poisoned");
        if !entries.contains_key(&key) {
            Self::evict_if_needed(self.max_size, &mut entries);
        }
        entries.insert(key, Entry { cluster, order });
    }

    /// Drop a route, e.g. after the resource was deleted
    pub fn invalidate(&self, key: &RouteKey) {
        let mut entries = self.entries.write().expect("route cache lock poisoned");
        entries.remove(key);
    }

    /// Number of cached routes
    pub fn len(&self) -> usize {
        self.entries.read().expect("route cache lock poisoned").len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_needed(max_size: usize, entries: &mut HashMap<RouteKey, Entry>) {
        while entries.len() >= max_size {
            let lru_key = entries
                .iter()
                .min_by_key(|(_, entry)| entry.order)
                .map(|(key, _)| key.clone());
            match lru_key {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(name: &str) -> RouteKey {
        RouteKey::new("team-a", "pods", name).unwrap()
    }

    #[test]
    fn test_key_requires_name() {
        assert!(RouteKey::new("team-a", "pods", "").is_none());
        assert!(RouteKey::new("team-a", "pods", "p1").is_some());
    }

    #[test]
    fn test_insert_get_invalidate() {
        let cache = RouteCache::default();
        cache.insert(key("p1"), "w1".into());
        assert_eq!(cache.get(&key("p1")).as_deref(), Some("w1"));

        cache.invalidate(&key("p1"));
        assert!(cache.get(&key("p1")).is_none());
    }

    #[test]
    fn test_rewrite_wins() {
        let cache = RouteCache::default();
        cache.insert(key("p1"), "w1".into());
        cache.insert(key("p1"), "w2".into());
        assert_eq!(cache.get(&key("p1")).as_deref(), Some("w2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_keeps_recent() {
        let cache = RouteCache::new(3);
        cache.insert(key("a"), "w1".into());
        cache.insert(key("b"), "w1".into());
        cache.insert(key("c"), "w1".into());
        // Touch "a" so "b" is now the least recently used
        assert!(cache.get(&key("a")).is_some());

        cache.insert(key("d"), "w1".into());
        assert!(cache.len() <= 3);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("d")).is_some());
    }

    #[test]
    fn test_concurrent_same_key_idempotent() {
        let cache = Arc::new(RouteCache::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    cache.insert(key("p1"), "w1".into());
                    assert_eq!(cache.get(&key("p1")).as_deref(), Some("w1"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
    }
}
