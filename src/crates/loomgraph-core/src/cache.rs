//! Task-result memoization with TTL eviction.
//!
//! A node with a [`CachePolicy`] has its action results memoized keyed by a
//! deterministic function of the input. The cache check happens before
//! execution and before the retry layer, so a hit consumes no retry budget
//! and never invokes the action.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cache configuration attached to a node.
#[derive(Clone)]
pub struct CachePolicy {
    /// Derives the cache key from the task input. Must be deterministic.
    pub key_func: Arc<dyn Fn(&Value) -> String + Send + Sync>,
    /// Entry lifetime; `None` never expires.
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            key_func: Arc::new(default_key),
            ttl,
        }
    }

    pub fn with_key_func<F>(mut self, key_func: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.key_func = Arc::new(key_func);
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("key_func", &"<fn>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Default key derivation: hash of the serialized input.
fn default_key(input: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    input.to_string().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    node: String,
    key: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.inserted_at.elapsed() >= ttl)
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

/// Shared memoization store for task results, keyed by `(node, derived key)`.
///
/// Expired entries are evicted lazily on access and insertion.
#[derive(Debug, Default)]
pub struct TaskCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    metrics: Mutex<CacheMetrics>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fresh entry; records a hit or miss.
    pub fn get(&self, node: &str, key: &str) -> Option<Value> {
        let cache_key = CacheKey {
            node: node.to_string(),
            key: key.to_string(),
        };
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let result = match entries.get(&cache_key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(&cache_key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        };
        drop(entries);

        let mut metrics = self.metrics.lock().expect("cache lock poisoned");
        if result.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        result
    }

    /// Store a successful result.
    pub fn put(&self, node: &str, key: &str, value: Value, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.retain(|_, entry| !entry.is_expired());
        entries.insert(
            CacheKey {
                node: node.to_string(),
                key: key.to_string(),
            },
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop every entry for a node.
    pub fn invalidate_node(&self, node: &str) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .retain(|k, _| k.node != node);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        *self.metrics.lock().expect("cache lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_key_is_deterministic() {
        let policy = CachePolicy::default();
        let a = (policy.key_func)(&json!({"x": 1}));
        let b = (policy.key_func)(&json!({"x": 1}));
        assert_eq!(a, b);
        let c = (policy.key_func)(&json!({"x": 2}));
        assert_ne!(a, c);
    }

    #[test]
    fn get_put_round_trip() {
        let cache = TaskCache::new();
        assert!(cache.get("node", "k").is_none());
        cache.put("node", "k", json!(42), None);
        assert_eq!(cache.get("node", "k"), Some(json!(42)));

        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
    }

    #[test]
    fn entries_are_scoped_per_node() {
        let cache = TaskCache::new();
        cache.put("a", "k", json!(1), None);
        assert!(cache.get("b", "k").is_none());
    }

    #[test]
    fn ttl_expiry() {
        let cache = TaskCache::new();
        cache.put("node", "k", json!(1), Some(Duration::from_millis(10)));
        assert_eq!(cache.get("node", "k"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("node", "k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_node_drops_only_that_node() {
        let cache = TaskCache::new();
        cache.put("a", "k1", json!(1), None);
        cache.put("a", "k2", json!(2), None);
        cache.put("b", "k1", json!(3), None);

        cache.invalidate_node("a");
        assert!(cache.get("a", "k1").is_none());
        assert_eq!(cache.get("b", "k1"), Some(json!(3)));
    }
}
