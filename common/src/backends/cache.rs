use std::sync::{Arc, RwLock};
use std::time::Duration;

use ttl_cache::TtlCache;

/// Process-local cache with per-entry TTLs.
pub trait CacheManagement: Send + Sync {
    type Value: Clone;

    fn get(&self, key: &str) -> Option<Self::Value>;
    fn insert(&self, key: &str, value: Self::Value, ttl: Duration) -> Option<Self::Value>;
    fn invalidate(&self, key: &str) -> Option<Self::Value>;
}

pub struct CacheManager<V> {
    cache: Arc<RwLock<TtlCache<String, V>>>,
}

impl<V> CacheManager<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Arc::new(RwLock::new(TtlCache::new(capacity))),
        }
    }
}

impl<V: Clone + Send + Sync> CacheManagement for CacheManager<V> {
    type Value = V;

    fn get(&self, key: &str) -> Option<V> {
        self.cache.read().unwrap().get(key).cloned()
    }

    fn insert(&self, key: &str, value: V, ttl: Duration) -> Option<V> {
        self.cache.write().unwrap().insert(key.to_string(), value, ttl)
    }

    fn invalidate(&self, key: &str) -> Option<V> {
        self.cache.write().unwrap().remove(key)
    }
}
