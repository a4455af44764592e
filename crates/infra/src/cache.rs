//! Display-only read cache with explicit invalidation.
//!
//! Mutations invalidate affected keys synchronously after commit. The TTL is a
//! safety net for missed invalidations; correctness never depends on it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Key under which the operations dashboard summary is cached.
pub const DASHBOARD_KEY: &str = "ops-dashboard";

/// Receives invalidation requests from write paths.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &str);
}

/// Invalidator that does nothing. For callers without a cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _key: &str) {}
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct ReadCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Option<Duration>,
}

impl<V: Clone> ReadCache<V> {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if self.ttl.is_some_and(|ttl| entry.stored_at.elapsed() >= ttl) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.into(),
                Entry {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Return the cached value or compute, store and return a fresh one.
    pub fn get_or_insert_with(&self, key: &str, compute: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(key) {
            return hit;
        }
        let value = compute();
        self.set(key, value.clone());
        value
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }
}

impl<V: Clone + Send + Sync> CacheInvalidator for ReadCache<V> {
    fn invalidate(&self, key: &str) {
        self.remove(key);
    }
}
