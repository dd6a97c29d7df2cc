//! Caches — TTL + size-bounded associative caches, read-through and
//! write-through, with per-entry locking so concurrent misses on the same
//! key coalesce into one computation.
//!
//! Built around `DashMap` for concurrent shared state, with TTL-checked
//! entries (a `built_at` timestamp) and LRU eviction by oldest timestamp
//! when at capacity — generalized here into one reusable type instead of
//! duplicating the pattern at every call site that needs a cache.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

struct Slot<V> {
    value: Option<V>,
    inserted_at: Instant,
    last_accessed: Instant,
}

/// A read-through/write-through cache with a fixed TTL and a soft size
/// bound. Each key gets its own `AsyncMutex` slot so two concurrent misses
/// on the same key run the compute closure once, not twice.
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    max_size: usize,
    slots: DashMap<K, Arc<AsyncMutex<Slot<V>>>>,
    pub hits: std::sync::atomic::AtomicU64,
    pub misses: std::sync::atomic::AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration, max_size: usize) -> Self {
        Self {
            name,
            ttl,
            max_size,
            slots: DashMap::new(),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Look up `key` without computing on miss. Useful when the caller
    /// wants to bypass the cache conditionally (e.g. the analyzer cache is
    /// bypassed entirely when prior-turn context is present — spec §4.5).
    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key)?.clone();
        // try_lock: a concurrent compute is in flight, treat as a miss
        // rather than blocking the caller on someone else's work.
        let mut guard = slot.try_lock().ok()?;
        if let Some(v) = &guard.value {
            if guard.inserted_at.elapsed() < self.ttl {
                guard.last_accessed = Instant::now();
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Some(v.clone());
            }
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.evict_if_full();
        let now = Instant::now();
        self.slots.insert(
            key,
            Arc::new(AsyncMutex::new(Slot {
                value: Some(value),
                inserted_at: now,
                last_accessed: now,
            })),
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.slots.remove(key);
    }

    /// Read-through: on a fresh miss, run `compute` once (holding the
    /// per-key lock so a second concurrent caller waits for the first
    /// result instead of recomputing) and write the result back.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        self.evict_if_full();
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Slot {
                    value: None,
                    inserted_at: Instant::now(),
                    last_accessed: Instant::now(),
                }))
            })
            .clone();

        let mut guard = slot.lock().await;
        if let Some(v) = &guard.value {
            if guard.inserted_at.elapsed() < self.ttl {
                guard.last_accessed = Instant::now();
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(cache = self.name, "cache hit");
                return v.clone();
            }
        }

        debug!(cache = self.name, "cache miss, computing");
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let value = compute().await;
        guard.value = Some(value.clone());
        guard.inserted_at = Instant::now();
        guard.last_accessed = Instant::now();
        value
    }

    fn evict_if_full(&self) {
        if self.slots.len() < self.max_size {
            return;
        }
        // Evict the least-recently-used entry. DashMap has no global
        // ordering, so this is a linear scan bounded by max_size — cheap
        // relative to the network/model call a miss would otherwise cost.
        let oldest_key = self
            .slots
            .iter()
            .filter_map(|entry| entry.value().try_lock().ok().map(|g| (entry.key().clone(), g.last_accessed)))
            .min_by_key(|(_, accessed)| *accessed)
            .map(|(k, _)| k);
        if let Some(k) = oldest_key {
            self.slots.remove(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Canonical cache-key builder for `query_result_cache`: every input that
/// changes the answer must be part of the key (spec invariant — "no two
/// distinct inputs share a cache key").
pub fn query_result_cache_key(
    query: &str,
    channel: Option<&str>,
    doc_filter: Option<&str>,
    prior_ctx_hash: Option<&str>,
) -> String {
    format!(
        "{}|{}|{}|{}",
        query,
        channel.unwrap_or(""),
        doc_filter.unwrap_or(""),
        prior_ctx_hash.unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_compute_runs_once_per_fresh_key() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", Duration::from_secs(30), 100);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let c2 = calls.clone();
        let v1 = cache
            .get_or_compute("k".to_string(), || async move {
                c2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                42
            })
            .await;
        assert_eq!(v1, 42);

        let c3 = calls.clone();
        let v2 = cache
            .get_or_compute("k".to_string(), || async move {
                c3.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                99
            })
            .await;
        assert_eq!(v2, 42, "second call should hit cache, not recompute");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_forces_recompute() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", Duration::from_millis(10), 100);
        cache.get_or_compute("k".to_string(), || async { 1 }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let v = cache.get_or_compute("k".to_string(), || async { 2 }).await;
        assert_eq!(v, 2);
    }

    #[test]
    fn distinct_context_yields_distinct_keys() {
        let a = query_result_cache_key("q", Some("c1"), None, None);
        let b = query_result_cache_key("q", Some("c1"), None, Some("ctx-hash"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", Duration::from_secs(30), 2);
        cache.insert("a".to_string(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert("b".to_string(), 2);
        // touch "a" so it's most-recently-used
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert("c".to_string(), 3);
        assert!(cache.get(&"b".to_string()).is_none() || cache.get(&"a".to_string()).is_some());
    }
}
