//! Read-through hot cache built on [`moka`].
//!
//! Used in front of SQLite-backed records that are read far more often than
//! written (checkpoints during resume, for instance).  Values are kept as
//! clones of `T`; no serialization happens on the hot path.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::trace;

use crate::error::StoreResult;

// ── stats ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits over total lookups; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.1}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0
        )
    }
}

// ── cache ────────────────────────────────────────────────────────────

/// String-keyed cache of `T` with TTL and capacity bounds.
pub struct HotCache<T> {
    name: &'static str,
    inner: Cache<String, T>,
    stats: Arc<CacheStats>,
}

impl<T> Clone for HotCache<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> HotCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            name,
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let found = self.inner.get(key).await;
        let counter = if found.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(cache = self.name, key, hit = found.is_some(), "cache lookup");
        found
    }

    pub async fn insert(&self, key: &str, value: T) {
        self.inner.insert(key.to_string(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Return the cached value, or run `load` and cache a `Some` result.
    /// `None` results are not cached.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> StoreResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Option<T>>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(Some(hit));
        }
        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.insert(key, value.clone()).await;
        }
        Ok(loaded)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> HotCache<String> {
        HotCache::new("test", 16, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn get_after_insert_hits() {
        let c = cache();
        c.insert("k", "v".to_string()).await;
        assert_eq!(c.get("k").await.as_deref(), Some("v"));
        assert!(c.get("missing").await.is_none());
        assert_eq!(c.stats().hits(), 1);
        assert_eq!(c.stats().misses(), 1);
    }

    #[tokio::test]
    async fn get_or_load_only_loads_once() {
        let c = cache();
        let first = c
            .get_or_load("k", || async { Ok(Some("loaded".to_string())) })
            .await
            .unwrap();
        let second = c
            .get_or_load("k", || async { Ok(Some("not used".to_string())) })
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("loaded"));
        assert_eq!(second.as_deref(), Some("loaded"));
    }

    #[tokio::test]
    async fn none_is_not_cached() {
        let c = cache();
        let miss = c.get_or_load("k", || async { Ok(None) }).await.unwrap();
        assert!(miss.is_none());
        let later = c
            .get_or_load("k", || async { Ok(Some("now".to_string())) })
            .await
            .unwrap();
        assert_eq!(later.as_deref(), Some("now"));
    }

    #[tokio::test]
    async fn invalidate_drops_entry() {
        let c = cache();
        c.insert("k", "v".to_string()).await;
        c.invalidate("k").await;
        assert!(c.get("k").await.is_none());
        assert!(c.stats().to_string().contains("hits=0"));
    }
}
