//! # Stage: Analysis Cache
//!
//! ## Responsibility
//! Memoise expensive aggregate computations per `(endpoint, parameters)` for
//! a fixed TTL.
//!
//! ## Guarantees
//! - Single-flight: concurrent callers of one key while no fresh value exists
//!   run exactly one computation and all observe its result
//! - Failed computations are never stored; the next caller retries
//! - Distinct keys never block each other
//!
//! ## NOT Responsible For
//! - Persistence (the cache is process-local and lost on restart)
//! - Invalidation on new data (entries only expire by TTL or explicit call)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Identifies one cached computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(endpoint: impl Into<String>) -> Self {
        CacheKey { endpoint: endpoint.into(), params: BTreeMap::new() }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, k, v)?;
        }
        Ok(())
    }
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

type Slot<V> = Arc<tokio::sync::Mutex<Option<Entry<V>>>>;

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub computations: u64,
}

/// TTL cache with per-key single-flight recomputation.
///
/// The outer map lock is held only long enough to find or create a key's
/// slot. The slot's async mutex is held across the computation, so a second
/// caller for the same key waits and then reads the fresh value.
pub struct AnalysisCache<V> {
    ttl: Duration,
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
    hits: AtomicU64,
    computations: AtomicU64,
}

impl<V: Clone> AnalysisCache<V> {
    pub fn new(ttl: Duration) -> Self {
        AnalysisCache {
            ttl,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, key: &CacheKey) -> Slot<V> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Return the cached value for `key` if still fresh, otherwise run
    /// `compute` (at most once across concurrent callers) and cache its `Ok`.
    pub async fn get_or_compute<F, Fut, E>(&self, key: CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.stored_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.value.clone());
            }
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "wifi_heatmap::cache", key = %key, "computing");
        let value = compute().await?;
        *guard = Some(Entry { value: value.clone(), stored_at: Instant::now() });
        Ok(value)
    }

    /// Drop one key. A computation already in flight for it still completes
    /// for its own waiters, but later callers recompute.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key).is_some()
    }

    /// Drop every key; returns how many were held.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let n = slots.len();
        slots.clear();
        tracing::info!(target: "wifi_heatmap::cache", cleared = n, "analysis cache cleared");
        n
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.slots.lock().unwrap_or_else(PoisonError::into_inner).len();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &AtomicUsize, value: u32) -> impl Future<Output = Result<u32, String>> + '_ {
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    #[test]
    fn test_cache_key_display_sorts_params() {
        let key = CacheKey::new("trends").with_param("hours", 24).with_param("bucket", "15m");
        assert_eq!(key.to_string(), "trends?bucket=15m&hours=24");
        assert_eq!(CacheKey::new("stats").to_string(), "stats");
    }

    #[tokio::test]
    async fn test_second_call_within_ttl_is_a_hit() {
        let cache = AnalysisCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let a = cache.get_or_compute(CacheKey::new("stats"), || counting(&calls, 7)).await;
        let b = cache.get_or_compute(CacheKey::new("stats"), || counting(&calls, 8)).await;
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = AnalysisCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("channel_recommendations");
        let (a, b, c, d) = tokio::join!(
            cache.get_or_compute(key.clone(), || counting(&calls, 1)),
            cache.get_or_compute(key.clone(), || counting(&calls, 2)),
            cache.get_or_compute(key.clone(), || counting(&calls, 3)),
            cache.get_or_compute(key.clone(), || counting(&calls, 4)),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!([a, b, c, d], [Ok(1), Ok(1), Ok(1), Ok(1)]);
    }

    #[tokio::test]
    async fn test_spawned_callers_share_one_computation() {
        let cache = Arc::new(AnalysisCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(CacheKey::new("stats"), || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(i)
                    })
                    .await
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_distinct_keys_compute_independently() {
        let cache = AnalysisCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let day = CacheKey::new("trends").with_param("hours", 24);
        let week = CacheKey::new("trends").with_param("hours", 168);
        let (a, b) = tokio::join!(
            cache.get_or_compute(day, || counting(&calls, 24)),
            cache.get_or_compute(week, || counting(&calls, 168)),
        );
        assert_eq!((a, b), (Ok(24), Ok(168)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        let cache = AnalysisCache::new(Duration::from_millis(20));
        let calls = AtomicUsize::new(0);
        let _ = cache.get_or_compute(CacheKey::new("stats"), || counting(&calls, 1)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let v = cache.get_or_compute(CacheKey::new("stats"), || counting(&calls, 2)).await;
        assert_eq!(v, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: AnalysisCache<u32> = AnalysisCache::new(Duration::from_secs(60));
        let failed = cache
            .get_or_compute(CacheKey::new("stats"), || async { Err::<u32, _>("store down".to_string()) })
            .await;
        assert!(failed.is_err());
        let ok = cache
            .get_or_compute(CacheKey::new("stats"), || async { Ok::<_, String>(5) })
            .await;
        assert_eq!(ok, Ok(5));
    }

    #[tokio::test]
    async fn test_clear_and_invalidate_force_recompute() {
        let cache = AnalysisCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("heatmap");
        let _ = cache.get_or_compute(key.clone(), || counting(&calls, 1)).await;
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        let _ = cache.get_or_compute(key.clone(), || counting(&calls, 2)).await;
        assert_eq!(cache.clear(), 1);
        let v = cache.get_or_compute(key, || counting(&calls, 3)).await;
        assert_eq!(v, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().computations, 3);
    }
}
