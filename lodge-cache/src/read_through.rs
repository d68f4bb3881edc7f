//! Read-through cache with stale-while-revalidate and request coalescing.
//!
//! Routing for `get`:
//!
//! - fresh entry: served directly, no fetch
//! - stale entry with SWR: served directly, one background refresh started
//!   unless a fetch for the key is already in flight
//! - otherwise: join the in-flight fetch for the key or start one
//!
//! Fetches run on the shared [`BackgroundTasks`] set, so an entry is stored
//! even when every caller stops waiting. Failed fetches never touch the
//! stored entry.

use std::any::{type_name, Any};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::{Entry, VacantEntry};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lodge_core::{CacheError, FetchError, LodgeResult};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::freshness::{CacheOptions, CacheRead};
use crate::stats::{CacheMetrics, CacheStats};
use crate::tasks::{BackgroundTasks, ShutdownMode, ShutdownReport};

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<AnyValue, FetchError>>>;

/// Callback invoked with the fresh value after a background refresh.
pub type UpdateCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;

struct CacheEntry {
    value: AnyValue,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(value: AnyValue, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }
}

struct InFlightFetch {
    /// Distinguishes this fetch from a later one for the same key.
    id: u64,
    future: SharedFetch,
}

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, InFlightFetch>,
    next_fetch_id: AtomicU64,
    metrics: CacheMetrics,
    tasks: BackgroundTasks,
}

impl CacheInner {
    /// Store a finished fetch unless it was invalidated while running.
    fn complete(&self, key: &str, id: u64, ttl: Duration, result: &Result<AnyValue, FetchError>) {
        let current = self.in_flight.get(key).map_or(false, |f| f.id == id);
        match result {
            Ok(value) if current => {
                self.entries
                    .insert(key.to_string(), CacheEntry::new(Arc::clone(value), ttl));
                tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cache entry stored");
            }
            Ok(_) => {
                tracing::debug!(key = %key, "Discarding fetch result invalidated while in flight");
            }
            Err(e) => {
                CacheMetrics::record(&self.metrics.failures);
                tracing::debug!(key = %key, error = %e, "Fetch failed; cache untouched");
            }
        }
        self.in_flight.remove_if(key, |_, f| f.id == id);
    }
}

/// Keyed read-through cache shared by every view of the application.
///
/// Values of different types share one instance; each key holds a single
/// type. Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    /// Create a cache with its own background task set.
    pub fn new() -> Self {
        Self::with_tasks(BackgroundTasks::new())
    }

    /// Create a cache that spawns fetches onto an existing task set.
    pub fn with_tasks(tasks: BackgroundTasks) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                next_fetch_id: AtomicU64::new(0),
                metrics: CacheMetrics::default(),
                tasks,
            }),
        }
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    /// Read `key`, fetching through `fetch` when needed.
    pub async fn get<T, F, Fut>(&self, key: &str, fetch: F, options: CacheOptions) -> LodgeResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.get_inner(key, fetch, options, None).await
    }

    /// Like [`get`](Self::get), but `on_update` receives the fresh value
    /// when a stale read triggers a background refresh that succeeds.
    pub async fn get_with_update<T, F, Fut, U>(
        &self,
        key: &str,
        fetch: F,
        options: CacheOptions,
        on_update: U,
    ) -> LodgeResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
        U: FnOnce(T) + Send + 'static,
    {
        self.get_inner(key, fetch, options, Some(Box::new(on_update)))
            .await
    }

    async fn get_inner<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: CacheOptions,
        on_update: Option<UpdateCallback<T>>,
    ) -> LodgeResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let now = Instant::now();
        let cached = self
            .inner
            .entries
            .get(key)
            .map(|entry| (Arc::clone(&entry.value), entry.is_fresh(now)));

        if let Some((value, fresh)) = cached {
            let value = downcast::<T>(key, &value)?;
            if fresh {
                CacheMetrics::record(&self.inner.metrics.hits);
                tracing::debug!(key = %key, "Cache hit");
                return Ok(value);
            }
            if options.stale_while_revalidate {
                CacheMetrics::record(&self.inner.metrics.stale_hits);
                tracing::debug!(key = %key, "Serving stale entry while revalidating");
                self.revalidate(key, fetch, options.ttl, on_update);
                return Ok(value);
            }
        }

        CacheMetrics::record(&self.inner.metrics.misses);
        let shared = match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                CacheMetrics::record(&self.inner.metrics.coalesced);
                tracing::debug!(key = %key, "Joining in-flight fetch");
                existing.get().future.clone()
            }
            Entry::Vacant(slot) => self.start_fetch::<T, F, Fut>(slot, key, fetch, options.ttl),
        };

        let value = shared.await?;
        Ok(downcast::<T>(key, &value)?)
    }

    fn revalidate<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Duration,
        on_update: Option<UpdateCallback<T>>,
    ) where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let shared = match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(_) => {
                tracing::debug!(key = %key, "Refresh already in flight");
                return;
            }
            Entry::Vacant(slot) => self.start_fetch::<T, F, Fut>(slot, key, fetch, ttl),
        };
        CacheMetrics::record(&self.inner.metrics.background_refreshes);

        let key = key.to_string();
        self.inner.tasks.spawn(async move {
            match shared.await {
                Ok(value) => {
                    if let Some(callback) = on_update {
                        match downcast::<T>(&key, &value) {
                            Ok(value) => callback(value),
                            Err(e) => tracing::warn!(key = %key, error = %e, "Refreshed value has unexpected type"),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Background refresh failed; keeping stale entry");
                }
            }
        });
    }

    /// Register a new in-flight fetch in `slot` and spawn its driver.
    fn start_fetch<T, F, Fut>(
        &self,
        slot: VacantEntry<'_, String, InFlightFetch>,
        key: &str,
        fetch: F,
        ttl: Duration,
    ) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let weak = Arc::downgrade(&self.inner);
        let driver_key = key.to_string();
        let driver = async move {
            let result = fetch().await.map(|value| Arc::new(value) as AnyValue);
            if let Some(inner) = weak.upgrade() {
                inner.complete(&driver_key, id, ttl, &result);
            }
            let _ = tx.send(result);
        };

        let weak = Arc::downgrade(&self.inner);
        let waiter_key = key.to_string();
        let future = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.in_flight.remove_if(&waiter_key, |_, f| f.id == id);
                    }
                    Err(FetchError::Transport {
                        reason: format!("fetch for {} was cancelled", waiter_key),
                    })
                }
            }
        }
        .boxed()
        .shared();

        slot.insert(InFlightFetch {
            id,
            future: future.clone(),
        });
        tracing::debug!(key = %key, fetch_id = id, "Fetch started");
        self.inner.tasks.spawn(driver);
        future
    }

    /// Store an authoritative value obtained outside `get`.
    ///
    /// A fetch still in flight for the key is detached so its older result
    /// cannot overwrite this one.
    pub fn insert<T>(&self, key: &str, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        self.inner.in_flight.remove(key);
        self.inner
            .entries
            .insert(key.to_string(), CacheEntry::new(Arc::new(value), ttl));
    }

    /// Read the stored entry without fetching.
    pub fn peek<T>(&self, key: &str) -> Result<Option<CacheRead<T>>, CacheError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        let Some(entry) = self.inner.entries.get(key) else {
            return Ok(None);
        };
        let value = downcast::<T>(key, &entry.value)?;
        Ok(Some(CacheRead::new(value, entry.age(now), entry.ttl)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    /// Remove one entry. Returns whether it existed.
    ///
    /// A fetch already in flight for `key` is detached: its waiters still
    /// get its result but it is not stored, and the next read starts a
    /// second fetch alongside it. Invalidating during a load can therefore
    /// cost one extra network call.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.in_flight.remove(key);
        let removed = self.inner.entries.remove(key).is_some();
        tracing::debug!(key = %key, removed, "Cache key invalidated");
        removed
    }

    /// Remove every entry whose key starts with `prefix`. In-flight fetches
    /// under the prefix are detached as in [`invalidate`](Self::invalidate).
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.inner.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.inner.in_flight.retain(|key, _| !key.starts_with(prefix));
        tracing::debug!(prefix = %prefix, removed, "Cache prefix invalidated");
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.in_flight.clear();
        self.inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .metrics
            .snapshot(self.inner.entries.len(), self.inner.in_flight.len())
    }

    /// Settle outstanding background work. Entries stay readable.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
        self.inner.tasks.shutdown(mode).await
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

fn downcast<T: Clone + 'static>(key: &str, value: &AnyValue) -> Result<T, CacheError> {
    (**value)
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| CacheError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodge_core::LodgeError;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = QueryCache::new();
        cache.insert("k", 1u32, Duration::from_secs(10));
        assert!(cache.peek::<u32>("k").unwrap().unwrap().is_fresh());

        tokio::time::advance(Duration::from_secs(10)).await;
        let read = cache.peek::<u32>("k").unwrap().unwrap();
        assert!(read.is_stale());
        assert_eq!(read.into_value(), 1);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let cache = QueryCache::new();
        cache.insert("k", 1u32, Duration::from_secs(10));

        let err = cache
            .get("k", || async { Ok::<_, FetchError>("x".to_string()) }, CacheOptions::ttl(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LodgeError::Cache(CacheError::TypeMismatch { ref key, .. }) if key == "k"
        ));
        assert!(cache.peek::<String>("k").is_err());
    }

    #[tokio::test]
    async fn test_invalidate_by_prefix_counts_removed() {
        let cache = QueryCache::new();
        let ttl = Duration::from_secs(10);
        cache.insert("unread:a", 1u32, ttl);
        cache.insert("unread:b", 2u32, ttl);
        cache.insert("members:a", 3u32, ttl);

        assert_eq!(cache.invalidate_by_prefix("unread:"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("members:a"));
        assert!(!cache.invalidate("unread:a"));
        assert!(cache.invalidate("members:a"));
        assert!(cache.is_empty());
    }
}
