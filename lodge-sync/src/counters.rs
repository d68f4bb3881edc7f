//! Aggregate Counters
//!
//! Derived read models computed with one batched query each:
//!
//! - unread: per collection, items newer than the subject's own read cursor
//!   and not authored by the subject
//! - pending: per location, bookings and change requests still awaiting
//!   the owner
//!
//! [`Counters`] caches both under `unread:{subject}` / `pending:{subject}`;
//! [`LiveCounters`] recomputes them on the push/poll cadence and publishes
//! the totals on a watch channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use lodge_cache::{keys, CacheOptions, QueryCache};
use lodge_core::{
    ActivityQuery, ActivityRow, ActivitySource, ChangeEvent, CollectionId, CountersConfig,
    FetchError, LodgeError, LodgeResult, PendingRow, PushFeed, ReadCursor, ReadCursorStore,
    SubjectId, Table, Topic,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::trigger::{run_refresh_loop, Refresh, RefreshCause, TriggerConfig, TriggerMetrics};

// ============================================================================
// COUNTS
// ============================================================================

/// Count per collection (or location).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountsByCollection {
    counts: HashMap<CollectionId, usize>,
}

impl CountsByCollection {
    pub fn get(&self, collection_id: CollectionId) -> usize {
        self.counts.get(&collection_id).copied().unwrap_or(0)
    }

    /// Whether the collection appears at all, zero included.
    pub fn contains(&self, collection_id: CollectionId) -> bool {
        self.counts.contains_key(&collection_id)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CollectionId, usize)> + '_ {
        self.counts.iter().map(|(id, n)| (*id, *n))
    }

    pub fn into_map(self) -> HashMap<CollectionId, usize> {
        self.counts
    }
}

impl From<HashMap<CollectionId, usize>> for CountsByCollection {
    fn from(counts: HashMap<CollectionId, usize>) -> Self {
        Self { counts }
    }
}

/// Bucket `rows` against each collection's own cursor.
///
/// Every cursor's collection appears in the result; rows by `subject_id`,
/// rows at or before the cursor, and rows for collections without a cursor
/// are not counted.
pub fn count_unread(subject_id: SubjectId, cursors: &[ReadCursor], rows: &[ActivityRow]) -> CountsByCollection {
    let mut read_up_to = HashMap::with_capacity(cursors.len());
    for cursor in cursors {
        read_up_to
            .entry(cursor.collection_id)
            .and_modify(|at| {
                if cursor.last_read_at > *at {
                    *at = cursor.last_read_at;
                }
            })
            .or_insert(cursor.last_read_at);
    }

    let mut counts: HashMap<CollectionId, usize> = read_up_to.keys().map(|id| (*id, 0)).collect();
    for row in rows {
        if row.author_id == subject_id {
            continue;
        }
        if let Some(cursor) = read_up_to.get(&row.collection_id) {
            if row.created_at > *cursor {
                *counts.entry(row.collection_id).or_insert(0) += 1;
            }
        }
    }
    counts.into()
}

/// Count still-pending requests per location.
pub fn count_pending(rows: &[PendingRow]) -> CountsByCollection {
    let mut counts = HashMap::new();
    for row in rows.iter().filter(|r| r.kind.is_pending()) {
        *counts.entry(row.location_id).or_insert(0) += 1;
    }
    counts.into()
}

// ============================================================================
// SERVICE
// ============================================================================

/// Computes and caches counters for any subject.
#[derive(Clone)]
pub struct Counters {
    cursors: Arc<dyn ReadCursorStore>,
    activity: Arc<dyn ActivitySource>,
    cache: QueryCache,
    ttl: Duration,
}

impl Counters {
    pub fn new(
        cursors: Arc<dyn ReadCursorStore>,
        activity: Arc<dyn ActivitySource>,
        cache: QueryCache,
        config: &CountersConfig,
    ) -> Self {
        Self {
            cursors,
            activity,
            cache,
            ttl: config.cache_ttl(),
        }
    }

    /// Unread counts per collection, bypassing the cache.
    ///
    /// One cursor read plus one activity query from the oldest cursor; no
    /// activity query when the subject has no cursors.
    pub async fn compute_unread(&self, subject_id: SubjectId) -> Result<CountsByCollection, FetchError> {
        compute_unread(self.cursors.as_ref(), self.activity.as_ref(), subject_id).await
    }

    /// Pending requests per owned location, bypassing the cache.
    pub async fn compute_pending(&self, owner: SubjectId) -> Result<CountsByCollection, FetchError> {
        let rows = self.activity.pending_requests(owner).await?;
        Ok(count_pending(&rows))
    }

    /// Cached unread counts.
    pub async fn unread(&self, subject_id: SubjectId) -> LodgeResult<CountsByCollection> {
        let this = self.clone();
        self.cache
            .get(
                &keys::unread(subject_id),
                move || async move { this.compute_unread(subject_id).await },
                CacheOptions::ttl(self.ttl),
            )
            .await
    }

    /// Cached pending counts.
    pub async fn pending(&self, owner: SubjectId) -> LodgeResult<CountsByCollection> {
        let this = self.clone();
        self.cache
            .get(
                &keys::pending(owner),
                move || async move { this.compute_pending(owner).await },
                CacheOptions::ttl(self.ttl),
            )
            .await
    }

    /// Drop the cached unread counts and recompute.
    pub async fn refresh_unread(&self, subject_id: SubjectId) -> LodgeResult<CountsByCollection> {
        self.cache.invalidate(&keys::unread(subject_id));
        self.unread(subject_id).await
    }

    pub async fn refresh_pending(&self, owner: SubjectId) -> LodgeResult<CountsByCollection> {
        self.cache.invalidate(&keys::pending(owner));
        self.pending(owner).await
    }
}

async fn compute_unread(
    cursors: &dyn ReadCursorStore,
    activity: &dyn ActivitySource,
    subject_id: SubjectId,
) -> Result<CountsByCollection, FetchError> {
    let cursor_rows = cursors.cursors_for(subject_id).await?;
    let Some(since) = cursor_rows.iter().map(|c| c.last_read_at).min() else {
        return Ok(CountsByCollection::default());
    };
    let mut collections: Vec<CollectionId> = cursor_rows.iter().map(|c| c.collection_id).collect();
    collections.sort();
    collections.dedup();

    let rows = activity
        .activity_since(&ActivityQuery {
            collections,
            since,
            exclude_author: subject_id,
        })
        .await?;
    Ok(count_unread(subject_id, &cursor_rows, &rows))
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters").field("ttl", &self.ttl).finish()
    }
}

// ============================================================================
// LIVE COUNTERS
// ============================================================================

/// Totals published by [`LiveCounters`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterView {
    pub unread: CountsByCollection,
    /// Only tracked when enabled on start.
    pub pending: CountsByCollection,
    pub last_error: Option<FetchError>,
    /// Number of completed recomputations.
    pub refreshes: u64,
}

struct CounterTarget {
    counters: Counters,
    subject_id: SubjectId,
    track_pending: bool,
    view_tx: watch::Sender<CounterView>,
    closed: AtomicBool,
}

impl CounterTarget {
    async fn recompute(&self) -> Result<(), LodgeError> {
        let unread = self.counters.refresh_unread(self.subject_id).await?;
        let pending = if self.track_pending {
            self.counters.refresh_pending(self.subject_id).await?
        } else {
            CountsByCollection::default()
        };
        if !self.closed.load(Ordering::Acquire) {
            self.view_tx.send_modify(|view| {
                view.unread = unread;
                view.pending = pending;
                view.last_error = None;
                view.refreshes += 1;
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Refresh for CounterTarget {
    async fn refresh(&self, cause: RefreshCause) {
        if let Err(e) = self.recompute().await {
            tracing::warn!(
                subject_id = %self.subject_id,
                cause = cause.as_str(),
                error = %e,
                "Counter refresh failed; keeping last totals"
            );
            if let LodgeError::Fetch(fetch) = e {
                if !self.closed.load(Ordering::Acquire) {
                    self.view_tx.send_modify(|view| view.last_error = Some(fetch));
                }
            }
        }
    }
}

/// Counters for one subject kept current from push events and polling.
pub struct LiveCounters {
    target: Arc<CounterTarget>,
    view_rx: watch::Receiver<CounterView>,
    shutdown_tx: watch::Sender<bool>,
    refresh_loop: JoinHandle<()>,
}

impl LiveCounters {
    /// Compute once, then follow message changes (and booking changes when
    /// `track_pending` is set) until closed.
    pub async fn start(
        counters: Counters,
        subject_id: SubjectId,
        push: Option<Arc<dyn PushFeed>>,
        config: &CountersConfig,
        track_pending: bool,
    ) -> Self {
        if let Err(e) = config.validate() {
            tracing::warn!(subject_id = %subject_id, error = %e, "Invalid counters config");
        }
        let (view_tx, view_rx) = watch::channel(CounterView::default());
        let target = Arc::new(CounterTarget {
            counters,
            subject_id,
            track_pending,
            view_tx,
            closed: AtomicBool::new(false),
        });

        let events: BoxStream<'static, ChangeEvent> = match &push {
            Some(feed) => {
                let messages = feed.subscribe(&Topic::all(Table::Messages));
                if track_pending {
                    let bookings = feed.subscribe(&Topic::all(Table::Bookings));
                    stream::select(messages, bookings).boxed()
                } else {
                    messages
                }
            }
            None => stream::pending().boxed(),
        };

        target.refresh(RefreshCause::Manual).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let refresh_loop = tokio::spawn(run_refresh_loop(
            Arc::clone(&target) as Arc<dyn Refresh>,
            events,
            None,
            TriggerConfig::from(config),
            Arc::new(TriggerMetrics::default()),
            shutdown_rx,
        ));
        tracing::info!(subject_id = %subject_id, track_pending, "Live counters started");

        Self {
            target,
            view_rx,
            shutdown_tx,
            refresh_loop,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CounterView> {
        self.view_rx.clone()
    }

    pub fn view(&self) -> CounterView {
        self.view_rx.borrow().clone()
    }

    pub fn total_unread(&self) -> usize {
        self.view_rx.borrow().unread.total()
    }

    pub fn total_pending(&self) -> usize {
        self.view_rx.borrow().pending.total()
    }

    /// Recompute now.
    pub async fn refresh(&self) -> LodgeResult<()> {
        self.target.recompute().await
    }

    pub fn close(&self) {
        if !self.target.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_tx.send_replace(true);
            tracing::info!(subject_id = %self.target.subject_id, "Live counters closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.target.closed.load(Ordering::Acquire)
    }
}

impl Drop for LiveCounters {
    fn drop(&mut self) {
        self.close();
        self.refresh_loop.abort();
    }
}

// =============================================================================
// TESTS
// =============================================================================
