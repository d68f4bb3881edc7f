//! Live Collection Synchronizer
//!
//! A [`LiveCollection`] keeps one server collection on display and in sync:
//!
//! 1. `Loading`: one full fetch, through the read-through cache when a
//!    cache key is configured (stale data is shown at once, the refresh
//!    lands as a later snapshot)
//! 2. `Live`: push events (debounced) and poll ticks both call the same
//!    refetch-and-replace routine; results carry fetch tickets so an older
//!    fetch never overwrites a newer one
//! 3. `Stale`: the last refetch failed; the last good data stays visible
//!    and the next success returns to `Live`
//! 4. `Closed`: the push subscription and poll timer are gone and the view
//!    no longer changes
//!
//! Local creates appear immediately as pending items, are deduplicated by
//! idempotency key through the [`MutationGuard`], and are either promoted
//! to their canonical id or rolled back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use lodge_cache::{BackgroundTasks, CacheOptions, MutationGuard, QueryCache};
use lodge_core::{
    ChangeEvent, CollectionError, CollectionId, CollectionItem, CollectionQuery, CollectionSource,
    FetchError, ItemId, ItemWriter, LodgeError, LodgeResult, Membership, MutationError,
    OptimisticContext, PushFeed, ReadCursorStore, SortOrder, SubjectId, SyncConfig, Timestamp,
    Topic, ViewItem,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::reconcile::{Reconciler, SnapshotOutcome, Ticket};
use crate::trigger::{
    run_refresh_loop, Refresh, RefreshCause, TriggerConfig, TriggerMetrics, TriggerSnapshot,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// VIEW
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionStatus {
    Idle,
    Loading,
    Live,
    /// Showing the last good data after a failed fetch.
    Stale,
    Closed,
}

/// What a UI renders. Published on a watch channel after every change.
#[derive(Debug, Clone)]
pub struct CollectionView<I> {
    pub items: Vec<ViewItem<I>>,
    pub status: CollectionStatus,
    /// Last fetch failure, cleared by the next successful fetch.
    pub last_error: Option<FetchError>,
    /// Increases only when `items` changes.
    pub version: u64,
}

impl<I: CollectionItem> CollectionView<I> {
    fn idle() -> Self {
        Self {
            items: Vec::new(),
            status: CollectionStatus::Idle,
            last_error: None,
            version: 0,
        }
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(ViewItem::id).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|v| v.is_pending()).count()
    }

    /// Whether the failure shown can go away by itself on the next poll.
    pub fn is_retryable(&self) -> bool {
        matches!(self.last_error, Some(FetchError::Transport { .. }))
    }
}

// ============================================================================
// BUILDER
// ============================================================================

struct CacheBinding {
    cache: QueryCache,
    key: String,
    options: CacheOptions,
}

/// Collaborators and options for one live collection.
pub struct LiveCollectionBuilder<I: CollectionItem> {
    collection_id: CollectionId,
    subject_id: SubjectId,
    source: Arc<dyn CollectionSource<I>>,
    writer: Option<Arc<dyn ItemWriter<I>>>,
    push: Option<Arc<dyn PushFeed>>,
    cursors: Option<Arc<dyn ReadCursorStore>>,
    cache: Option<CacheBinding>,
    guard: Option<MutationGuard>,
    tasks: Option<BackgroundTasks>,
    config: SyncConfig,
    order: SortOrder,
    topic: Option<Topic>,
}

impl<I: CollectionItem> LiveCollectionBuilder<I> {
    pub fn with_writer(mut self, writer: Arc<dyn ItemWriter<I>>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_push_feed(mut self, feed: Arc<dyn PushFeed>) -> Self {
        self.push = Some(feed);
        self
    }

    /// Advance `subject_id`'s read cursor on load and on push refreshes.
    pub fn with_read_cursors(mut self, cursors: Arc<dyn ReadCursorStore>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    /// Load through `cache` under `key` and keep that entry warm.
    pub fn with_cache(mut self, cache: QueryCache, key: impl Into<String>, options: CacheOptions) -> Self {
        self.cache = Some(CacheBinding {
            cache,
            key: key.into(),
            options,
        });
        self
    }

    pub fn with_guard(mut self, guard: MutationGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Push topic to follow. Defaults to the item table filtered by
    /// collection.
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Load and go live. A failed initial load leaves the collection
    /// `Stale` with the error in its view; polling keeps retrying.
    ///
    /// An invalid [`SyncConfig`] is logged, not rejected; the refresh loop
    /// raises a too-short poll interval to its minimum.
    pub async fn start(self) -> LiveCollection<I> {
        if let Err(e) = self.config.validate() {
            tracing::warn!(
                collection_id = %self.collection_id,
                error = %e,
                "Invalid sync config"
            );
        }
        let tasks = self
            .tasks
            .or_else(|| self.cache.as_ref().map(|b| b.cache.tasks().clone()))
            .unwrap_or_default();
        let guard = self
            .guard
            .unwrap_or_else(|| MutationGuard::with_tasks(tasks.clone()));
        let query = CollectionQuery::new(self.collection_id)
            .with_order(self.order)
            .with_limit(self.config.page_limit);
        let (view_tx, view_rx) = watch::channel(CollectionView::idle());

        let inner = Arc::new(Inner {
            collection_id: self.collection_id,
            subject_id: self.subject_id,
            query,
            source: self.source,
            writer: self.writer,
            cursors: self.cursors,
            cache: self.cache,
            guard,
            tasks,
            state: Mutex::new(SyncState {
                reconciler: Reconciler::new(self.order),
                status: CollectionStatus::Idle,
                last_error: None,
            }),
            view_tx,
            closed: AtomicBool::new(false),
            last_cursor: Mutex::new(None),
        });

        // Subscribe before loading so changes made during the load still
        // trigger a refetch afterwards.
        let topic = self
            .topic
            .unwrap_or_else(|| Topic::collection(I::table(), self.collection_id));
        let events: BoxStream<'static, ChangeEvent> = match &self.push {
            Some(feed) => feed.subscribe(&topic),
            None => stream::pending().boxed(),
        };

        if let Err(e) = Inner::load(&inner).await {
            tracing::warn!(
                collection_id = %self.collection_id,
                error = %e,
                "Initial load failed; polling will retry"
            );
        }

        let metrics = Arc::new(TriggerMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let refresh_loop = tokio::spawn(run_refresh_loop(
            Arc::clone(&inner) as Arc<dyn Refresh>,
            events,
            Some(self.collection_id),
            TriggerConfig::from(&self.config),
            Arc::clone(&metrics),
            shutdown_rx,
        ));

        tracing::info!(
            collection_id = %self.collection_id,
            table = I::table().as_str(),
            topic = %topic,
            push = self.push.is_some(),
            "Live collection started"
        );

        LiveCollection {
            inner,
            view_rx,
            shutdown_tx,
            refresh_loop,
            metrics,
        }
    }

    /// Like [`start`](Self::start), but an invalid [`SyncConfig`] is
    /// returned as a config error before anything is fetched, and a failed
    /// initial load closes the collection and returns
    /// [`CollectionError::LoadFailed`].
    pub async fn open(self) -> LodgeResult<LiveCollection<I>> {
        self.config.validate()?;
        let collection_id = self.collection_id;
        let collection = self.start().await;
        let view = collection.view();
        if view.status == CollectionStatus::Live {
            return Ok(collection);
        }
        collection.close();
        let source = view.last_error.unwrap_or_else(|| FetchError::Transport {
            reason: "initial load did not complete".to_string(),
        });
        Err(CollectionError::LoadFailed {
            collection_id,
            source,
        }
        .into())
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct SyncState<I> {
    reconciler: Reconciler<I>,
    status: CollectionStatus,
    last_error: Option<FetchError>,
}

struct Inner<I: CollectionItem> {
    collection_id: CollectionId,
    subject_id: SubjectId,
    query: CollectionQuery,
    source: Arc<dyn CollectionSource<I>>,
    writer: Option<Arc<dyn ItemWriter<I>>>,
    cursors: Option<Arc<dyn ReadCursorStore>>,
    cache: Option<CacheBinding>,
    guard: MutationGuard,
    tasks: BackgroundTasks,
    state: Mutex<SyncState<I>>,
    view_tx: watch::Sender<CollectionView<I>>,
    closed: AtomicBool,
    /// Last instant a cursor advance was issued for.
    last_cursor: Mutex<Option<Timestamp>>,
}

impl<I: CollectionItem> Inner<I> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish the current state. Callers hold the state lock, which keeps
    /// publications in mutation order.
    fn publish(&self, state: &SyncState<I>) {
        if self.is_closed() {
            return;
        }
        self.view_tx.send_replace(CollectionView {
            items: state.reconciler.view(),
            status: state.status,
            last_error: state.last_error.clone(),
            version: state.reconciler.version(),
        });
    }

    /// Initial load. Goes through the cache when one is bound.
    async fn load(this: &Arc<Self>) -> Result<(), FetchError> {
        let (ticket, refresh_ticket) = {
            let mut state = lock(&this.state);
            state.status = CollectionStatus::Loading;
            this.publish(&state);
            (state.reconciler.begin_fetch(), state.reconciler.begin_fetch())
        };

        let result = match &this.cache {
            Some(binding) => {
                let source = Arc::clone(&this.source);
                let query = this.query.clone();
                let weak = Arc::downgrade(this);
                binding
                    .cache
                    .get_with_update(
                        &binding.key,
                        move || async move { source.fetch(&query).await },
                        binding.options,
                        move |items: Vec<I>| Self::apply_revalidated(&weak, refresh_ticket, items),
                    )
                    .await
                    .map_err(|e| match e {
                        LodgeError::Fetch(e) => e,
                        other => FetchError::Decode {
                            resource: binding.key.clone(),
                            reason: other.to_string(),
                        },
                    })
            }
            None => this.source.fetch(&this.query).await,
        };

        match result {
            Ok(items) => {
                {
                    let mut state = lock(&this.state);
                    if this.is_closed() {
                        return Ok(());
                    }
                    state.reconciler.apply_snapshot(ticket, items);
                    state.status = CollectionStatus::Live;
                    state.last_error = None;
                    this.publish(&state);
                }
                tracing::debug!(collection_id = %this.collection_id, "Initial load applied");
                this.advance_cursor();
                Ok(())
            }
            Err(e) => {
                let mut state = lock(&this.state);
                state.status = CollectionStatus::Stale;
                state.last_error = Some(e.clone());
                this.publish(&state);
                Err(e)
            }
        }
    }

    /// Apply the result of a background cache refresh started by `load`.
    fn apply_revalidated(weak: &Weak<Self>, ticket: Ticket, items: Vec<I>) {
        let Some(this) = weak.upgrade() else {
            return;
        };
        let mut state = lock(&this.state);
        if this.is_closed() {
            return;
        }
        let outcome = state.reconciler.apply_snapshot(ticket, items);
        tracing::debug!(
            collection_id = %this.collection_id,
            outcome = ?outcome,
            "Revalidated snapshot received"
        );
        if outcome == SnapshotOutcome::Applied {
            state.status = CollectionStatus::Live;
            state.last_error = None;
            this.publish(&state);
        }
    }

    /// Refetch the whole collection and replace the confirmed items.
    async fn refetch(&self, cause: RefreshCause) -> Result<SnapshotOutcome, FetchError> {
        if self.is_closed() {
            return Ok(SnapshotOutcome::Outdated);
        }
        let ticket = lock(&self.state).reconciler.begin_fetch();

        let items = match self.source.fetch(&self.query).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(
                    collection_id = %self.collection_id,
                    cause = cause.as_str(),
                    error = %e,
                    "Refetch failed; keeping last good data"
                );
                let mut state = lock(&self.state);
                if !self.is_closed() {
                    if state.status == CollectionStatus::Live {
                        state.status = CollectionStatus::Stale;
                    }
                    state.last_error = Some(e.clone());
                    self.publish(&state);
                }
                return Err(e);
            }
        };

        let write_back = self.cache.as_ref().map(|_| items.clone());
        let outcome = {
            let mut state = lock(&self.state);
            if self.is_closed() {
                None
            } else {
                let outcome = state.reconciler.apply_snapshot(ticket, items);
                let recovered = state.status != CollectionStatus::Live;
                if outcome != SnapshotOutcome::Outdated {
                    state.status = CollectionStatus::Live;
                    state.last_error = None;
                }
                if outcome == SnapshotOutcome::Applied || (recovered && outcome != SnapshotOutcome::Outdated) {
                    self.publish(&state);
                }
                Some(outcome)
            }
        };

        // A closed collection still warms the cache.
        if outcome != Some(SnapshotOutcome::Outdated) {
            if let (Some(binding), Some(items)) = (&self.cache, write_back) {
                binding.cache.insert(&binding.key, items, binding.options.ttl);
            }
        }

        tracing::debug!(
            collection_id = %self.collection_id,
            cause = cause.as_str(),
            ticket,
            outcome = ?outcome,
            "Refetch completed"
        );

        match outcome {
            Some(outcome) => {
                if cause == RefreshCause::Push {
                    self.advance_cursor();
                }
                Ok(outcome)
            }
            None => Ok(SnapshotOutcome::Outdated),
        }
    }

    /// Fire-and-forget read cursor advance to now, never behind the last
    /// advance issued from here.
    fn advance_cursor(&self) {
        let Some(store) = &self.cursors else {
            return;
        };
        let at = {
            let mut last = lock(&self.last_cursor);
            let now = Utc::now();
            let at = last.map_or(now, |prev| prev.max(now));
            *last = Some(at);
            at
        };

        let store = Arc::clone(store);
        let (subject_id, collection_id) = (self.subject_id, self.collection_id);
        let spawned = self.tasks.spawn(async move {
            if let Err(e) = store.advance(subject_id, collection_id, at).await {
                tracing::warn!(
                    subject_id = %subject_id,
                    collection_id = %collection_id,
                    error = %e,
                    "Read cursor advance failed"
                );
            }
        });
        if !spawned {
            tracing::debug!(collection_id = %collection_id, "Task set closed; cursor not advanced");
        }
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = lock(&self.state);
        state.status = CollectionStatus::Closed;
        self.view_tx.send_modify(|view| view.status = CollectionStatus::Closed);
        true
    }
}

#[async_trait]
impl<I: CollectionItem> Refresh for Inner<I> {
    async fn refresh(&self, cause: RefreshCause) {
        // Failures are logged and shown in the view.
        let _ = self.refetch(cause).await;
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// A synchronized collection. Dropping the handle closes it.
pub struct LiveCollection<I: CollectionItem> {
    inner: Arc<Inner<I>>,
    view_rx: watch::Receiver<CollectionView<I>>,
    shutdown_tx: watch::Sender<bool>,
    refresh_loop: JoinHandle<()>,
    metrics: Arc<TriggerMetrics>,
}

impl<I: CollectionItem> LiveCollection<I> {
    pub fn builder(
        collection_id: CollectionId,
        subject_id: SubjectId,
        source: Arc<dyn CollectionSource<I>>,
    ) -> LiveCollectionBuilder<I> {
        LiveCollectionBuilder {
            collection_id,
            subject_id,
            source,
            writer: None,
            push: None,
            cursors: None,
            cache: None,
            guard: None,
            tasks: None,
            config: SyncConfig::default(),
            order: SortOrder::default(),
            topic: None,
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.inner.collection_id
    }

    /// Receiver for every published view.
    pub fn subscribe(&self) -> watch::Receiver<CollectionView<I>> {
        self.view_rx.clone()
    }

    pub fn view(&self) -> CollectionView<I> {
        self.view_rx.borrow().clone()
    }

    pub fn items(&self) -> Vec<I> {
        self.view_rx
            .borrow()
            .items
            .iter()
            .map(|v| v.item.clone())
            .collect()
    }

    pub fn status(&self) -> CollectionStatus {
        self.view_rx.borrow().status
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn sync_stats(&self) -> TriggerSnapshot {
        self.metrics.snapshot()
    }

    /// Whether a create with this idempotency key is still pending here.
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.inner.state).reconciler.is_pending(key)
    }

    /// Refetch now (pull-to-refresh).
    pub async fn refresh(&self) -> LodgeResult<()> {
        if self.is_closed() {
            return Err(CollectionError::Closed {
                collection_id: self.inner.collection_id,
            }
            .into());
        }
        self.inner.refetch(RefreshCause::Manual).await?;
        Ok(())
    }

    /// Create an item optimistically.
    ///
    /// The item is shown as pending at once. A concurrent create of the
    /// same draft shares one write. On success the canonical item is
    /// returned and the pending copy is promoted in place; on failure the
    /// pending copy is removed and the error returned.
    pub async fn create(&self, draft: I::Draft) -> LodgeResult<I> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(CollectionError::Closed {
                collection_id: inner.collection_id,
            }
            .into());
        }
        I::validate_draft(&draft)?;
        let operation = I::table().as_str();
        let Some(writer) = inner.writer.clone() else {
            return Err(MutationError::Rejected {
                operation: operation.to_string(),
                reason: "collection is read-only".to_string(),
            }
            .into());
        };

        let key = I::idempotency_key(inner.collection_id, &draft);
        let optimistic = I::optimistic(
            &draft,
            &OptimisticContext {
                temp_id: ItemId::temporary(),
                collection_id: inner.collection_id,
                author_id: inner.subject_id,
                created_at: Utc::now(),
            },
        );
        let inserted = {
            let mut state = lock(&inner.state);
            let inserted = state.reconciler.insert_pending(key.clone(), optimistic.clone());
            if inserted {
                inner.publish(&state);
            }
            inserted
        };

        let (collection_id, author_id) = (inner.collection_id, inner.subject_id);
        let outcome = inner
            .guard
            .run(key.clone(), move || async move {
                writer
                    .create(collection_id, author_id, &draft)
                    .await?
                    .require(operation)
            })
            .await;

        match outcome {
            Ok(canonical) => {
                if inserted {
                    let mut state = lock(&inner.state);
                    state.reconciler.confirm(&key, canonical);
                    inner.publish(&state);
                }
                if let Some(binding) = &inner.cache {
                    binding.cache.invalidate(&binding.key);
                }
                tracing::debug!(
                    collection_id = %collection_id,
                    item_id = %canonical,
                    "Create confirmed"
                );
                Ok(optimistic.with_item_id(canonical))
            }
            Err(e) => {
                if inserted {
                    let mut state = lock(&inner.state);
                    state.reconciler.rollback(&key);
                    inner.publish(&state);
                }
                tracing::warn!(
                    collection_id = %collection_id,
                    key = %key,
                    error = %e,
                    "Create failed; pending item removed"
                );
                Err(e.into())
            }
        }
    }

    /// Stop push and poll refreshes. Later fetch results never reach the
    /// view. Idempotent.
    pub fn close(&self) {
        if self.inner.close() {
            self.shutdown_tx.send_replace(true);
            tracing::info!(collection_id = %self.inner.collection_id, "Live collection closed");
        }
    }
}

impl LiveCollection<Membership> {
    /// Whether `subject_id` is shown as a member, pending joins included.
    pub fn is_member(&self, subject_id: SubjectId) -> bool {
        self.view_rx
            .borrow()
            .items
            .iter()
            .any(|v| v.item.subject_id == subject_id)
    }
}

impl<I: CollectionItem> Drop for LiveCollection<I> {
    fn drop(&mut self) {
        self.close();
        self.refresh_loop.abort();
    }
}

impl<I: CollectionItem> std::fmt::Debug for LiveCollection<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view_rx.borrow();
        f.debug_struct("LiveCollection")
            .field("collection_id", &self.inner.collection_id)
            .field("status", &view.status)
            .field("items", &view.items.len())
            .field("version", &view.version)
            .finish()
    }
}
