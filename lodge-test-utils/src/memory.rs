//! In-memory backend implementing every collaborator trait.
//!
//! Rows live in plain vectors behind mutexes. Every trait call is counted,
//! can be made to fail, and can be held at a gate so tests can interleave
//! fetches, writes and push events deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use lodge_core::{
    ActivityQuery, ActivityRow, ActivitySource, Booking, BookingStatus, ChangeEvent, ChangeKind,
    ChangeRequest, CollectionId, CollectionItem, CollectionQuery, CollectionSource,
    CommunityBackend, CommunityCommand, EntityIdType, FetchError, ItemId, ItemWriter, Membership,
    MembershipDraft, Message, MutationError, OptimisticContext, PendingRow, PushFeed, ReadCursor,
    ReadCursorStore, SortOrder, SubjectId, Timestamp, Topic, TopicFilter, WriteAck,
};
use tokio::sync::{broadcast, Semaphore};
use tokio_stream::wrappers::BroadcastStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// CALL COUNTERS AND FAULTS
// ============================================================================

/// Number of calls per trait method.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub fetches: AtomicUsize,
    pub creates: AtomicUsize,
    pub subscriptions: AtomicUsize,
    pub cursor_advances: AtomicUsize,
    pub cursor_reads: AtomicUsize,
    pub activity_queries: AtomicUsize,
    pub pending_queries: AtomicUsize,
    pub commands: AtomicUsize,
}

impl CallCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            fetches: self.fetches.load(Ordering::SeqCst),
            creates: self.creates.load(Ordering::SeqCst),
            subscriptions: self.subscriptions.load(Ordering::SeqCst),
            cursor_advances: self.cursor_advances.load(Ordering::SeqCst),
            cursor_reads: self.cursor_reads.load(Ordering::SeqCst),
            activity_queries: self.activity_queries.load(Ordering::SeqCst),
            pending_queries: self.pending_queries.load(Ordering::SeqCst),
            commands: self.commands.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`CallCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub fetches: usize,
    pub creates: usize,
    pub subscriptions: usize,
    pub cursor_advances: usize,
    pub cursor_reads: usize,
    pub activity_queries: usize,
    pub pending_queries: usize,
    pub commands: usize,
}

#[derive(Debug, Default)]
struct Faults {
    failing_fetches: AtomicUsize,
    failing_writes: AtomicUsize,
    fail_cursor_advances: AtomicBool,
    ack_without_id: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Holds calls until released.
#[derive(Debug, Default)]
pub struct Gate {
    semaphore: Mutex<Option<Arc<Semaphore>>>,
}

impl Gate {
    /// Hold every subsequent call until released.
    pub fn close(&self) {
        *lock(&self.semaphore) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held (or future) calls through.
    pub fn release(&self, n: usize) {
        if let Some(semaphore) = lock(&self.semaphore).as_ref() {
            semaphore.add_permits(n);
        }
    }

    /// Let everything through from now on.
    pub fn open(&self) {
        if let Some(semaphore) = lock(&self.semaphore).take() {
            semaphore.close();
        }
    }

    async fn pass(&self) {
        let semaphore = lock(&self.semaphore).clone();
        if let Some(semaphore) = semaphore {
            if let Ok(permit) = semaphore.acquire().await {
                permit.forget();
            }
        }
    }
}

// ============================================================================
// STORED ROW TYPES
// ============================================================================

/// Item types the in-memory backend can store.
pub trait StoredItem: CollectionItem {
    fn rows(backend: &InMemoryBackend) -> &Mutex<Vec<Self>>;

    fn collection_of(&self) -> CollectionId;
}

impl StoredItem for Message {
    fn rows(backend: &InMemoryBackend) -> &Mutex<Vec<Self>> {
        &backend.messages
    }

    fn collection_of(&self) -> CollectionId {
        self.collection_id
    }
}

impl StoredItem for Membership {
    fn rows(backend: &InMemoryBackend) -> &Mutex<Vec<Self>> {
        &backend.memberships
    }

    fn collection_of(&self) -> CollectionId {
        self.collection_id
    }
}

impl StoredItem for Booking {
    fn rows(backend: &InMemoryBackend) -> &Mutex<Vec<Self>> {
        &backend.bookings
    }

    fn collection_of(&self) -> CollectionId {
        self.location_id
    }
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct InMemoryBackend {
    messages: Mutex<Vec<Message>>,
    memberships: Mutex<Vec<Membership>>,
    bookings: Mutex<Vec<Booking>>,
    change_requests: Mutex<Vec<ChangeRequest>>,
    owners: Mutex<HashMap<CollectionId, SubjectId>>,
    events: broadcast::Sender<ChangeEvent>,
    latency: Mutex<Duration>,
    faults: Faults,
    calls: CallCounters,
    pub fetch_gate: Gate,
    pub write_gate: Gate,
    /// Holds create acks after the row is stored and announced.
    pub ack_gate: Gate,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            messages: Mutex::new(Vec::new()),
            memberships: Mutex::new(Vec::new()),
            bookings: Mutex::new(Vec::new()),
            change_requests: Mutex::new(Vec::new()),
            owners: Mutex::new(HashMap::new()),
            events,
            latency: Mutex::new(Duration::ZERO),
            faults: Faults::default(),
            calls: CallCounters::default(),
            fetch_gate: Gate::default(),
            write_gate: Gate::default(),
            ack_gate: Gate::default(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // === Fault injection ===

    /// Make the next `n` fetches (collections, cursors, activity) fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.faults.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes (creates and commands) fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_cursor_advances(&self, fail: bool) {
        self.faults.fail_cursor_advances.store(fail, Ordering::SeqCst);
    }

    /// Acknowledge creates without a canonical id and without storing.
    pub fn ack_without_id(&self, enabled: bool) {
        self.faults.ack_without_id.store(enabled, Ordering::SeqCst);
    }

    /// Simulated round-trip latency for every call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn calls(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    // === Seeding and inspection ===

    /// Store a row without notifying subscribers.
    pub fn seed<I: StoredItem>(&self, item: I) {
        lock(I::rows(self)).push(item);
    }

    /// Store a row written by someone else and notify subscribers.
    pub fn publish<I: StoredItem>(&self, item: I) {
        let event = row_event::<I>(ChangeKind::Insert, item.item_id(), item.collection_of());
        lock(I::rows(self)).push(item);
        self.emit(event);
    }

    /// Replace a stored row by id and notify subscribers.
    pub fn update<I: StoredItem>(&self, item: I) -> bool {
        let id = item.item_id();
        let collection_id = item.collection_of();
        let replaced = {
            let mut rows = lock(I::rows(self));
            match rows.iter_mut().find(|r| r.item_id() == id) {
                Some(row) => {
                    *row = item;
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.emit(row_event::<I>(ChangeKind::Update, id, collection_id));
        }
        replaced
    }

    /// Delete a row by id. Deletes are announced on the table-wide topic.
    pub fn delete<I: StoredItem>(&self, id: ItemId) -> bool {
        let removed = {
            let mut rows = lock(I::rows(self));
            let position = rows.iter().position(|r| r.item_id() == id);
            position.map(|pos| rows.remove(pos))
        };
        match removed {
            Some(row) => {
                self.emit(ChangeEvent {
                    topic: Topic::all(I::table()),
                    kind: ChangeKind::Delete,
                    row_id: Some(id),
                    collection_id: Some(row.collection_of()),
                });
                true
            }
            None => false,
        }
    }

    /// Rows of one collection in insertion order.
    pub fn rows_of<I: StoredItem>(&self, collection_id: CollectionId) -> Vec<I> {
        lock(I::rows(self))
            .iter()
            .filter(|r| r.collection_of() == collection_id)
            .cloned()
            .collect()
    }

    pub fn seed_change_request(&self, request: ChangeRequest) {
        lock(&self.change_requests).push(request);
    }

    pub fn set_owner(&self, location_id: CollectionId, owner: SubjectId) {
        lock(&self.owners).insert(location_id, owner);
    }

    pub fn booking(&self, id: ItemId) -> Option<Booking> {
        lock(&self.bookings).iter().find(|b| b.id == id).cloned()
    }

    pub fn is_member(&self, location_id: CollectionId, subject_id: SubjectId) -> bool {
        lock(&self.memberships)
            .iter()
            .any(|m| m.collection_id == location_id && m.subject_id == subject_id)
    }

    pub fn cursor(&self, subject_id: SubjectId, collection_id: CollectionId) -> Option<Timestamp> {
        lock(&self.memberships)
            .iter()
            .find(|m| m.subject_id == subject_id && m.collection_id == collection_id)
            .map(|m| m.last_read_at)
    }

    /// Send a raw change event to subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        // No receivers is fine: push delivery is best-effort.
        let _ = self.events.send(event);
    }

    /// Number of live push subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn before_read(&self) -> Result<(), FetchError> {
        self.fetch_gate.pass().await;
        self.simulate_latency().await;
        if Faults::take(&self.faults.failing_fetches) {
            return Err(FetchError::Transport {
                reason: "injected fetch failure".to_string(),
            });
        }
        Ok(())
    }

    async fn before_write(&self, operation: &str) -> Result<(), MutationError> {
        self.write_gate.pass().await;
        self.simulate_latency().await;
        if Faults::take(&self.faults.failing_writes) {
            return Err(MutationError::Rejected {
                operation: operation.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    fn apply_command(&self, command: CommunityCommand) -> Result<WriteAck, MutationError> {
        let operation = command.operation();
        let rejected = |reason: &str| MutationError::Rejected {
            operation: operation.to_string(),
            reason: reason.to_string(),
        };

        match command {
            CommunityCommand::Join {
                location_id,
                subject_id,
            } => {
                if self.is_member(location_id, subject_id) {
                    return Err(rejected("already a member"));
                }
                let now = Utc::now();
                let membership = Membership::optimistic(
                    &MembershipDraft,
                    &OptimisticContext {
                        temp_id: ItemId::now_v7(),
                        collection_id: location_id,
                        author_id: subject_id,
                        created_at: now,
                    },
                );
                let id = membership.id;
                self.publish(membership);
                Ok(WriteAck::persisted(id))
            }
            CommunityCommand::Leave {
                location_id,
                subject_id,
            } => {
                let id = lock(&self.memberships)
                    .iter()
                    .find(|m| m.collection_id == location_id && m.subject_id == subject_id)
                    .map(|m| m.id)
                    .ok_or_else(|| rejected("not a member"))?;
                self.delete::<Membership>(id);
                Ok(WriteAck::persisted(id))
            }
            CommunityCommand::CancelBooking { booking_id } => {
                let mut booking = self.booking(booking_id).ok_or_else(|| rejected("no such booking"))?;
                if !booking.status.is_pending() {
                    return Err(rejected("only pending bookings can be cancelled"));
                }
                booking.status = BookingStatus::Cancelled;
                booking.updated_at = Utc::now();
                self.update(booking);
                Ok(WriteAck::persisted(booking_id))
            }
            CommunityCommand::SubmitPayment {
                booking_id,
                receipt_url,
            } => {
                let mut booking = self.booking(booking_id).ok_or_else(|| rejected("no such booking"))?;
                if booking.status != BookingStatus::PendingPayment {
                    return Err(rejected("booking is not awaiting payment"));
                }
                booking.status = BookingStatus::PendingConfirmation;
                booking.receipt_url = Some(receipt_url);
                booking.updated_at = Utc::now();
                self.update(booking);
                Ok(WriteAck::persisted(booking_id))
            }
            CommunityCommand::CreateBooking {
                location_id,
                subject_id,
                draft,
            } => {
                let booking = Booking::optimistic(
                    &draft,
                    &OptimisticContext {
                        temp_id: ItemId::now_v7(),
                        collection_id: location_id,
                        author_id: subject_id,
                        created_at: Utc::now(),
                    },
                );
                let id = booking.id;
                self.publish(booking);
                Ok(WriteAck::persisted(id))
            }
            CommunityCommand::ConfirmBooking {
                booking_id,
                owner_id,
                owner_note,
            } => {
                let mut booking = self.owned_booking(booking_id, owner_id).map_err(rejected)?;
                if !booking.status.is_pending() {
                    return Err(rejected("only pending bookings can be confirmed"));
                }
                booking.status = BookingStatus::Confirmed;
                booking.owner_note = owner_note;
                booking.updated_at = Utc::now();
                self.update(booking);
                Ok(WriteAck::persisted(booking_id))
            }
            CommunityCommand::RejectBooking {
                booking_id,
                owner_id,
                owner_note,
            } => {
                let mut booking = self.owned_booking(booking_id, owner_id).map_err(rejected)?;
                if !booking.status.is_pending() {
                    return Err(rejected("only pending bookings can be rejected"));
                }
                booking.status = BookingStatus::Rejected;
                booking.owner_note = owner_note;
                booking.updated_at = Utc::now();
                self.update(booking);
                Ok(WriteAck::persisted(booking_id))
            }
            CommunityCommand::CompleteBooking { booking_id, owner_id } => {
                let mut booking = self.owned_booking(booking_id, owner_id).map_err(rejected)?;
                if booking.status != BookingStatus::Confirmed {
                    return Err(rejected("only confirmed bookings can be completed"));
                }
                booking.status = BookingStatus::Completed;
                booking.updated_at = Utc::now();
                self.update(booking);
                Ok(WriteAck::persisted(booking_id))
            }
        }
    }

    /// A booking at a location run by `owner_id`.
    fn owned_booking(&self, booking_id: ItemId, owner_id: SubjectId) -> Result<Booking, &'static str> {
        let booking = self.booking(booking_id).ok_or("no such booking")?;
        if lock(&self.owners).get(&booking.location_id) != Some(&owner_id) {
            return Err("not the location owner");
        }
        Ok(booking)
    }
}

fn row_event<I: CollectionItem>(kind: ChangeKind, id: ItemId, collection_id: CollectionId) -> ChangeEvent {
    ChangeEvent {
        topic: Topic::collection(I::table(), collection_id),
        kind,
        row_id: Some(id),
        collection_id: Some(collection_id),
    }
}

/// Table-wide events reach every subscriber of the table; the receiver
/// filters them by collection.
fn topic_matches(subscription: &Topic, event: &ChangeEvent) -> bool {
    subscription.table == event.topic.table
        && (subscription.filter == TopicFilter::All
            || event.topic.filter == TopicFilter::All
            || subscription.filter == event.topic.filter)
}

// ============================================================================
// TRAIT IMPLEMENTATIONS
// ============================================================================

#[async_trait]
impl<I: StoredItem> CollectionSource<I> for InMemoryBackend {
    async fn fetch(&self, query: &CollectionQuery) -> Result<Vec<I>, FetchError> {
        CallCounters::bump(&self.calls.fetches);
        self.before_read().await?;

        let mut rows = self.rows_of::<I>(query.collection_id);
        rows.sort_by_key(|r| r.created_at());
        if query.order == SortOrder::NewestFirst {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[async_trait]
impl<I: StoredItem> ItemWriter<I> for InMemoryBackend {
    async fn create(
        &self,
        collection_id: CollectionId,
        author_id: SubjectId,
        draft: &I::Draft,
    ) -> Result<WriteAck, MutationError> {
        CallCounters::bump(&self.calls.creates);
        self.before_write(I::table().as_str()).await?;

        if self.faults.ack_without_id.load(Ordering::SeqCst) {
            return Ok(WriteAck::empty());
        }
        let item = I::optimistic(
            draft,
            &OptimisticContext {
                temp_id: ItemId::now_v7(),
                collection_id,
                author_id,
                created_at: Utc::now(),
            },
        );
        let id = item.item_id();
        self.publish(item);
        self.ack_gate.pass().await;
        Ok(WriteAck::persisted(id))
    }
}

impl PushFeed for InMemoryBackend {
    fn subscribe(&self, topic: &Topic) -> BoxStream<'static, ChangeEvent> {
        CallCounters::bump(&self.calls.subscriptions);
        let topic = *topic;
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |received| async move {
                // Lagged receivers skip missed events.
                match received {
                    Ok(event) if topic_matches(&topic, &event) => Some(event),
                    _ => None,
                }
            })
            .boxed()
    }
}

#[async_trait]
impl ReadCursorStore for InMemoryBackend {
    async fn advance(
        &self,
        subject_id: SubjectId,
        collection_id: CollectionId,
        at: Timestamp,
    ) -> Result<(), MutationError> {
        CallCounters::bump(&self.calls.cursor_advances);
        self.simulate_latency().await;
        if self.faults.fail_cursor_advances.load(Ordering::SeqCst) {
            return Err(MutationError::Rejected {
                operation: "advance_cursor".to_string(),
                reason: "injected cursor failure".to_string(),
            });
        }

        let mut memberships = lock(&self.memberships);
        if let Some(m) = memberships
            .iter_mut()
            .find(|m| m.subject_id == subject_id && m.collection_id == collection_id)
        {
            if at > m.last_read_at {
                m.last_read_at = at;
            }
        }
        Ok(())
    }

    async fn cursors_for(&self, subject_id: SubjectId) -> Result<Vec<ReadCursor>, FetchError> {
        CallCounters::bump(&self.calls.cursor_reads);
        self.before_read().await?;
        Ok(lock(&self.memberships)
            .iter()
            .filter(|m| m.subject_id == subject_id)
            .map(|m| ReadCursor::new(m.subject_id, m.collection_id, m.last_read_at))
            .collect())
    }
}

#[async_trait]
impl ActivitySource for InMemoryBackend {
    async fn activity_since(&self, query: &ActivityQuery) -> Result<Vec<ActivityRow>, FetchError> {
        CallCounters::bump(&self.calls.activity_queries);
        self.before_read().await?;
        Ok(lock(&self.messages)
            .iter()
            .filter(|m| query.collections.contains(&m.collection_id))
            .filter(|m| m.created_at > query.since && m.author_id != query.exclude_author)
            .map(|m| ActivityRow {
                collection_id: m.collection_id,
                author_id: m.author_id,
                created_at: m.created_at,
            })
            .collect())
    }

    async fn pending_requests(&self, owner: SubjectId) -> Result<Vec<PendingRow>, FetchError> {
        CallCounters::bump(&self.calls.pending_queries);
        self.before_read().await?;

        let owned: Vec<CollectionId> = lock(&self.owners)
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(location, _)| *location)
            .collect();

        let mut rows: Vec<PendingRow> = lock(&self.bookings)
            .iter()
            .filter_map(Booking::pending_row)
            .collect();
        rows.extend(
            lock(&self.change_requests)
                .iter()
                .filter_map(ChangeRequest::pending_row),
        );
        rows.retain(|row| owned.contains(&row.location_id));
        Ok(rows)
    }
}

#[async_trait]
impl CommunityBackend for InMemoryBackend {
    async fn execute(&self, command: CommunityCommand) -> Result<WriteAck, MutationError> {
        CallCounters::bump(&self.calls.commands);
        self.before_write(command.operation()).await?;
        self.apply_command(command)
    }
}

