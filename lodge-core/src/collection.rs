//! Collection item contract and optimistic state.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::event::Table;
use crate::{CollectionId, ItemId, MutationError, SubjectId, Timestamp};

/// Lifecycle of a locally created item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimisticState {
    /// Written locally, waiting for the server to return a canonical id.
    Pending,
    /// Server-acknowledged (or fetched from the server).
    Confirmed,
    /// The write was rejected; the item is about to be removed.
    Failed,
}

/// Values available when building the optimistic copy of a draft.
#[derive(Debug, Clone, Copy)]
pub struct OptimisticContext {
    pub temp_id: ItemId,
    pub collection_id: CollectionId,
    pub author_id: SubjectId,
    pub created_at: Timestamp,
}

/// How a refetched snapshot is compared with the one on display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    /// Unchanged when length and last identity match. Suited to
    /// append-only collections such as chat threads.
    Tail,
    /// Unchanged only when every item compares equal.
    #[default]
    Exact,
}

impl ChangeDetection {
    pub fn is_unchanged<I: CollectionItem>(&self, current: &[I], next: &[I]) -> bool {
        match self {
            ChangeDetection::Tail => {
                current.len() == next.len()
                    && current.last().map(I::item_id) == next.last().map(I::item_id)
            }
            ChangeDetection::Exact => current == next,
        }
    }
}

/// An item type that can live in a synchronized collection.
///
/// Implementations must keep `item_id` stable once persisted; the
/// synchronizer never matches items by position.
pub trait CollectionItem: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Payload a user submits to create a new item.
    type Draft: Clone + Debug + Send + Sync + 'static;

    /// Table whose change feed drives refetches of this collection.
    fn table() -> Table;

    fn item_id(&self) -> ItemId;

    fn created_at(&self) -> Timestamp;

    /// Author or owner of the item.
    fn subject_id(&self) -> SubjectId;

    /// Return the same item under a different identity.
    fn with_item_id(self, id: ItemId) -> Self;

    /// Build the transient representation shown while a create is pending.
    fn optimistic(draft: &Self::Draft, ctx: &OptimisticContext) -> Self;

    /// Idempotency key used to collapse repeated submissions of `draft`.
    fn idempotency_key(collection_id: CollectionId, draft: &Self::Draft) -> String;

    /// Key of the write that produced this row. For any draft `d`, the
    /// item built by `optimistic(d, ctx)` (and its persisted copy) must
    /// return `idempotency_key(ctx.collection_id, d)`, so a fetched row
    /// can be matched to a create whose ack has not arrived yet.
    fn logical_key(&self) -> String;

    /// Reject drafts that must never reach the backend.
    fn validate_draft(_draft: &Self::Draft) -> Result<(), MutationError> {
        Ok(())
    }

    fn change_detection() -> ChangeDetection {
        ChangeDetection::Exact
    }
}

/// An item as displayed, tagged with its optimistic state.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewItem<I> {
    pub item: I,
    pub state: OptimisticState,
}

impl<I: CollectionItem> ViewItem<I> {
    pub fn confirmed(item: I) -> Self {
        Self {
            item,
            state: OptimisticState::Confirmed,
        }
    }

    pub fn pending(item: I) -> Self {
        Self {
            item,
            state: OptimisticState::Pending,
        }
    }

    pub fn id(&self) -> ItemId {
        self.item.item_id()
    }

    pub fn is_pending(&self) -> bool {
        self.state == OptimisticState::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Full-collection query issued on load and on every refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionQuery {
    pub collection_id: CollectionId,
    /// Ordering on creation time.
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl CollectionQuery {
    pub fn new(collection_id: CollectionId) -> Self {
        Self {
            collection_id,
            order: SortOrder::default(),
            limit: None,
        }
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Server acknowledgment of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub canonical_id: Option<ItemId>,
}

impl WriteAck {
    pub fn persisted(id: ItemId) -> Self {
        Self {
            canonical_id: Some(id),
        }
    }

    pub fn empty() -> Self {
        Self { canonical_id: None }
    }

    /// Resolve the canonical id, treating a silent no-op as a failure.
    pub fn require(self, operation: &str) -> Result<ItemId, MutationError> {
        self.canonical_id.ok_or_else(|| MutationError::NotPersisted {
            operation: operation.to_string(),
        })
    }
}
