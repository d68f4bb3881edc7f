//! Collaborator traits implemented by the hosting application.
//!
//! The core never talks to a network directly. It drives these traits and
//! treats every implementation as remote: calls may be slow, fail, or
//! (for the push feed) go silent without notice.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::collection::{CollectionItem, CollectionQuery, WriteAck};
use crate::event::{ChangeEvent, Topic};
use crate::models::{ActivityRow, BookingDraft, PendingRow, ReadCursor};
use crate::{CollectionId, FetchError, ItemId, MutationError, SubjectId, Timestamp};

/// Full-collection reads.
#[async_trait]
pub trait CollectionSource<I: CollectionItem>: Send + Sync {
    /// Fetch the collection ordered by creation time, honoring the limit.
    async fn fetch(&self, query: &CollectionQuery) -> Result<Vec<I>, FetchError>;
}

/// Item creation.
#[async_trait]
pub trait ItemWriter<I: CollectionItem>: Send + Sync {
    /// Persist a new item. The acknowledgment must carry the canonical id.
    async fn create(
        &self,
        collection_id: CollectionId,
        author_id: SubjectId,
        draft: &I::Draft,
    ) -> Result<WriteAck, MutationError>;
}

/// Row-level change notifications.
pub trait PushFeed: Send + Sync {
    /// Subscribe to a topic. Dropping the returned stream unsubscribes.
    fn subscribe(&self, topic: &Topic) -> BoxStream<'static, ChangeEvent>;
}

/// Per-subject read positions.
#[async_trait]
pub trait ReadCursorStore: Send + Sync {
    /// Move a cursor forward. Stores must never move a cursor backwards.
    async fn advance(
        &self,
        subject_id: SubjectId,
        collection_id: CollectionId,
        at: Timestamp,
    ) -> Result<(), MutationError>;

    async fn cursors_for(&self, subject_id: SubjectId) -> Result<Vec<ReadCursor>, FetchError>;
}

/// Batched query for unread counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityQuery {
    pub collections: Vec<CollectionId>,
    /// Only rows created strictly after this instant.
    pub since: Timestamp,
    /// Rows authored by this subject are excluded.
    pub exclude_author: SubjectId,
}

/// Aggregate reads backing the counters.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn activity_since(&self, query: &ActivityQuery) -> Result<Vec<ActivityRow>, FetchError>;

    /// Pending bookings and change requests across every location `owner` runs.
    async fn pending_requests(&self, owner: SubjectId) -> Result<Vec<PendingRow>, FetchError>;
}

/// Community writes issued through the mutation guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommunityCommand {
    Join {
        location_id: CollectionId,
        subject_id: SubjectId,
    },
    Leave {
        location_id: CollectionId,
        subject_id: SubjectId,
    },
    CancelBooking {
        booking_id: ItemId,
    },
    SubmitPayment {
        booking_id: ItemId,
        receipt_url: String,
    },
    CreateBooking {
        location_id: CollectionId,
        subject_id: SubjectId,
        draft: BookingDraft,
    },
    /// Owner accepts a pending booking.
    ConfirmBooking {
        booking_id: ItemId,
        owner_id: SubjectId,
        owner_note: Option<String>,
    },
    /// Owner declines a pending booking.
    RejectBooking {
        booking_id: ItemId,
        owner_id: SubjectId,
        owner_note: Option<String>,
    },
    /// Owner closes a confirmed booking after the stay.
    CompleteBooking {
        booking_id: ItemId,
        owner_id: SubjectId,
    },
}

impl CommunityCommand {
    /// Operation name used in errors and logs.
    pub fn operation(&self) -> &'static str {
        match self {
            CommunityCommand::Join { .. } => "join",
            CommunityCommand::Leave { .. } => "leave",
            CommunityCommand::CancelBooking { .. } => "cancel",
            CommunityCommand::SubmitPayment { .. } => "markpaid",
            CommunityCommand::CreateBooking { .. } => "book",
            CommunityCommand::ConfirmBooking { .. } => "confirm",
            CommunityCommand::RejectBooking { .. } => "reject",
            CommunityCommand::CompleteBooking { .. } => "complete",
        }
    }
}

#[async_trait]
pub trait CommunityBackend: Send + Sync {
    /// Apply a command. Commands that create rows acknowledge with the new id;
    /// the others acknowledge with the id of the row they touched when known.
    async fn execute(&self, command: CommunityCommand) -> Result<WriteAck, MutationError>;
}
