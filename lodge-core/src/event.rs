//! Change notifications delivered by the push feed.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CollectionId, ItemId, SubjectId};

/// Backing table of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Memberships,
    Bookings,
    ChangeRequests,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::Memberships => "memberships",
            Table::Bookings => "bookings",
            Table::ChangeRequests => "change_requests",
        }
    }
}

/// Row scope a topic is filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum TopicFilter {
    /// Every row of the table.
    All,
    /// Rows belonging to one collection.
    Collection(CollectionId),
    /// Rows owned by one subject.
    Subject(SubjectId),
}

/// Push subscription topic, e.g. `messages:<location>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub table: Table,
    pub filter: TopicFilter,
}

impl Topic {
    pub fn collection(table: Table, collection_id: CollectionId) -> Self {
        Self {
            table,
            filter: TopicFilter::Collection(collection_id),
        }
    }

    pub fn subject(table: Table, subject_id: SubjectId) -> Self {
        Self {
            table,
            filter: TopicFilter::Subject(subject_id),
        }
    }

    pub fn all(table: Table) -> Self {
        Self {
            table,
            filter: TopicFilter::All,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.filter {
            TopicFilter::All => write!(f, "{}", self.table.as_str()),
            TopicFilter::Collection(id) => write!(f, "{}:{}", self.table.as_str(), id),
            TopicFilter::Subject(id) => write!(f, "{}:subject:{}", self.table.as_str(), id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row-level change notification.
///
/// Delivery is best-effort: events may be dropped, reordered or arrive
/// after a reconnect. Consumers only use them as a trigger to refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub kind: ChangeKind,
    pub row_id: Option<ItemId>,
    /// Collection of the changed row, when the feed reports it.
    ///
    /// Delete notifications cannot be filtered server-side, so they arrive
    /// on table-wide topics and carry the old row's collection here.
    pub collection_id: Option<CollectionId>,
}

impl ChangeEvent {
    /// Whether this event can affect the given collection.
    ///
    /// Events without a collection id are treated as relevant.
    pub fn concerns(&self, collection_id: CollectionId) -> bool {
        self.collection_id.map_or(true, |id| id == collection_id)
    }
}
