//! Identity types for LODGE entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash for deduplication of repeated writes.
pub type ContentHash = [u8; 32];

/// Common behaviour of the strongly-typed UUID identifiers.
pub trait EntityIdType: Copy + Eq + std::hash::Hash + fmt::Display {
    /// Wrap a raw UUID.
    fn new(id: Uuid) -> Self;

    /// Get the underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// Generate a new timestamp-sortable (UUIDv7) identifier.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            fn new(id: Uuid) -> Self {
                Self(id)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

entity_id!(
    /// Identity of a collection item (message, membership, booking).
    ///
    /// Canonical ids come from the server; temporary ids are generated
    /// locally with [`ItemId::temporary`] while a create is pending.
    ItemId
);

entity_id!(
    /// Identity of a collection (a location's chat thread, roster or booking list).
    CollectionId
);

entity_id!(
    /// Identity of a subject (the signed-in user or any other author).
    SubjectId
);

impl ItemId {
    /// Generate a local-only identity for an optimistic item.
    ///
    /// UUIDv4 keeps temporary ids out of the v7 space the server hands out.
    pub fn temporary() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}
