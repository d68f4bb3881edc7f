//! LODGE Core - Entity Types and Contracts
//!
//! Identifiers, domain rows, the `CollectionItem` contract, the error
//! taxonomy, configuration and the collaborator traits every other crate
//! builds on. No runtime or I/O beyond reading a config file.

pub mod backend;
pub mod collection;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod models;

pub use backend::{
    ActivityQuery, ActivitySource, CollectionSource, CommunityBackend, CommunityCommand,
    ItemWriter, PushFeed, ReadCursorStore,
};
pub use collection::{
    ChangeDetection, CollectionItem, CollectionQuery, OptimisticContext, OptimisticState, SortOrder, ViewItem,
    WriteAck,
};
pub use config::{
    CacheConfig, CountersConfig, LodgeConfig, PollPolicy, SyncConfig, TelemetryConfig,
};
pub use error::{
    CacheError, CollectionError, ConfigError, FetchError, LodgeError, LodgeResult, MutationError,
};
pub use event::{ChangeEvent, ChangeKind, Table, Topic, TopicFilter};
pub use identity::{
    compute_content_hash, CollectionId, ContentHash, EntityIdType, ItemId, SubjectId, Timestamp,
};
pub use models::{
    ActivityRow, AuthorProfile, Booking, BookingDraft, BookingStatus, ChangeRequest,
    ChangeRequestStatus, Membership, MembershipDraft, Message, MessageDraft, PendingKind,
    PendingRow, ReadCursor,
};
