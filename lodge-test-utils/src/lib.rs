//! LODGE Test Utilities
//!
//! Centralized test infrastructure for the LODGE workspace:
//! - In-memory backend implementing every collaborator trait
//! - Proptest generators for domain rows
//! - Test fixtures for common scenarios

pub mod memory;

pub use memory::{CallCounters, CallSnapshot, Gate, InMemoryBackend, StoredItem};

// Re-export core types for convenience
pub use lodge_core::{
    ActivityRow, AuthorProfile, Booking, BookingDraft, BookingStatus, ChangeEvent, ChangeKind,
    ChangeRequest, ChangeRequestStatus, CollectionId, EntityIdType, ItemId, Membership, Message,
    MessageDraft, PendingKind, PendingRow, ReadCursor, SubjectId, Table, Timestamp, Topic,
};

use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating LODGE rows.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_collection_id() -> impl Strategy<Value = CollectionId> {
        arb_uuid().prop_map(CollectionId::new)
    }

    pub fn arb_subject_id() -> impl Strategy<Value = SubjectId> {
        arb_uuid().prop_map(SubjectId::new)
    }

    pub fn arb_item_id() -> impl Strategy<Value = ItemId> {
        arb_uuid().prop_map(ItemId::new)
    }

    /// Timestamp within one day, at minute resolution, so collisions with
    /// cursors are likely.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0u32..24, 0u32..60).prop_map(|(h, m)| fixtures::at(h, m))
    }

    pub fn arb_booking_status() -> impl Strategy<Value = BookingStatus> {
        prop_oneof![
            Just(BookingStatus::PendingPayment),
            Just(BookingStatus::PendingConfirmation),
            Just(BookingStatus::Confirmed),
            Just(BookingStatus::Rejected),
            Just(BookingStatus::Cancelled),
            Just(BookingStatus::Completed),
        ]
    }

    pub fn arb_change_request_status() -> impl Strategy<Value = ChangeRequestStatus> {
        prop_oneof![
            Just(ChangeRequestStatus::Pending),
            Just(ChangeRequestStatus::Approved),
            Just(ChangeRequestStatus::Rejected),
        ]
    }

    pub fn arb_pending_kind() -> impl Strategy<Value = PendingKind> {
        prop_oneof![
            arb_booking_status().prop_map(PendingKind::Booking),
            arb_change_request_status().prop_map(PendingKind::ChangeRequest),
        ]
    }

    /// Activity rows spread over `collections`, authored by `authors`.
    pub fn arb_activity_rows(
        collections: Vec<CollectionId>,
        authors: Vec<SubjectId>,
        max_rows: usize,
    ) -> impl Strategy<Value = Vec<ActivityRow>> {
        let pick_collection = proptest::sample::select(collections);
        let pick_author = proptest::sample::select(authors);
        proptest::collection::vec(
            (pick_collection, pick_author, arb_timestamp()).prop_map(
                |(collection_id, author_id, created_at)| ActivityRow {
                    collection_id,
                    author_id,
                    created_at,
                },
            ),
            0..max_rows,
        )
    }

    pub fn arb_pending_rows(
        locations: Vec<CollectionId>,
        max_rows: usize,
    ) -> impl Strategy<Value = Vec<PendingRow>> {
        proptest::collection::vec(
            (proptest::sample::select(locations), arb_pending_kind())
                .prop_map(|(location_id, kind)| PendingRow { location_id, kind }),
            0..max_rows,
        )
    }

    /// Message content, never blank after trimming.
    pub fn arb_message_content() -> impl Strategy<Value = String> {
        "[a-z]{1,12}( [a-z]{1,12}){0,4}"
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built rows and configs for common scenarios.

    use super::*;
    use lodge_core::{LodgeConfig, PollPolicy};

    /// Timestamp at `h:m` UTC on a fixed day.
    pub fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 15, h, m, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn message(
        collection_id: CollectionId,
        author_id: SubjectId,
        content: &str,
        created_at: Timestamp,
    ) -> Message {
        Message {
            id: ItemId::now_v7(),
            collection_id,
            author_id,
            content: content.to_string(),
            created_at,
            author: AuthorProfile {
                username: format!("user-{}", &author_id.to_string()[..8]),
                display_name: None,
                avatar_url: None,
            },
        }
    }

    pub fn membership(
        collection_id: CollectionId,
        subject_id: SubjectId,
        last_read_at: Timestamp,
    ) -> Membership {
        Membership {
            id: ItemId::now_v7(),
            collection_id,
            subject_id,
            joined_at: last_read_at,
            last_read_at,
            profile: AuthorProfile::default(),
        }
    }

    pub fn booking_draft(check_in_day: u32, nights: u32) -> BookingDraft {
        let check_in = NaiveDate::from_ymd_opt(2026, 3, check_in_day)
            .unwrap_or(NaiveDate::MIN);
        BookingDraft {
            check_in,
            check_out: check_in + chrono::Days::new(nights as u64),
            guests: 2,
            total_price_cents: 9_000 * nights as i64,
        }
    }

    pub fn booking(location_id: CollectionId, subject_id: SubjectId, status: BookingStatus) -> Booking {
        let draft = booking_draft(10, 2);
        let now = Utc::now();
        Booking {
            id: ItemId::now_v7(),
            location_id,
            subject_id,
            check_in: draft.check_in,
            check_out: draft.check_out,
            guests: draft.guests,
            total_price_cents: draft.total_price_cents,
            status,
            owner_note: None,
            receipt_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn change_request(location_id: CollectionId, submitted_by: SubjectId, status: ChangeRequestStatus) -> ChangeRequest {
        ChangeRequest {
            id: ItemId::now_v7(),
            location_id,
            submitted_by,
            status,
            changes: serde_json::json!({ "name": "Renamed lodge" }),
            created_at: Utc::now(),
        }
    }

    /// Default config with short intervals for paused-time tests.
    pub fn fast_config() -> LodgeConfig {
        let mut config = LodgeConfig::default();
        config.sync.poll_interval_ms = 1_000;
        config.sync.push_debounce_ms = 100;
        config.sync.poll_policy = PollPolicy::Always;
        config.counters.refresh_interval_ms = 1_000;
        config.counters.debounce_ms = 100;
        config
    }
}

// ============================================================================
// TESTS
// ============================================================================
