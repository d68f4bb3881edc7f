//! Domain rows synchronized by the core: chat messages, memberships,
//! bookings, change requests and read cursors.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::collection::{ChangeDetection, CollectionItem, OptimisticContext};
use crate::event::Table;
use crate::{compute_content_hash, CollectionId, ItemId, MutationError, SubjectId, Timestamp};

// ============================================================================
// PROFILES
// ============================================================================

/// Public profile fields joined onto messages and memberships.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Chat message in a location's thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: ItemId,
    pub collection_id: CollectionId,
    pub author_id: SubjectId,
    pub content: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub author: AuthorProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub content: String,
}

impl MessageDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl CollectionItem for Message {
    type Draft = MessageDraft;

    fn table() -> Table {
        Table::Messages
    }

    fn item_id(&self) -> ItemId {
        self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn subject_id(&self) -> SubjectId {
        self.author_id
    }

    fn with_item_id(self, id: ItemId) -> Self {
        Self { id, ..self }
    }

    fn optimistic(draft: &MessageDraft, ctx: &OptimisticContext) -> Self {
        Self {
            id: ctx.temp_id,
            collection_id: ctx.collection_id,
            author_id: ctx.author_id,
            content: draft.content.trim().to_string(),
            created_at: ctx.created_at,
            author: AuthorProfile::default(),
        }
    }

    fn idempotency_key(collection_id: CollectionId, draft: &MessageDraft) -> String {
        let hash = compute_content_hash(draft.content.trim().as_bytes());
        format!("send:{}:{}", collection_id, hex::encode(hash))
    }

    fn logical_key(&self) -> String {
        let hash = compute_content_hash(self.content.trim().as_bytes());
        format!("send:{}:{}", self.collection_id, hex::encode(hash))
    }

    fn validate_draft(draft: &MessageDraft) -> Result<(), MutationError> {
        if draft.content.trim().is_empty() {
            return Err(MutationError::Validation {
                field: "content".to_string(),
                reason: "message must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn change_detection() -> ChangeDetection {
        ChangeDetection::Tail
    }
}

// ============================================================================
// MEMBERSHIPS
// ============================================================================

/// Membership of a subject in a location; also carries the read cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: ItemId,
    pub collection_id: CollectionId,
    pub subject_id: SubjectId,
    pub joined_at: Timestamp,
    pub last_read_at: Timestamp,
    #[serde(default)]
    pub profile: AuthorProfile,
}

/// Joining carries no payload beyond the collection and subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MembershipDraft;

impl CollectionItem for Membership {
    type Draft = MembershipDraft;

    fn table() -> Table {
        Table::Memberships
    }

    fn item_id(&self) -> ItemId {
        self.id
    }

    fn created_at(&self) -> Timestamp {
        self.joined_at
    }

    fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    fn with_item_id(self, id: ItemId) -> Self {
        Self { id, ..self }
    }

    fn optimistic(_draft: &MembershipDraft, ctx: &OptimisticContext) -> Self {
        Self {
            id: ctx.temp_id,
            collection_id: ctx.collection_id,
            subject_id: ctx.author_id,
            joined_at: ctx.created_at,
            last_read_at: ctx.created_at,
            profile: AuthorProfile::default(),
        }
    }

    fn idempotency_key(collection_id: CollectionId, _draft: &MembershipDraft) -> String {
        format!("join:{}", collection_id)
    }

    fn logical_key(&self) -> String {
        format!("join:{}", self.collection_id)
    }
}

// ============================================================================
// BOOKINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingPayment,
    PendingConfirmation,
    Confirmed,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Whether the booking still needs action from its owner or guest.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            BookingStatus::PendingPayment | BookingStatus::PendingConfirmation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: ItemId,
    pub location_id: CollectionId,
    pub subject_id: SubjectId,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub total_price_cents: i64,
    pub status: BookingStatus,
    pub owner_note: Option<String>,
    pub receipt_url: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub total_price_cents: i64,
}

impl Booking {
    /// Projection counted against the location's owner while the booking
    /// still awaits action.
    pub fn pending_row(&self) -> Option<PendingRow> {
        let kind = PendingKind::Booking(self.status);
        kind.is_pending().then_some(PendingRow {
            location_id: self.location_id,
            kind,
        })
    }
}

impl CollectionItem for Booking {
    type Draft = BookingDraft;

    fn table() -> Table {
        Table::Bookings
    }

    fn item_id(&self) -> ItemId {
        self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    fn with_item_id(self, id: ItemId) -> Self {
        Self { id, ..self }
    }

    fn optimistic(draft: &BookingDraft, ctx: &OptimisticContext) -> Self {
        Self {
            id: ctx.temp_id,
            location_id: ctx.collection_id,
            subject_id: ctx.author_id,
            check_in: draft.check_in,
            check_out: draft.check_out,
            guests: draft.guests,
            total_price_cents: draft.total_price_cents,
            status: BookingStatus::PendingPayment,
            owner_note: None,
            receipt_url: None,
            created_at: ctx.created_at,
            updated_at: ctx.created_at,
        }
    }

    fn idempotency_key(collection_id: CollectionId, draft: &BookingDraft) -> String {
        format!("book:{}:{}", collection_id, draft.check_in)
    }

    fn logical_key(&self) -> String {
        format!("book:{}:{}", self.location_id, self.check_in)
    }

    fn validate_draft(draft: &BookingDraft) -> Result<(), MutationError> {
        if draft.check_out <= draft.check_in {
            return Err(MutationError::Validation {
                field: "check_out".to_string(),
                reason: "check-out must be after check-in".to_string(),
            });
        }
        if draft.guests == 0 {
            return Err(MutationError::Validation {
                field: "guests".to_string(),
                reason: "at least one guest is required".to_string(),
            });
        }
        if draft.total_price_cents < 0 {
            return Err(MutationError::Validation {
                field: "total_price_cents".to_string(),
                reason: "price must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// CHANGE REQUESTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestStatus {
    Pending,
    Approved,
    Rejected,
}

/// Owner-submitted edit of a location awaiting admin approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ItemId,
    pub location_id: CollectionId,
    pub submitted_by: SubjectId,
    pub status: ChangeRequestStatus,
    pub changes: serde_json::Value,
    pub created_at: Timestamp,
}

impl ChangeRequest {
    /// Projection counted against the location's owner until an admin
    /// decides the request.
    pub fn pending_row(&self) -> Option<PendingRow> {
        let kind = PendingKind::ChangeRequest(self.status);
        kind.is_pending().then_some(PendingRow {
            location_id: self.location_id,
            kind,
        })
    }
}

// ============================================================================
// READ CURSORS AND AGGREGATE ROWS
// ============================================================================

/// How far a subject has read in one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCursor {
    pub subject_id: SubjectId,
    pub collection_id: CollectionId,
    pub last_read_at: Timestamp,
}

impl ReadCursor {
    pub fn new(subject_id: SubjectId, collection_id: CollectionId, last_read_at: Timestamp) -> Self {
        Self {
            subject_id,
            collection_id,
            last_read_at,
        }
    }

    /// Move the cursor forward. Returns false (and leaves the cursor
    /// untouched) when `at` is not newer than the current position.
    pub fn advance_to(&mut self, at: Timestamp) -> bool {
        if at > self.last_read_at {
            self.last_read_at = at;
            true
        } else {
            false
        }
    }
}

/// Minimal projection of an item used for unread counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRow {
    pub collection_id: CollectionId,
    pub author_id: SubjectId,
    pub created_at: Timestamp,
}

/// Kind of request still awaiting an owner's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Booking(BookingStatus),
    ChangeRequest(ChangeRequestStatus),
}

impl PendingKind {
    pub fn is_pending(&self) -> bool {
        match self {
            PendingKind::Booking(status) => status.is_pending(),
            PendingKind::ChangeRequest(status) => *status == ChangeRequestStatus::Pending,
        }
    }
}

/// Minimal projection of a booking or change request for pending counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRow {
    pub location_id: CollectionId,
    pub kind: PendingKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;
    use chrono::{TimeZone, Utc};

    fn ctx() -> OptimisticContext {
        OptimisticContext {
            temp_id: ItemId::temporary(),
            collection_id: CollectionId::now_v7(),
            author_id: SubjectId::now_v7(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_message_key_ignores_surrounding_whitespace() {
        let collection_id = CollectionId::now_v7();
        let a = Message::idempotency_key(collection_id, &MessageDraft::new("hello"));
        let b = Message::idempotency_key(collection_id, &MessageDraft::new("  hello \n"));
        let c = Message::idempotency_key(collection_id, &MessageDraft::new("hello!"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(&format!("send:{}:", collection_id)));
    }

    #[test]
    fn test_persisted_rows_carry_their_write_key() {
        let ctx = ctx();
        let canonical = ItemId::now_v7();

        let draft = MessageDraft::new("  see you at noon ");
        let message = Message::optimistic(&draft, &ctx).with_item_id(canonical);
        assert_eq!(message.logical_key(), Message::idempotency_key(ctx.collection_id, &draft));

        let membership = Membership::optimistic(&MembershipDraft, &ctx).with_item_id(canonical);
        assert_eq!(
            membership.logical_key(),
            Membership::idempotency_key(ctx.collection_id, &MembershipDraft)
        );

        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).unwrap();
        let draft = BookingDraft {
            check_in: day(10),
            check_out: day(12),
            guests: 2,
            total_price_cents: 12_000,
        };
        let booking = Booking::optimistic(&draft, &ctx).with_item_id(canonical);
        assert_eq!(booking.logical_key(), Booking::idempotency_key(ctx.collection_id, &draft));
    }

    #[test]
    fn test_empty_message_rejected() {
        let err = Message::validate_draft(&MessageDraft::new("   ")).unwrap_err();
        assert!(matches!(err, MutationError::Validation { ref field, .. } if field == "content"));
    }

    #[test]
    fn test_optimistic_message_uses_temp_id() {
        let ctx = ctx();
        let message = Message::optimistic(&MessageDraft::new(" hi "), &ctx);
        assert_eq!(message.id, ctx.temp_id);
        assert_eq!(message.content, "hi");
        assert_eq!(message.author_id, ctx.author_id);

        let canonical = ItemId::now_v7();
        assert_eq!(message.with_item_id(canonical).id, canonical);
    }

    #[test]
    fn test_change_detection_modes() {
        let ctx = ctx();
        let a = Message::optimistic(&MessageDraft::new("a"), &ctx).with_item_id(ItemId::now_v7());
        let b = Message::optimistic(&MessageDraft::new("b"), &ctx).with_item_id(ItemId::now_v7());
        let mut edited = b.clone();
        edited.content = "b (edited)".to_string();

        let current = vec![a.clone(), b];
        let next = vec![a, edited];
        assert!(ChangeDetection::Tail.is_unchanged(&current, &next));
        assert!(!ChangeDetection::Exact.is_unchanged(&current, &next));
        assert!(!ChangeDetection::Tail.is_unchanged(&current, &next[..1]));
        assert_eq!(Message::change_detection(), ChangeDetection::Tail);
        assert_eq!(Booking::change_detection(), ChangeDetection::Exact);
    }

    #[test]
    fn test_booking_validation() {
        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).unwrap();
        let mut draft = BookingDraft {
            check_in: day(10),
            check_out: day(12),
            guests: 2,
            total_price_cents: 12_000,
        };
        assert!(Booking::validate_draft(&draft).is_ok());
        assert_eq!(
            Booking::idempotency_key(CollectionId::new(uuid::Uuid::nil()), &draft),
            "book:00000000-0000-0000-0000-000000000000:2026-03-10"
        );

        draft.check_out = day(10);
        assert!(Booking::validate_draft(&draft).is_err());

        draft.check_out = day(12);
        draft.guests = 0;
        assert!(Booking::validate_draft(&draft).is_err());
    }

    #[test]
    fn test_read_cursor_is_monotonic() {
        let t = |h| Utc.with_ymd_and_hms(2026, 1, 1, h, 0, 0).unwrap();
        let mut cursor = ReadCursor::new(SubjectId::now_v7(), CollectionId::now_v7(), t(10));
        assert!(cursor.advance_to(t(11)));
        assert!(!cursor.advance_to(t(9)));
        assert!(!cursor.advance_to(t(11)));
        assert_eq!(cursor.last_read_at, t(11));
    }

    #[test]
    fn test_pending_kinds() {
        assert!(PendingKind::Booking(BookingStatus::PendingPayment).is_pending());
        assert!(PendingKind::Booking(BookingStatus::PendingConfirmation).is_pending());
        assert!(!PendingKind::Booking(BookingStatus::Confirmed).is_pending());
        assert!(PendingKind::ChangeRequest(ChangeRequestStatus::Pending).is_pending());
        assert!(!PendingKind::ChangeRequest(ChangeRequestStatus::Rejected).is_pending());
    }

    #[test]
    fn test_pending_rows_follow_status() {
        let ctx = ctx();
        let draft = BookingDraft {
            check_in: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2026, 3, 12).unwrap(),
            guests: 1,
            total_price_cents: 0,
        };
        let mut booking = Booking::optimistic(&draft, &ctx);
        assert_eq!(
            booking.pending_row(),
            Some(PendingRow {
                location_id: ctx.collection_id,
                kind: PendingKind::Booking(BookingStatus::PendingPayment),
            })
        );
        booking.status = BookingStatus::Confirmed;
        assert_eq!(booking.pending_row(), None);

        let mut request = ChangeRequest {
            id: ItemId::now_v7(),
            location_id: ctx.collection_id,
            submitted_by: ctx.author_id,
            status: ChangeRequestStatus::Pending,
            changes: serde_json::json!({ "name": "Upper Meadow" }),
            created_at: ctx.created_at,
        };
        assert_eq!(
            request.pending_row().map(|row| row.kind),
            Some(PendingKind::ChangeRequest(ChangeRequestStatus::Pending))
        );
        request.status = ChangeRequestStatus::Approved;
        assert_eq!(request.pending_row(), None);
    }

    // ========================================================================
    // PROPERTIES
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Padding a message never changes its idempotency key, so a retried
        /// submit of the same text collapses onto the first.
        #[test]
        fn prop_message_key_stable_under_padding(
            content in "[a-z0-9 ]{1,40}",
            left in " {0,3}",
            right in "[ \n]{0,3}",
        ) {
            let collection_id = CollectionId::new(uuid::Uuid::nil());
            let plain = Message::idempotency_key(collection_id, &MessageDraft::new(content.clone()));
            let padded = Message::idempotency_key(
                collection_id,
                &MessageDraft::new(format!("{}{}{}", left, content, right)),
            );
            prop_assert_eq!(&plain, &padded);

            let ctx = OptimisticContext { collection_id, ..ctx() };
            let row = Message::optimistic(
                &MessageDraft::new(format!("{}{}{}", left, content, right)),
                &ctx,
            );
            prop_assert_eq!(row.logical_key(), plain);
        }

        /// A cursor only ever moves forward.
        #[test]
        fn prop_read_cursor_never_regresses(offsets in prop::collection::vec(-120i64..120, 1..20)) {
            let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
            let mut cursor = ReadCursor::new(SubjectId::now_v7(), CollectionId::now_v7(), start);
            let mut high = start;
            for offset in offsets {
                let at = start + chrono::Duration::minutes(offset);
                let moved = cursor.advance_to(at);
                prop_assert_eq!(moved, at > high);
                high = high.max(at);
                prop_assert_eq!(cursor.last_read_at, high);
            }
        }

        /// A booking draft is valid exactly when it covers at least one
        /// night, one guest and a non-negative price.
        #[test]
        fn prop_booking_validation_matches_rules(
            nights in -3i64..5,
            guests in 0u32..4,
            total_price_cents in -100i64..100,
        ) {
            let check_in = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
            let draft = BookingDraft {
                check_in,
                check_out: check_in + chrono::Duration::days(nights),
                guests,
                total_price_cents,
            };
            let expected = nights > 0 && guests > 0 && total_price_cents >= 0;
            prop_assert_eq!(Booking::validate_draft(&draft).is_ok(), expected);
        }
    }
}
