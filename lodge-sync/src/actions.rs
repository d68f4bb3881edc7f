//! Guarded community actions.
//!
//! Each action runs through the [`MutationGuard`] under a stable key so a
//! double tap issues one write, and on success drops the cache entries the
//! write made stale. Errors reach the caller unchanged.

use std::sync::Arc;

use lodge_cache::{keys, MutationGuard, QueryCache};
use lodge_core::{
    Booking, BookingDraft, CollectionId, CollectionItem, CommunityBackend, CommunityCommand, ItemId,
    LodgeResult, SubjectId, WriteAck,
};

/// Community writes on behalf of one subject.
#[derive(Clone)]
pub struct CommunityActions {
    backend: Arc<dyn CommunityBackend>,
    guard: MutationGuard,
    cache: QueryCache,
    subject_id: SubjectId,
}

impl CommunityActions {
    pub fn new(
        backend: Arc<dyn CommunityBackend>,
        guard: MutationGuard,
        cache: QueryCache,
        subject_id: SubjectId,
    ) -> Self {
        Self {
            backend,
            guard,
            cache,
            subject_id,
        }
    }

    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    /// Whether the action with this key is in flight (to disable buttons).
    pub fn is_busy(&self, key: &str) -> bool {
        self.guard.is_in_flight(key)
    }

    /// Join a location. Returns the new membership's id.
    pub async fn join(&self, location_id: CollectionId) -> LodgeResult<ItemId> {
        let ack = self
            .execute(
                join_key(location_id),
                CommunityCommand::Join {
                    location_id,
                    subject_id: self.subject_id,
                },
            )
            .await?;
        let id = ack.require("join")?;
        self.invalidate_membership(location_id);
        Ok(id)
    }

    pub async fn leave(&self, location_id: CollectionId) -> LodgeResult<()> {
        self.execute(
            leave_key(location_id),
            CommunityCommand::Leave {
                location_id,
                subject_id: self.subject_id,
            },
        )
        .await?;
        self.invalidate_membership(location_id);
        Ok(())
    }

    pub async fn cancel_booking(&self, booking_id: ItemId) -> LodgeResult<()> {
        self.execute(
            cancel_key(booking_id),
            CommunityCommand::CancelBooking { booking_id },
        )
        .await?;
        self.invalidate_bookings();
        Ok(())
    }

    /// Attach a payment receipt; the booking then awaits the owner.
    pub async fn submit_payment(&self, booking_id: ItemId, receipt_url: impl Into<String>) -> LodgeResult<()> {
        self.execute(
            markpaid_key(booking_id),
            CommunityCommand::SubmitPayment {
                booking_id,
                receipt_url: receipt_url.into(),
            },
        )
        .await?;
        self.invalidate_bookings();
        Ok(())
    }

    /// Request a booking. Invalid drafts are rejected before any write.
    pub async fn create_booking(&self, location_id: CollectionId, draft: BookingDraft) -> LodgeResult<ItemId> {
        Booking::validate_draft(&draft)?;
        let key = Booking::idempotency_key(location_id, &draft);
        let ack = self
            .execute(
                key,
                CommunityCommand::CreateBooking {
                    location_id,
                    subject_id: self.subject_id,
                    draft,
                },
            )
            .await?;
        let id = ack.require("book")?;
        self.invalidate_bookings();
        Ok(id)
    }

    // === Owner actions ===

    /// Accept a pending booking at a location this subject runs.
    pub async fn confirm_booking(&self, booking_id: ItemId, owner_note: Option<String>) -> LodgeResult<()> {
        self.execute(
            confirm_key(booking_id),
            CommunityCommand::ConfirmBooking {
                booking_id,
                owner_id: self.subject_id,
                owner_note,
            },
        )
        .await?;
        self.invalidate_owner_bookings();
        Ok(())
    }

    pub async fn reject_booking(&self, booking_id: ItemId, owner_note: Option<String>) -> LodgeResult<()> {
        self.execute(
            reject_key(booking_id),
            CommunityCommand::RejectBooking {
                booking_id,
                owner_id: self.subject_id,
                owner_note,
            },
        )
        .await?;
        self.invalidate_owner_bookings();
        Ok(())
    }

    /// Close a confirmed booking once the stay is over.
    pub async fn complete_booking(&self, booking_id: ItemId) -> LodgeResult<()> {
        self.execute(
            complete_key(booking_id),
            CommunityCommand::CompleteBooking {
                booking_id,
                owner_id: self.subject_id,
            },
        )
        .await?;
        self.invalidate_owner_bookings();
        Ok(())
    }

    async fn execute(&self, key: String, command: CommunityCommand) -> LodgeResult<WriteAck> {
        let backend = Arc::clone(&self.backend);
        let operation = command.operation();
        let ack = self
            .guard
            .run(key.clone(), move || async move { backend.execute(command).await })
            .await;
        match &ack {
            Ok(_) => tracing::info!(key = %key, operation, "Community action succeeded"),
            Err(e) => tracing::warn!(key = %key, operation, error = %e, "Community action failed"),
        }
        Ok(ack?)
    }

    fn invalidate_membership(&self, location_id: CollectionId) {
        self.cache.invalidate(&keys::members(location_id));
        self.cache.invalidate(keys::LOCATIONS_LIST);
        self.cache.invalidate(&keys::unread(self.subject_id));
    }

    fn invalidate_bookings(&self) {
        self.cache.invalidate(&keys::bookings_for_user(self.subject_id));
        self.cache.invalidate_by_prefix(keys::BOOKINGS_OWNER_PREFIX);
        self.cache.invalidate_by_prefix(keys::PENDING_PREFIX);
    }

    fn invalidate_owner_bookings(&self) {
        self.cache.invalidate(&keys::bookings_for_owner(self.subject_id));
        self.cache.invalidate(&keys::pending(self.subject_id));
    }
}

impl std::fmt::Debug for CommunityActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunityActions")
            .field("subject_id", &self.subject_id)
            .field("in_flight", &self.guard.in_flight_count())
            .finish()
    }
}

pub fn join_key(location_id: CollectionId) -> String {
    format!("join:{}", location_id)
}

pub fn leave_key(location_id: CollectionId) -> String {
    format!("leave:{}", location_id)
}

pub fn cancel_key(booking_id: ItemId) -> String {
    format!("cancel:{}", booking_id)
}

pub fn markpaid_key(booking_id: ItemId) -> String {
    format!("markpaid:{}", booking_id)
}

pub fn confirm_key(booking_id: ItemId) -> String {
    format!("confirm:{}", booking_id)
}

pub fn reject_key(booking_id: ItemId) -> String {
    format!("reject:{}", booking_id)
}

pub fn complete_key(booking_id: ItemId) -> String {
    format!("complete:{}", booking_id)
}
