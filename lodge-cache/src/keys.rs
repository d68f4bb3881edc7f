//! Cache key builders shared by the synchronizer, counters and actions.
//!
//! Keys are plain strings so prefix invalidation works across families.

use lodge_core::{CollectionId, SubjectId};

pub const LOCATIONS_LIST: &str = "locations:list";
pub const UNREAD_PREFIX: &str = "unread:";
pub const PENDING_PREFIX: &str = "pending:";
pub const BOOKINGS_OWNER_PREFIX: &str = "bookings:owner:";

pub fn members(location_id: CollectionId) -> String {
    format!("members:{}", location_id)
}

pub fn messages(location_id: CollectionId) -> String {
    format!("messages:{}", location_id)
}

pub fn bookings_for_user(subject_id: SubjectId) -> String {
    format!("bookings:user:{}", subject_id)
}

pub fn bookings_for_owner(subject_id: SubjectId) -> String {
    format!("{}{}", BOOKINGS_OWNER_PREFIX, subject_id)
}

pub fn unread(subject_id: SubjectId) -> String {
    format!("{}{}", UNREAD_PREFIX, subject_id)
}

pub fn pending(subject_id: SubjectId) -> String {
    format!("{}{}", PENDING_PREFIX, subject_id)
}
