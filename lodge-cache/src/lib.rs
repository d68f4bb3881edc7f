//! LODGE Cache - Read-Through Cache and Mutation Guard
//!
//! In-memory, per-process building blocks for the sync layer:
//!
//! - [`QueryCache`]: keyed values with TTL, stale-while-revalidate and one
//!   fetch per key no matter how many callers ask at once
//! - [`MutationGuard`]: one write per idempotency key at a time
//! - [`BackgroundTasks`]: the task set both spawn onto, drained or aborted
//!   at shutdown
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::new();
//! let members = cache
//!     .get_with_update(
//!         &keys::members(location_id),
//!         move || async move { backend.fetch(&query).await },
//!         CacheOptions::swr(Duration::from_secs(30)),
//!         |fresh| render(fresh),
//!     )
//!     .await?;
//! ```

pub mod freshness;
pub mod guard;
pub mod keys;
pub mod read_through;
mod stats;
pub mod tasks;

pub use freshness::{CacheOptions, CacheRead};
pub use guard::{GuardStats, MutationGuard};
pub use read_through::{QueryCache, UpdateCallback};
pub use stats::CacheStats;
pub use tasks::{BackgroundTasks, ShutdownMode, ShutdownReport};
