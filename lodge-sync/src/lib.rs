//! LODGE Sync - Live Collections, Counters and Guarded Actions
//!
//! Keeps client views consistent while data changes from three sources at
//! once: the user's own optimistic writes, the server push feed, and a
//! polling fallback. All three funnel into one refetch-and-replace routine
//! per collection.
//!
//! # Example
//!
//! ```ignore
//! let messages = LiveCollection::<Message>::builder(location_id, me, backend.clone())
//!     .with_writer(backend.clone())
//!     .with_push_feed(backend.clone())
//!     .with_read_cursors(backend.clone())
//!     .with_cache(cache.clone(), keys::messages(location_id), CacheOptions::swr(ttl))
//!     .with_config(config.sync.clone())
//!     .open()
//!     .await?;
//!
//! let mut updates = messages.subscribe();
//! messages.create(MessageDraft::new("hello")).await?;
//! ```

pub mod actions;
pub mod counters;
pub mod live;
pub mod reconcile;
pub mod telemetry;
pub mod trigger;

pub use actions::CommunityActions;
pub use counters::{count_pending, count_unread, CounterView, Counters, CountsByCollection, LiveCounters};
pub use live::{CollectionStatus, CollectionView, LiveCollection, LiveCollectionBuilder};
pub use reconcile::{Reconciler, SnapshotOutcome, Ticket};
pub use telemetry::{init_tracing, LOG_ENV};
pub use trigger::{Refresh, RefreshCause, TriggerConfig, TriggerMetrics, TriggerSnapshot};
