//! Mutation deduplication keyed by idempotency key.
//!
//! A second `run` for a key that is already in flight joins the first
//! call's outcome instead of issuing another write. The key is released as
//! soon as the write settles, success or failure. This protects against
//! double submits from one client; it does not replace server-side
//! idempotency.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lodge_core::MutationError;
use tokio::sync::oneshot;

use crate::tasks::BackgroundTasks;

type AnyOutcome = Arc<dyn Any + Send + Sync>;
type SharedMutation = Shared<BoxFuture<'static, Result<AnyOutcome, MutationError>>>;

struct InFlightMutation {
    id: u64,
    future: SharedMutation,
}

struct GuardInner {
    in_flight: DashMap<String, InFlightMutation>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
    tasks: BackgroundTasks,
}

impl GuardInner {
    fn release(&self, key: &str, id: u64) {
        self.in_flight.remove_if(key, |_, m| m.id == id);
    }
}

/// Counters for guarded writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    /// Writes actually issued.
    pub started: u64,
    /// Calls that joined a write already in flight.
    pub joined: u64,
    pub in_flight: u64,
}

#[derive(Clone)]
pub struct MutationGuard {
    inner: Arc<GuardInner>,
}

impl Default for MutationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationGuard {
    pub fn new() -> Self {
        Self::with_tasks(BackgroundTasks::new())
    }

    pub fn with_tasks(tasks: BackgroundTasks) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                in_flight: DashMap::new(),
                next_id: AtomicU64::new(0),
                started: AtomicU64::new(0),
                joined: AtomicU64::new(0),
                tasks,
            }),
        }
    }

    /// Run `mutation` unless a write for `key` is already in flight, in
    /// which case the in-flight outcome is returned.
    ///
    /// The write runs as its own task: dropping the returned future does
    /// not cancel a half-issued write. A joined caller whose `R` differs
    /// from the running write's gets [`MutationError::KeyConflict`].
    pub async fn run<R, F, Fut>(&self, key: impl Into<String>, mutation: F) -> Result<R, MutationError>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, MutationError>> + Send + 'static,
    {
        let key = key.into();
        let shared = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                self.inner.joined.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Joining in-flight mutation");
                existing.get().future.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();

                let weak = Arc::downgrade(&self.inner);
                let write_key = key.clone();
                let write = async move {
                    let result = mutation().await.map(|r| Arc::new(r) as AnyOutcome);
                    if let Some(inner) = weak.upgrade() {
                        inner.release(&write_key, id);
                    }
                    if let Err(e) = &result {
                        tracing::debug!(key = %write_key, error = %e, "Guarded mutation failed");
                    }
                    let _ = tx.send(result);
                };

                let weak = Arc::downgrade(&self.inner);
                let waiter_key = key.clone();
                let future = async move {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => {
                            if let Some(inner) = weak.upgrade() {
                                inner.release(&waiter_key, id);
                            }
                            Err(MutationError::Aborted { key: waiter_key })
                        }
                    }
                }
                .boxed()
                .shared();

                slot.insert(InFlightMutation {
                    id,
                    future: future.clone(),
                });
                self.inner.started.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Mutation started");
                self.inner.tasks.spawn(write);
                future
            }
        };

        let outcome = shared.await?;
        (*outcome)
            .downcast_ref::<R>()
            .cloned()
            .ok_or(MutationError::KeyConflict { key })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            started: self.inner.started.load(Ordering::Relaxed),
            joined: self.inner.joined.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len() as u64,
        }
    }
}

impl std::fmt::Debug for MutationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationGuard")
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ShutdownMode;

    #[tokio::test]
    async fn test_key_released_after_failure() {
        let guard = MutationGuard::new();
        let err = guard
            .run("leave:1", || async {
                Err::<(), _>(MutationError::Rejected {
                    operation: "leave".to_string(),
                    reason: "not a member".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Rejected { .. }));
        assert!(!guard.is_in_flight("leave:1"));

        let ok = guard.run("leave:1", || async { Ok::<_, MutationError>(7u8) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn test_writes_refused_after_shutdown() {
        let tasks = BackgroundTasks::new();
        let guard = MutationGuard::with_tasks(tasks.clone());
        tasks.shutdown(ShutdownMode::Drain).await;

        let err = guard
            .run("join:1", || async { Ok::<_, MutationError>(()) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MutationError::Aborted {
                key: "join:1".to_string()
            }
        );
        assert_eq!(guard.in_flight_count(), 0);
    }
}
