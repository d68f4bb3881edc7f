//! Shared set of fire-and-forget tasks.
//!
//! Background refreshes, write drivers and read-cursor advances all land
//! here so a host can drain or abort them at shutdown instead of leaking
//! detached tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::{JoinError, JoinSet};

/// How [`BackgroundTasks::shutdown`] treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for every outstanding task to finish.
    Drain,
    /// Cancel outstanding tasks at their next suspension point.
    Abort,
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub cancelled: usize,
    pub panicked: usize,
}

/// Cloneable handle to a shared `JoinSet`.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
    closed: Arc<AtomicBool>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task onto the set.
    ///
    /// Must be called from within a tokio runtime. Returns false (dropping
    /// the task unpolled) once the set has been shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            tracing::debug!("Background task refused after shutdown");
            return false;
        }
        let mut set = self.lock();
        while let Some(result) = set.try_join_next() {
            log_join_result(result);
        }
        set.spawn(task);
        true
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting work and settle everything outstanding.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
        self.closed.store(true, Ordering::Release);
        let mut set = std::mem::take(&mut *self.lock());
        if mode == ShutdownMode::Abort {
            set.abort_all();
        }

        let mut report = ShutdownReport::default();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_cancelled() => report.cancelled += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Background task panicked");
                    report.panicked += 1;
                }
            }
        }

        tracing::info!(
            ?mode,
            completed = report.completed,
            cancelled = report.cancelled,
            panicked = report.panicked,
            "Background tasks shut down"
        );
        report
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::warn!(error = %e, "Background task panicked");
        }
    }
}
