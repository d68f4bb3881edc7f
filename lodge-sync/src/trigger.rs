//! Refresh Driver
//!
//! One loop per synchronized resource turns push events and poll ticks
//! into calls of a single [`Refresh`] target:
//!
//! - push events restart a trailing debounce timer; when it fires the
//!   target refreshes once for the whole burst
//! - the poll interval refreshes unconditionally (or until the push feed
//!   has proven alive, under [`PollPolicy::UntilPushObserved`])
//! - the loop stops when the shutdown flag flips or its sender is dropped
//!
//! Dropping the loop drops the push stream, which unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use lodge_core::{ChangeEvent, CollectionId, CountersConfig, PollPolicy, SyncConfig};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Shortest poll period a loop will run with. Smaller (or zero) intervals
/// are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing of one refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Fixed interval between poll refreshes.
    pub poll_interval: Duration,
    /// Quiet period after the last push event before refreshing.
    pub push_debounce: Duration,
    pub poll_policy: PollPolicy,
}

impl From<&SyncConfig> for TriggerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            push_debounce: config.push_debounce(),
            poll_policy: config.poll_policy,
        }
    }
}

impl From<&CountersConfig> for TriggerConfig {
    fn from(config: &CountersConfig) -> Self {
        Self {
            poll_interval: config.refresh_interval(),
            push_debounce: config.debounce(),
            poll_policy: PollPolicy::Always,
        }
    }
}

// ============================================================================
// TARGET
// ============================================================================

/// Why a refresh ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshCause {
    Push,
    Poll,
    Manual,
}

impl RefreshCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshCause::Push => "push",
            RefreshCause::Poll => "poll",
            RefreshCause::Manual => "manual",
        }
    }
}

/// Something the loop keeps up to date. Failures are the target's to log.
#[async_trait]
pub trait Refresh: Send + Sync + 'static {
    async fn refresh(&self, cause: RefreshCause);
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct TriggerMetrics {
    /// Push events that concerned the target.
    pub push_events: AtomicU64,
    /// Push events for other collections.
    pub ignored_events: AtomicU64,
    pub push_refreshes: AtomicU64,
    pub poll_refreshes: AtomicU64,
}

impl TriggerMetrics {
    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            push_events: self.push_events.load(Ordering::Relaxed),
            ignored_events: self.ignored_events.load(Ordering::Relaxed),
            push_refreshes: self.push_refreshes.load(Ordering::Relaxed),
            poll_refreshes: self.poll_refreshes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub push_events: u64,
    pub ignored_events: u64,
    pub push_refreshes: u64,
    pub poll_refreshes: u64,
}

// ============================================================================
// LOOP
// ============================================================================

/// Drive `target` from `events` and the poll interval until shutdown.
///
/// With `scope` set, events that name a different collection are ignored.
/// The first poll fires one full interval after start; the caller is
/// expected to have loaded once already.
pub async fn run_refresh_loop(
    target: Arc<dyn Refresh>,
    mut events: BoxStream<'static, ChangeEvent>,
    scope: Option<CollectionId>,
    config: TriggerConfig,
    metrics: Arc<TriggerMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut push_open = true;
    let mut push_seen = false;

    let period = config.poll_interval.max(MIN_POLL_INTERVAL);
    if period != config.poll_interval {
        tracing::warn!(
            requested_ms = config.poll_interval.as_millis() as u64,
            poll_interval_ms = period.as_millis() as u64,
            scope = ?scope,
            "Poll interval below minimum; clamped"
        );
    }
    let mut poll = interval_at(Instant::now() + period, period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let debounce = sleep(config.push_debounce);
    tokio::pin!(debounce);
    let mut armed = false;

    tracing::debug!(
        poll_interval_ms = period.as_millis() as u64,
        push_debounce_ms = config.push_debounce.as_millis() as u64,
        scope = ?scope,
        "Refresh loop started"
    );

    loop {
        // Polling resumes if the feed closes, whatever the policy.
        let polling = config.poll_policy == PollPolicy::Always || !push_seen || !push_open;

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            event = events.next(), if push_open => match event {
                Some(event) => {
                    if scope.map_or(true, |id| event.concerns(id)) {
                        metrics.push_events.fetch_add(1, Ordering::Relaxed);
                        push_seen = true;
                        debounce.as_mut().reset(Instant::now() + config.push_debounce);
                        armed = true;
                    } else {
                        metrics.ignored_events.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    tracing::debug!(scope = ?scope, "Push feed closed; relying on polling");
                    push_open = false;
                }
            },

            () = &mut debounce, if armed => {
                armed = false;
                metrics.push_refreshes.fetch_add(1, Ordering::Relaxed);
                target.refresh(RefreshCause::Push).await;
            }

            _ = poll.tick(), if polling => {
                metrics.poll_refreshes.fetch_add(1, Ordering::Relaxed);
                target.refresh(RefreshCause::Poll).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::debug!(
        push_events = snapshot.push_events,
        push_refreshes = snapshot.push_refreshes,
        poll_refreshes = snapshot.poll_refreshes,
        "Refresh loop stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use lodge_core::{ChangeKind, EntityIdType, Table, Topic};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct Recorder {
        causes: Mutex<Vec<RefreshCause>>,
    }

    impl Recorder {
        fn causes(&self) -> Vec<RefreshCause> {
            self.causes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Refresh for Recorder {
        async fn refresh(&self, cause: RefreshCause) {
            self.causes.lock().unwrap().push(cause);
        }
    }

    fn event(collection_id: CollectionId) -> ChangeEvent {
        ChangeEvent {
            topic: Topic::collection(Table::Messages, collection_id),
            kind: ChangeKind::Insert,
            row_id: None,
            collection_id: Some(collection_id),
        }
    }

    fn config(policy: PollPolicy) -> TriggerConfig {
        TriggerConfig {
            poll_interval: Duration::from_secs(3),
            push_debounce: Duration::from_millis(300),
            poll_policy: policy,
        }
    }

    struct Harness {
        recorder: Arc<Recorder>,
        metrics: Arc<TriggerMetrics>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(scope: CollectionId, policy: PollPolicy) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(TriggerMetrics::default());
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh_loop(
            recorder.clone(),
            UnboundedReceiverStream::new(rx).boxed(),
            Some(scope),
            config(policy),
            metrics.clone(),
            shutdown_rx,
        ));
        Harness {
            recorder,
            metrics,
            events,
            shutdown,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_refreshes_once() {
        let scope = CollectionId::now_v7();
        let h = start(scope, PollPolicy::Always);

        for _ in 0..5 {
            h.events.send(event(scope)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(h.recorder.causes(), vec![RefreshCause::Push]);
        assert_eq!(h.metrics.snapshot().push_events, 5);
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_events_are_ignored() {
        let scope = CollectionId::now_v7();
        let h = start(scope, PollPolicy::Always);

        h.events.send(event(CollectionId::now_v7())).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.recorder.causes().is_empty());
        assert_eq!(h.metrics.snapshot().ignored_events, 1);
        drop(h.shutdown);
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fires_on_interval() {
        let h = start(CollectionId::now_v7(), PollPolicy::Always);

        tokio::time::sleep(Duration::from_millis(9_100)).await;
        assert_eq!(
            h.recorder.causes(),
            vec![RefreshCause::Poll, RefreshCause::Poll, RefreshCause::Poll]
        );
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_interval_is_clamped() {
        let scope = CollectionId::now_v7();
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(TriggerMetrics::default());
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh_loop(
            recorder.clone(),
            UnboundedReceiverStream::new(rx).boxed(),
            Some(scope),
            TriggerConfig {
                poll_interval: Duration::ZERO,
                push_debounce: Duration::from_millis(30),
                poll_policy: PollPolicy::Always,
            },
            metrics.clone(),
            shutdown_rx,
        ));

        events.send(event(scope)).unwrap();
        tokio::time::sleep(MIN_POLL_INTERVAL * 4 + Duration::from_millis(50)).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.push_refreshes, 1);
        assert_eq!(snapshot.poll_refreshes, 4);
        assert!(!handle.is_finished());
        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_once_push_observed() {
        let scope = CollectionId::now_v7();
        let h = start(scope, PollPolicy::UntilPushObserved);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        h.events.send(event(scope)).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.recorder.causes(), vec![RefreshCause::Poll, RefreshCause::Push]);
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_feed_falls_back_to_polling() {
        let recorder = Arc::new(Recorder::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh_loop(
            recorder.clone(),
            stream::empty().boxed(),
            None,
            config(PollPolicy::UntilPushObserved),
            Arc::new(TriggerMetrics::default()),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(recorder.causes(), vec![RefreshCause::Poll]);
        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }
}
