//! Bounded-concurrency work queue: the admission-control loop.
//!
//! Callers enqueue from any task; a single drive loop ([`WorkQueue::process`]
//! or [`WorkQueue::run`]) owns the pending FIFO. Each dequeued item must pass the [`RateLimiter`] before it is
//! handed to a [`RetryingCaller`] on its own task, and no more than
//! `capacity` tasks ever run at once.
//!
//! An item denied admission goes back to the front of the FIFO and the loop
//! waits a fixed `admission_poll_interval` before asking again.
//!
//! Execution tasks are detached and report their own outcome, so dropping a
//! drive loop never cancels in-flight calls. Items the loop had taken but not
//! dispatched go back to a shared backlog for the next loop.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::caller::RetryingCaller;
use crate::config::Config;
use crate::error::{CallError, Error, Result};
use crate::event::{Event, EventBus, EventKind};
use crate::limiter::RateLimiter;
use crate::model::{BoxedItem, ItemHandle, WorkId, WorkItem};
use crate::telemetry::metrics;
use crate::tracker::StatusTracker;

/// Wait between admission attempts after the limiter says no.
pub const DEFAULT_ADMISSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum concurrently executing calls.
    pub capacity: usize,
    /// Fixed wait after a denied admission. Must be non-zero.
    pub admission_poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            admission_poll_interval: DEFAULT_ADMISSION_POLL_INTERVAL,
        }
    }
}

/// Lifecycle state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Nothing pending, nothing running.
    Idle,
    /// Items pending or tasks running.
    Draining,
    /// Stop requested; in-flight tasks are finishing.
    Stopped,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueState::Idle => "idle",
            QueueState::Draining => "draining",
            QueueState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Observability snapshot of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub capacity: usize,
    /// Enqueued and not yet dispatched, rejected or cancelled.
    pub pending: usize,
    /// Currently executing tasks.
    pub executing: usize,
    pub stopped: bool,
}

impl QueueStats {
    pub fn available_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.executing)
    }

    pub fn state(&self) -> QueueState {
        if self.pending == 0 && self.executing == 0 {
            QueueState::Idle
        } else if self.stopped {
            QueueState::Stopped
        } else {
            QueueState::Draining
        }
    }
}

type Outcome<O> = std::result::Result<O, CallError>;

struct Pending<O> {
    id: WorkId,
    item: BoxedItem<O>,
    tx: oneshot::Sender<Outcome<O>>,
}

struct Inner<O> {
    settings: QueueSettings,
    limiter: Arc<RateLimiter>,
    caller: RetryingCaller,
    events: Arc<EventBus>,
    tx: mpsc::UnboundedSender<Pending<O>>,
    rx: Mutex<mpsc::UnboundedReceiver<Pending<O>>>,
    /// Undispatched items left behind by a dropped drive loop, in order.
    backlog: std::sync::Mutex<VecDeque<Pending<O>>>,
    stats: watch::Sender<QueueStats>,
}

impl<O> Inner<O> {
    fn backlog(&self) -> MutexGuard<'_, VecDeque<Pending<O>>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pending FIFO owned by one drive loop.
///
/// On drop, anything still held is handed back to the shared backlog ahead
/// of items that were never pulled from the channel.
struct Drain<'a, O> {
    pending: VecDeque<Pending<O>>,
    backlog: &'a std::sync::Mutex<VecDeque<Pending<O>>>,
}

impl<O> Drop for Drain<'_, O> {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        self.pending.append(&mut backlog);
        std::mem::swap(&mut *backlog, &mut self.pending);
    }
}

/// Rate-limited, bounded-concurrency queue of work items producing `O`.
///
/// Cloning is cheap and every clone drives the same queue.
pub struct WorkQueue<O> {
    inner: Arc<Inner<O>>,
}

impl<O> Clone for WorkQueue<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Send + 'static> WorkQueue<O> {
    pub fn new(settings: QueueSettings, limiter: Arc<RateLimiter>, caller: RetryingCaller) -> Self {
        let settings = QueueSettings {
            capacity: settings.capacity.max(1),
            ..settings
        };
        let events = Arc::new(EventBus::new());
        let caller = caller.with_events(Arc::clone(&events));
        let (tx, rx) = mpsc::unbounded_channel();
        let (stats, _) = watch::channel(QueueStats {
            capacity: settings.capacity,
            ..QueueStats::default()
        });

        Self {
            inner: Arc::new(Inner {
                settings,
                limiter,
                caller,
                events,
                tx,
                rx: Mutex::new(rx),
                backlog: std::sync::Mutex::new(VecDeque::new()),
                stats,
            }),
        }
    }

    /// Build a queue, limiter and caller from loaded configuration.
    pub fn from_config(config: &Config, tracker: Arc<StatusTracker>) -> Self {
        Self::new(
            config.queue.clone(),
            Arc::new(RateLimiter::new(config.limits)),
            RetryingCaller::new(config.retry.clone(), tracker),
        )
    }

    /// Append an item to the pending FIFO. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] after [`stop`](Self::stop).
    pub fn enqueue<I>(&self, item: I) -> Result<ItemHandle<O>>
    where
        I: WorkItem<Output = O>,
    {
        self.enqueue_boxed(Box::new(item))
    }

    pub fn enqueue_boxed(&self, item: BoxedItem<O>) -> Result<ItemHandle<O>> {
        let id = WorkId::new();
        let estimated_tokens = item.estimated_tokens();
        let (handle, tx) = ItemHandle::new(id);
        let pending = Pending { id, item, tx };

        // Checking the stop flag and sending happen under the watch lock, so
        // an item is either in the channel before stop() or rejected.
        let accepted = self.inner.stats.send_if_modified(|stats| {
            if stats.stopped {
                return false;
            }
            if self.inner.tx.send(pending).is_err() {
                return false;
            }
            stats.pending += 1;
            self.inner.events.publish(EventKind::Enqueued {
                id,
                estimated_tokens,
            });
            true
        });

        if !accepted {
            return Err(Error::QueueClosed);
        }

        metrics::queue_pending().add(1, &[]);
        debug!(%id, estimated_tokens, "enqueued");
        Ok(handle)
    }

    /// Stop dequeuing. In-flight calls run to completion; items still pending
    /// when the drive loop notices resolve to [`CallError::Cancelled`].
    /// Idempotent.
    pub fn stop(&self) {
        let newly_stopped = self.inner.stats.send_if_modified(|stats| {
            let changed = !stats.stopped;
            stats.stopped = true;
            changed
        });
        if newly_stopped {
            info!("queue stop requested");
        }
    }

    /// Reopen a stopped queue for new work.
    pub fn resume(&self) {
        let resumed = self.inner.stats.send_if_modified(|stats| {
            let changed = stats.stopped;
            stats.stopped = false;
            changed
        });
        if resumed {
            info!("queue resumed");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stats.borrow().stopped
    }

    /// Wait until nothing is pending and nothing is executing.
    ///
    /// Returns immediately on an already drained queue. Requires a drive
    /// loop to be running (or to run) for pending items to settle.
    pub async fn join(&self) {
        let mut rx = self.inner.stats.subscribe();
        wait_until(&mut rx, |stats| stats.pending == 0 && stats.executing == 0).await;
    }

    pub fn stats(&self) -> QueueStats {
        *self.inner.stats.borrow()
    }

    pub fn state(&self) -> QueueState {
        self.stats().state()
    }

    /// Capacity minus executing tasks; never negative.
    pub fn available_capacity(&self) -> usize {
        self.stats().available_capacity()
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        self.inner.caller.tracker()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Subscribe to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Drain until nothing is pending or executing, or until stopped and
    /// in-flight calls have finished.
    ///
    /// Dropping the returned future is safe: in-flight calls keep running
    /// and undispatched items wait for the next drive loop.
    pub async fn process(&self) -> Result<()> {
        self.drive(false).await
    }

    /// Like [`process`](Self::process), but keeps waiting for new items
    /// until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<()> {
        self.drive(true).await
    }

    async fn drive(&self, keep_alive: bool) -> Result<()> {
        // One drive loop at a time owns the receiving end.
        let mut rx = self.inner.rx.lock().await;
        let mut stats_rx = self.inner.stats.subscribe();
        let mut drain = Drain {
            pending: std::mem::take(&mut *self.inner.backlog()),
            backlog: &self.inner.backlog,
        };
        let capacity = self.inner.settings.capacity;
        let poll_interval = self.inner.settings.admission_poll_interval;

        info!(capacity, keep_alive, backlog = drain.pending.len(), "drive loop started");

        loop {
            while let Ok(item) = rx.try_recv() {
                drain.pending.push_back(item);
            }

            if self.is_stopped() {
                // No enqueue can succeed now, so this drain sees everything.
                while let Ok(item) = rx.try_recv() {
                    drain.pending.push_back(item);
                }
                self.cancel_pending(&mut drain);
                wait_until(&mut stats_rx, |stats| stats.executing == 0).await;
                info!("drive loop stopped");
                return Ok(());
            }

            // Backpressure: at capacity, wait for a slot.
            if self.stats().executing >= capacity {
                wait_until(&mut stats_rx, |stats| {
                    stats.executing < capacity || stats.stopped
                })
                .await;
                continue;
            }

            let Some(next) = drain.pending.pop_front() else {
                if !keep_alive && self.stats().executing == 0 {
                    info!("drive loop drained");
                    return Ok(());
                }
                tokio::select! {
                    Some(item) = rx.recv() => drain.pending.push_back(item),
                    _ = wait_until(&mut stats_rx, |stats| {
                        stats.stopped || (!keep_alive && stats.executing == 0)
                    }) => {}
                }
                continue;
            };

            let estimated_tokens = next.item.estimated_tokens();
            if !self.inner.limiter.can_ever_admit(estimated_tokens) {
                let limit = self.inner.limiter.limits().max_tokens;
                self.reject(
                    next,
                    CallError::QuotaExceeded {
                        estimated: estimated_tokens,
                        limit,
                    },
                );
                continue;
            }

            if !self.inner.limiter.try_admit(estimated_tokens) {
                debug!(id = %next.id, estimated_tokens, "admission deferred");
                self.inner.events.publish(EventKind::Deferred {
                    id: next.id,
                    estimated_tokens,
                });
                drain.pending.push_front(next);

                // Wait out the full interval; finished tasks free their own slots.
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = wait_until(&mut stats_rx, |stats| stats.stopped) => {}
                }
                continue;
            }

            self.dispatch(next);
        }
    }

    /// Hand an admitted item to a detached execution task.
    ///
    /// The task delivers the outcome and releases its slot itself, so it
    /// outlives the drive loop that spawned it.
    fn dispatch(&self, next: Pending<O>) {
        let Pending { id, item, tx } = next;

        self.inner.stats.send_modify(|stats| {
            stats.pending = stats.pending.saturating_sub(1);
            stats.executing += 1;
        });
        metrics::queue_pending().add(-1, &[]);
        self.inner.events.publish(EventKind::Dispatched { id });
        debug!(%id, "dispatched");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let caller = inner.caller.clone();
            let call = tokio::spawn(async move { caller.call(id, &*item).await });
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let reason = panic_reason(join_error);
                    error!(%id, %reason, "execution task panicked");
                    inner.caller.tracker().task_panicked();
                    inner.events.publish(EventKind::Failed {
                        id,
                        error: reason.clone(),
                        attempts: 0,
                    });
                    Err(CallError::Panicked(reason))
                }
            };

            // The handle may have been dropped; the outcome is then discarded.
            let _ = tx.send(outcome);
            inner.stats.send_modify(|stats| {
                stats.executing = stats.executing.saturating_sub(1);
            });
        });
    }

    /// Fail an item at admission without dispatching it.
    fn reject(&self, next: Pending<O>, error: CallError) {
        let Pending { id, tx, .. } = next;
        warn!(%id, error = %error, "item rejected at admission");

        self.inner.caller.tracker().task_rejected(&error);
        self.inner.stats.send_modify(|stats| {
            stats.pending = stats.pending.saturating_sub(1);
        });
        metrics::queue_pending().add(-1, &[]);
        self.inner.events.publish(EventKind::Failed {
            id,
            error: error.to_string(),
            attempts: 0,
        });
        let _ = tx.send(Err(error));
    }

    fn cancel_pending(&self, drain: &mut Drain<'_, O>) {
        let cancelled = drain.pending.len();
        for Pending { id, tx, .. } in drain.pending.drain(..) {
            self.inner.events.publish(EventKind::Cancelled { id });
            let _ = tx.send(Err(CallError::Cancelled));
        }

        self.inner.stats.send_modify(|stats| {
            stats.pending = stats.pending.saturating_sub(cancelled);
        });
        metrics::queue_pending().add(-(cancelled as i64), &[]);
        self.inner.events.publish(EventKind::Stopped {
            pending_cancelled: cancelled,
        });
        info!(
            pending_cancelled = cancelled,
            in_flight = self.stats().executing,
            "stopping: waiting for in-flight calls"
        );
    }
}

/// Resolve once `done` holds for the current stats. The borrow is released
/// before every await so the future stays `Send`.
async fn wait_until(rx: &mut watch::Receiver<QueueStats>, done: impl Fn(&QueueStats) -> bool) {
    loop {
        if done(&rx.borrow_and_update()) {
            return;
        }
        // The sender lives in `Inner`, which outlives every receiver we hand out.
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn panic_reason(join_error: JoinError) -> String {
    if join_error.is_cancelled() {
        return "task cancelled".to_string();
    }
    match join_error.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        }
        Err(e) => e.to_string(),
    }
}
