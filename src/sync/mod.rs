//! Sync engine.
//!
//! Drains the durable queue through a [`Delivery`] collaborator, one item at
//! a time in enqueue order. The engine is `Idle`, `Draining` (exactly one pass
//! running) or `Backoff` (a retry alarm is armed). Triggers that arrive while
//! a pass is running are coalesced away.
//!
//! An item leaves the store only after the collaborator acknowledges it.
//! Retryable failures bump the persisted attempt count and leave the item
//! pending; permanent failures mark it `Failed` and it is skipped by later
//! passes until it is requeued.

mod backoff;
mod delivery;
mod timer;

pub use backoff::Backoff;
pub use delivery::{Delivery, JournalDelivery};
pub use timer::RetryTimer;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::QueueError;
use crate::models::{EngineState, ItemId, ItemStatus, QueueItem, SyncEvent, Trigger};
use crate::store::QueueStore;

const EVENT_CAPACITY: usize = 256;

/// Tuning for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on a single delivery attempt; exceeding it is retryable.
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Request a pass when the queue is opened online with items waiting.
    pub sync_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            sync_on_start: true,
        }
    }
}

#[derive(Debug, Default)]
struct PassReport {
    delivered: usize,
    rejected: usize,
    retryable: usize,
    storage_errors: usize,
    offline: bool,
    cancelled: bool,
}

impl PassReport {
    fn needs_retry(&self) -> bool {
        self.retryable > 0 || self.storage_errors > 0
    }

    fn is_clean(&self) -> bool {
        !self.needs_retry() && !self.offline && !self.cancelled
    }
}

enum Attempt {
    Delivered,
    Rejected,
    Retry { offline: bool },
    Busy,
    Discarded,
    StorageError,
}

struct Control {
    backoff: Backoff,
    timer: RetryTimer,
    /// Cancelled and replaced by `cancel`; passes and alarms hold child tokens.
    epoch: CancellationToken,
}

struct Inner {
    store: Arc<QueueStore>,
    delivery: Arc<dyn Delivery>,
    monitor: ConnectivityMonitor,
    attempt_timeout: Duration,
    runtime: Handle,
    state: watch::Sender<EngineState>,
    in_flight: Mutex<HashSet<ItemId>>,
    /// Set when an item was enqueued or requeued during a pass.
    rerun: AtomicBool,
    control: Mutex<Control>,
    events: broadcast::Sender<SyncEvent>,
}

/// Cheaply cloneable handle to the process-wide sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; passes and retry alarms
    /// are spawned onto it.
    pub fn new(
        store: Arc<QueueStore>,
        delivery: Arc<dyn Delivery>,
        monitor: ConnectivityMonitor,
        config: &SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                delivery,
                monitor,
                attempt_timeout: config.attempt_timeout,
                runtime: Handle::current(),
                state,
                in_flight: Mutex::new(HashSet::new()),
                rerun: AtomicBool::new(false),
                control: Mutex::new(Control {
                    backoff: Backoff::new(config.backoff_base, config.backoff_max),
                    timer: RetryTimer::default(),
                    epoch: CancellationToken::new(),
                }),
                events,
            }),
        }
    }

    /// Ask for a drain pass. Returns `true` if a pass was started.
    ///
    /// Only an idle engine starts a pass, except that a retry alarm or a
    /// restored connection may end a backoff wait early.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        self.inner.trigger(trigger)
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until no pass is running and return the state it settled in.
    pub async fn settled(&self) -> EngineState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|s| *s != EngineState::Draining).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub fn is_in_flight(&self, id: ItemId) -> bool {
        self.inner.lock_in_flight().contains(&id)
    }

    /// Abandon the running pass and any armed retry.
    ///
    /// An attempt still in flight is abandoned and its result discarded.
    pub fn cancel(&self) {
        {
            let mut control = self.inner.control();
            std::mem::replace(&mut control.epoch, CancellationToken::new()).cancel();
            control.timer.cancel();
            control.backoff.reset();
            self.inner.state.send_if_modified(|state| {
                if *state == EngineState::Backoff {
                    *state = EngineState::Idle;
                    true
                } else {
                    false
                }
            });
        }
        info!("sync cancelled, retry schedule reset");
        self.inner.emit(SyncEvent::Cleared);
    }
}

impl Inner {
    fn trigger(self: &Arc<Self>, trigger: Trigger) -> bool {
        let mut started = false;
        self.state.send_if_modified(|state| {
            let allowed = match *state {
                EngineState::Idle => true,
                EngineState::Backoff => {
                    matches!(trigger, Trigger::RetryTimer | Trigger::ConnectivityRestored)
                }
                EngineState::Draining => {
                    // The pass may already be past its last read of the store.
                    if matches!(trigger, Trigger::Enqueued | Trigger::Manual) {
                        self.rerun.store(true, Ordering::SeqCst);
                    }
                    false
                }
            };
            if allowed {
                *state = EngineState::Draining;
                started = true;
            }
            allowed
        });
        if !started {
            let state = *self.state.borrow();
            debug!(?trigger, ?state, "sync trigger coalesced");
            return false;
        }
        if trigger == Trigger::ConnectivityRestored {
            self.control().timer.cancel();
        }
        self.spawn_pass(trigger);
        true
    }

    fn spawn_pass(self: &Arc<Self>, trigger: Trigger) {
        let engine = Arc::clone(self);
        self.runtime.spawn(async move { engine.run_pass(trigger).await });
    }

    async fn run_pass(self: Arc<Self>, trigger: Trigger) {
        let cancel = self.control().epoch.child_token();
        debug!(?trigger, "drain pass started");
        self.emit(SyncEvent::PassStarted { trigger });

        let report = self.drain(&cancel).await;
        info!(
            ?trigger,
            delivered = report.delivered,
            rejected = report.rejected,
            retryable = report.retryable,
            storage_errors = report.storage_errors,
            offline = report.offline,
            "drain pass finished"
        );
        self.emit(SyncEvent::PassFinished {
            delivered: report.delivered,
            rejected: report.rejected,
            retryable: report.retryable,
        });
        self.finish(&cancel, &report);
    }

    async fn drain(&self, cancel: &CancellationToken) -> PassReport {
        let mut report = PassReport::default();
        let mut seen = HashSet::new();
        // Re-read after each batch so items enqueued mid-pass are picked up.
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let items = match self.store.list_all().await {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "could not read queue");
                    report.storage_errors += 1;
                    return report;
                }
            };
            let batch: Vec<QueueItem> = items
                .into_iter()
                .filter(|item| !item.is_failed() && seen.insert(item.id))
                .collect();
            if batch.is_empty() {
                return report;
            }
            for item in batch {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return report;
                }
                if !self.monitor.is_online() {
                    debug!("offline, ending drain pass");
                    report.offline = true;
                    return report;
                }
                let id = item.id;
                match self.attempt(item, cancel).await {
                    Attempt::Delivered => report.delivered += 1,
                    Attempt::Rejected => {
                        report.rejected += 1;
                        // Eligible again in this pass if it is requeued.
                        seen.remove(&id);
                    }
                    Attempt::Retry { offline } => {
                        report.retryable += 1;
                        if offline {
                            report.offline = true;
                            return report;
                        }
                    }
                    Attempt::Busy => {}
                    Attempt::Discarded => {
                        report.cancelled = true;
                        return report;
                    }
                    Attempt::StorageError => report.storage_errors += 1,
                }
                tokio::task::yield_now().await;
            }
        }
    }

    async fn attempt(&self, mut item: QueueItem, cancel: &CancellationToken) -> Attempt {
        if !self.lock_in_flight().insert(item.id) {
            debug!(id = %item.id, "item already in flight");
            return Attempt::Busy;
        }
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,

            result = tokio::time::timeout(
                self.attempt_timeout,
                self.delivery.submit(item.id, &item.payload),
            ) => Some(result),
        };
        self.lock_in_flight().remove(&item.id);

        let Some(outcome) = outcome.filter(|_| !cancel.is_cancelled()) else {
            debug!(id = %item.id, "queue cleared during attempt, result discarded");
            return Attempt::Discarded;
        };

        let (error, offline) = match outcome {
            Ok(Ok(())) => return self.complete(item.id).await,
            Ok(Err(err)) => {
                let offline = err.is_offline();
                (QueueError::from(err), offline)
            }
            Err(_) => (QueueError::Timeout(self.attempt_timeout), false),
        };
        let offline = offline || !self.monitor.is_online();
        let retryable = error.is_retryable();

        item.attempt_count = item.attempt_count.saturating_add(1);
        let reason = match &error {
            QueueError::PermanentDelivery(reason) => reason.clone(),
            other => other.to_string(),
        };
        if !retryable {
            item.status = ItemStatus::Failed(reason.clone());
        }
        warn!(
            id = %item.id,
            attempt = item.attempt_count,
            retryable,
            error = %error,
            "delivery attempt failed"
        );
        if let Err(e) = self.store.replace(&item).await {
            warn!(id = %item.id, error = %e, "could not persist failed attempt");
            return Attempt::StorageError;
        }
        self.emit(SyncEvent::AttemptFailed {
            id: item.id,
            attempt_count: item.attempt_count,
            reason,
            retryable,
        });
        if retryable {
            Attempt::Retry { offline }
        } else {
            Attempt::Rejected
        }
    }

    async fn complete(&self, id: ItemId) -> Attempt {
        match self.store.remove(id).await {
            Ok(_) => {
                debug!(%id, "item delivered");
                self.emit(SyncEvent::Delivered { id });
                Attempt::Delivered
            }
            Err(e) => {
                warn!(%id, error = %e, "delivered item could not be removed");
                Attempt::StorageError
            }
        }
    }

    fn finish(self: &Arc<Self>, cancel: &CancellationToken, report: &PassReport) {
        let mut control = self.control();
        let cleared = cancel.is_cancelled();
        if !cleared && report.needs_retry() {
            self.rerun.store(false, Ordering::SeqCst);
            let delay = control.backoff.next_delay();
            // Enter Backoff before arming so an immediate alarm is not coalesced.
            self.state.send_replace(EngineState::Backoff);
            let engine = Arc::downgrade(self);
            let alarm = control.epoch.child_token();
            control.timer.arm(&self.runtime, alarm, delay, async move {
                if let Some(engine) = engine.upgrade() {
                    engine.trigger(Trigger::RetryTimer);
                }
            });
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(delay_ms, "retry scheduled");
            self.emit(SyncEvent::BackoffScheduled { delay_ms });
            return;
        }
        if report.is_clean() {
            control.backoff.reset();
        }

        // Decided under the state lock so an enqueue racing with the end of
        // the pass either sees Draining and sets `rerun`, or sees Idle.
        let can_rerun = !report.offline && self.monitor.is_online();
        let mut rerun = false;
        self.state.send_if_modified(|state| {
            rerun = self.rerun.swap(false, Ordering::SeqCst) && can_rerun;
            if rerun {
                false
            } else {
                *state = EngineState::Idle;
                true
            }
        });
        if rerun {
            debug!("items arrived after the last read, draining again");
            self.spawn_pass(Trigger::Enqueued);
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<ItemId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
