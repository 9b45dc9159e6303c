//! Periodic fleet polling.
//!
//! Every pass is stamped with a strictly increasing sequence number before it
//! is dispatched, and at most one fetch is ever in flight. A scheduled tick
//! that lands while a fetch is outstanding is skipped; a forced tick is
//! remembered and run once the outstanding fetch settles.

use crate::client::FleetApi;
use crate::notify::{Notification, Notifier};
use crate::store::FleetStateStore;
use crate::vm::{FleetSnapshot, VmSummary};
use crate::{Result, log_debug, log_info, log_warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Scheduled,
    Forced,
}

#[derive(Debug, Default)]
struct TickState {
    next_sequence: u64,
    in_flight: Option<u64>,
    force_pending: bool,
    stopped: bool,
}

enum Dispatch {
    Started(PendingTick),
    /// Folded into the in-flight poll; a follow-up pass runs after it.
    Queued { behind: u64 },
    Skipped,
}

struct SchedulerInner {
    api: Arc<dyn FleetApi>,
    store: FleetStateStore,
    notifier: Notifier,
    ticks: Mutex<TickState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Handle on one dispatched poll.
pub struct PendingTick {
    pub sequence: u64,
    handle: JoinHandle<()>,
}

impl PendingTick {
    /// Wait for the poll to settle and its result to be applied or reported.
    pub async fn settled(self) {
        if let Err(err) = self.handle.await {
            log_warn!("Poll #{} task ended abnormally: {}", self.sequence, err);
        }
    }
}

#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<SchedulerInner>,
}

impl PollingScheduler {
    pub fn new(api: Arc<dyn FleetApi>, store: FleetStateStore, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                api,
                store,
                notifier,
                ticks: Mutex::new(TickState::default()),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Begin ticking every `interval`, the first tick immediately.
    pub fn start(&self, interval: Duration) {
        let mut driver = lock(&self.inner.driver);
        if driver.is_some() {
            log_warn!("Polling scheduler already started");
            return;
        }
        if interval.is_zero() {
            log_warn!("Refusing to poll with a zero interval");
            return;
        }
        if lock(&self.inner.ticks).stopped {
            log_warn!("Polling scheduler was stopped and cannot be restarted");
            return;
        }

        log_info!("Polling fleet every {:?}", interval);
        self.inner.store.mark_loading();

        let scheduler = self.clone();
        *driver = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                scheduler.dispatch(TickKind::Scheduled);
            }
        }));
    }

    /// Cancel all future ticks. An in-flight fetch is left to settle.
    pub fn stop(&self) {
        lock(&self.inner.ticks).stopped = true;
        if let Some(driver) = lock(&self.inner.driver).take() {
            driver.abort();
        }
        self.inner.store.mark_stopped();
        log_info!("Polling scheduler stopped");
    }

    /// Run one scheduled pass now, unless a fetch is already in flight.
    pub fn tick(&self) -> Option<PendingTick> {
        self.dispatch(TickKind::Scheduled).started()
    }

    /// Request an out-of-band pass. Coalesced with an in-flight fetch: at most
    /// one extra pass runs after it settles.
    pub fn force_tick(&self) -> Option<PendingTick> {
        self.dispatch(TickKind::Forced).started()
    }

    /// Force a pass and return the lowest poll sequence whose result is
    /// fetched after this call. `None` once the scheduler is stopped.
    pub fn resync(&self) -> Option<u64> {
        match self.dispatch(TickKind::Forced) {
            Dispatch::Started(pending) => Some(pending.sequence),
            Dispatch::Queued { behind } => Some(behind + 1),
            Dispatch::Skipped => None,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.driver).is_some()
    }

    pub fn in_flight(&self) -> Option<u64> {
        lock(&self.inner.ticks).in_flight
    }

    fn dispatch(&self, kind: TickKind) -> Dispatch {
        let sequence = {
            let mut ticks = lock(&self.inner.ticks);
            if ticks.stopped {
                log_debug!("Ignoring {:?} tick after stop", kind);
                return Dispatch::Skipped;
            }
            if let Some(current) = ticks.in_flight {
                log_debug!("Skipping {:?} tick; poll #{} still in flight", kind, current);
                if kind == TickKind::Forced {
                    ticks.force_pending = true;
                    return Dispatch::Queued { behind: current };
                }
                return Dispatch::Skipped;
            }
            ticks.next_sequence += 1;
            ticks.in_flight = Some(ticks.next_sequence);
            ticks.next_sequence
        };

        log_debug!("Dispatching poll #{} ({:?})", sequence, kind);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let result = scheduler.inner.api.list_summaries().await;
            scheduler.settle(sequence, result);
        });

        Dispatch::Started(PendingTick { sequence, handle })
    }

    fn settle(&self, sequence: u64, result: Result<Vec<VmSummary>>) {
        let inner = &self.inner;
        match result {
            Ok(summaries) => match inner.store.reconcile(FleetSnapshot::new(sequence, summaries)) {
                Ok(report) => {
                    if let Some(vm_id) = report.selection_cleared.clone() {
                        inner.notifier.publish(Notification::SelectionCleared { vm_id });
                    }
                    inner.notifier.publish(Notification::FleetUpdated {
                        sequence,
                        count: report.total,
                    });
                }
                Err(err) => log_debug!("Poll #{} not applied: {}", sequence, err),
            },
            Err(err) => {
                log_warn!("Poll #{} failed: {}", sequence, err);
                inner.store.record_poll_failure(sequence);
                inner
                    .notifier
                    .publish_error(&err, |error| Notification::PollFailed { sequence, error });
            }
        }

        let rerun = {
            let mut ticks = lock(&inner.ticks);
            if ticks.in_flight == Some(sequence) {
                ticks.in_flight = None;
            }
            std::mem::take(&mut ticks.force_pending)
        };
        if rerun {
            log_debug!("Running coalesced forced poll after #{}", sequence);
            self.dispatch(TickKind::Forced);
        }
    }
}

impl Dispatch {
    fn started(self) -> Option<PendingTick> {
        match self {
            Dispatch::Started(pending) => Some(pending),
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
