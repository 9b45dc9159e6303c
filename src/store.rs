//! Authoritative in-memory fleet state and the reconciliation algorithm.
//!
//! All mutation goes through short critical sections on one mutex that is
//! never held across an await. Ordering is enforced by poll sequence numbers
//! and selection tickets: a result is applied only if it is still the newest
//! one by intent, whatever order the network delivered it in.

use crate::client::FleetApi;
use crate::vm::{
    ActionKind, DetailSlot, FleetSnapshot, SelectionState, SortOrder, VmDetail, VmSummary,
};
use crate::{FleetError, Result, log_debug, log_info};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Init,
    LoadingInitial,
    Ready,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub sequence: u64,
    pub added: usize,
    pub removed: usize,
    pub retained: usize,
    /// Number of summaries held after the snapshot was applied.
    pub total: usize,
    /// Id of the selection dropped because it left the fleet.
    pub selection_cleared: Option<String>,
}

#[derive(Debug)]
struct FleetState {
    phase: StorePhase,
    summaries: Vec<VmSummary>,
    applied_sequence: u64,
    sort: SortOrder,
    selection: SelectionState,
    selection_ticket: u64,
    action_in_flight: bool,
}

#[derive(Clone)]
pub struct FleetStateStore {
    state: Arc<Mutex<FleetState>>,
}

impl FleetStateStore {
    pub fn new(sort: SortOrder) -> Self {
        Self {
            state: Arc::new(Mutex::new(FleetState {
                phase: StorePhase::Init,
                summaries: Vec::new(),
                applied_sequence: 0,
                sort,
                selection: SelectionState::None,
                selection_ticket: 0,
                action_in_flight: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        // Poisoning is ignored: no critical section panics mid-transition
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a snapshot if it is newer than the last applied one.
    pub fn reconcile(&self, snapshot: FleetSnapshot) -> Result<ReconcileReport> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if snapshot.sequence <= state.applied_sequence {
            log_debug!(
                "Discarding snapshot #{} (already at #{})",
                snapshot.sequence,
                state.applied_sequence
            );
            return Err(FleetError::StaleResponse {
                sequence: snapshot.sequence,
            });
        }

        let previous: HashSet<&str> = state.summaries.iter().map(|s| s.id.as_str()).collect();
        let incoming: HashSet<&str> = snapshot.summaries.iter().map(|s| s.id.as_str()).collect();
        let retained = incoming.intersection(&previous).count();
        let mut report = ReconcileReport {
            sequence: snapshot.sequence,
            added: incoming.len() - retained,
            removed: previous.len() - retained,
            retained,
            total: snapshot.summaries.len(),
            selection_cleared: None,
        };

        let mut summaries = snapshot.summaries;
        state.sort.apply(&mut summaries);
        state.summaries = summaries;
        state.applied_sequence = snapshot.sequence;

        if let SelectionState::Selected { id, detail } = &mut state.selection {
            match state.summaries.iter().find(|s| s.id == *id) {
                Some(summary) => {
                    if let DetailSlot::Loaded(loaded) = detail {
                        loaded.refresh_summary(summary);
                    }
                }
                None => report.selection_cleared = Some(id.clone()),
            }
        }
        if let Some(id) = &report.selection_cleared {
            log_info!("Selected VM '{}' left the fleet; clearing selection", id);
            state.selection = SelectionState::None;
            state.selection_ticket += 1;
        }

        if matches!(state.phase, StorePhase::Init | StorePhase::LoadingInitial) {
            state.phase = StorePhase::Ready;
        }

        log_debug!(
            "Applied snapshot #{}: +{} -{} ={}",
            report.sequence,
            report.added,
            report.removed,
            report.retained
        );
        Ok(report)
    }

    /// A poll settled with an error; the first one still completes initial loading.
    pub fn record_poll_failure(&self, sequence: u64) {
        let mut state = self.lock();
        if state.phase == StorePhase::LoadingInitial {
            log_debug!("Initial poll #{} failed; store is ready with no data", sequence);
            state.phase = StorePhase::Ready;
        }
    }

    pub fn mark_loading(&self) {
        let mut state = self.lock();
        if state.phase == StorePhase::Init {
            state.phase = StorePhase::LoadingInitial;
        }
    }

    pub fn mark_stopped(&self) {
        self.lock().phase = StorePhase::Stopped;
    }

    /// Select a VM and load its detail. A later selection or clear wins over
    /// this one regardless of which fetch finishes first.
    pub async fn set_selection(&self, api: &dyn FleetApi, vm_id: &str) -> Result<()> {
        let ticket = self.begin_selection(vm_id);
        let result = api.fetch_detail(vm_id).await;
        self.complete_selection(ticket, result)
    }

    pub(crate) fn begin_selection(&self, vm_id: &str) -> u64 {
        let mut state = self.lock();
        state.selection_ticket += 1;
        state.selection = SelectionState::Selected {
            id: vm_id.to_string(),
            detail: DetailSlot::Pending,
        };
        state.selection_ticket
    }

    pub(crate) fn complete_selection(&self, ticket: u64, result: Result<VmDetail>) -> Result<()> {
        let mut state = self.lock();
        if ticket != state.selection_ticket {
            log_debug!(
                "Dropping detail for abandoned selection ticket {} (current {})",
                ticket,
                state.selection_ticket
            );
            return Err(FleetError::StaleResponse { sequence: ticket });
        }

        let SelectionState::Selected { id, detail } = &mut state.selection else {
            return Err(FleetError::StaleResponse { sequence: ticket });
        };

        let result = result.and_then(|loaded| {
            if loaded.id() == id.as_str() {
                Ok(loaded)
            } else {
                Err(FleetError::Validation(format!(
                    "requested '{}' but received '{}'",
                    id,
                    loaded.id()
                )))
            }
        });

        match result {
            Ok(loaded) => {
                *detail = DetailSlot::Loaded(loaded);
                Ok(())
            }
            Err(err) => {
                *detail = DetailSlot::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Drop the selection; any outstanding detail fetch becomes stale.
    pub fn clear_selection(&self) -> Option<String> {
        let mut state = self.lock();
        state.selection_ticket += 1;
        match std::mem::take(&mut state.selection) {
            SelectionState::Selected { id, .. } => Some(id),
            SelectionState::None => None,
        }
    }

    /// Re-sort the current list in place. No network round trip.
    pub fn set_sort(&self, order: SortOrder) {
        let mut state = self.lock();
        state.sort = order;
        let FleetState { sort, summaries, .. } = &mut *state;
        sort.apply(summaries);
    }

    /// Claim the action slot. The flag stays set until the guard is dropped,
    /// including when the dispatching future is cancelled mid-request.
    pub(crate) fn try_begin_action(&self, vm_id: &str, kind: ActionKind) -> Result<ActionGuard> {
        let mut state = self.lock();
        if state.action_in_flight {
            return Err(FleetError::ActionInFlight {
                vm_id: vm_id.to_string(),
                kind,
            });
        }
        state.action_in_flight = true;
        Ok(ActionGuard {
            store: self.clone(),
        })
    }

    fn finish_action(&self) {
        self.lock().action_in_flight = false;
    }

    pub fn summaries(&self) -> Vec<VmSummary> {
        self.lock().summaries.clone()
    }

    pub fn summary(&self, vm_id: &str) -> Option<VmSummary> {
        self.lock().summaries.iter().find(|s| s.id == vm_id).cloned()
    }

    pub fn selection(&self) -> SelectionState {
        self.lock().selection.clone()
    }

    pub fn action_in_flight(&self) -> bool {
        self.lock().action_in_flight
    }

    pub fn phase(&self) -> StorePhase {
        self.lock().phase
    }

    pub fn sort_order(&self) -> SortOrder {
        self.lock().sort
    }

    pub fn applied_sequence(&self) -> u64 {
        self.lock().applied_sequence
    }
}

/// Holds the global action slot for one outstanding request.
pub(crate) struct ActionGuard {
    store: FleetStateStore,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.store.finish_action();
    }
}

impl Default for FleetStateStore {
    fn default() -> Self {
        Self::new(SortOrder::default())
    }
}
