//! Presentation-facing facade over the synchronization engine.

use crate::client::{FleetApi, FleetClient};
use crate::config::FleetConfig;
use crate::dispatcher::ActionDispatcher;
use crate::notify::{Notification, Notifier};
use crate::scheduler::PollingScheduler;
use crate::selection::{SelectionController, VmView};
use crate::store::{FleetStateStore, StorePhase};
use crate::vm::{ActionKind, SelectionState, SortOrder, VmSummary};
use crate::{Result, log_info, log_warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time;

pub struct FleetEngine {
    store: FleetStateStore,
    scheduler: PollingScheduler,
    dispatcher: ActionDispatcher,
    selection: SelectionController,
    notifier: Notifier,
    interval: Duration,
}

impl FleetEngine {
    /// Wire the engine against the HTTP control plane described by `config`.
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        config.validate()?;
        let client = FleetClient::new(&config.api)?;
        Ok(Self::new(
            Arc::new(client),
            config.view.sort_order(),
            config.polling.interval(),
        ))
    }

    pub fn new(api: Arc<dyn FleetApi>, sort: SortOrder, interval: Duration) -> Self {
        let notifier = Notifier::new();
        let store = FleetStateStore::new(sort);
        let scheduler = PollingScheduler::new(api.clone(), store.clone(), notifier.clone());
        let dispatcher = ActionDispatcher::new(
            api.clone(),
            store.clone(),
            scheduler.clone(),
            notifier.clone(),
        );
        let selection =
            SelectionController::new(api, store.clone(), dispatcher.clone(), notifier.clone());

        Self {
            store,
            scheduler,
            dispatcher,
            selection,
            notifier,
            interval,
        }
    }

    pub fn start(&self) {
        self.scheduler.start(self.interval);
    }

    pub fn shutdown(&self) {
        log_info!("Shutting down fleet engine");
        self.scheduler.stop();
    }

    pub fn summaries(&self) -> Vec<VmSummary> {
        self.store.summaries()
    }

    pub fn selection(&self) -> SelectionState {
        self.store.selection()
    }

    pub fn action_in_flight(&self) -> bool {
        self.store.action_in_flight()
    }

    pub fn phase(&self) -> StorePhase {
        self.store.phase()
    }

    pub fn current_view(&self) -> Option<VmView> {
        self.selection.current_view()
    }

    pub async fn select_vm(&self, vm_id: &str) {
        self.selection.select_vm(vm_id).await;
    }

    pub fn clear_selection(&self) {
        self.selection.clear();
    }

    pub async fn dispatch_action(&self, vm_id: &str, kind: ActionKind) -> Result<()> {
        self.dispatcher.dispatch(vm_id, kind).await
    }

    /// Dispatch an action, then wait up to `wait` for the forced resync to
    /// settle. Returns the VM's summary as the store holds it afterwards.
    pub async fn dispatch_and_resync(
        &self,
        vm_id: &str,
        kind: ActionKind,
        wait: Duration,
    ) -> Result<Option<VmSummary>> {
        let mut notifications = self.notifier.subscribe();
        if let Some(floor) = self.dispatcher.dispatch_tracked(vm_id, kind).await? {
            let settled = time::timeout(wait, async {
                loop {
                    if self.store.applied_sequence() >= floor {
                        return;
                    }
                    match notifications.recv().await {
                        Ok(Notification::PollFailed { sequence, .. }) if sequence >= floor => return,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    }
                }
            })
            .await;
            if settled.is_err() {
                log_warn!(
                    "Resync after {} on '{}' did not settle within {:?}",
                    kind,
                    vm_id,
                    wait
                );
            }
        }
        Ok(self.store.summary(vm_id))
    }

    pub fn set_sort(&self, order: SortOrder) {
        self.store.set_sort(order);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn store(&self) -> &FleetStateStore {
        &self.store
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn selection_controller(&self) -> &SelectionController {
        &self.selection
    }
}

impl Drop for FleetEngine {
    fn drop(&mut self) {
        if self.scheduler.is_running() {
            self.scheduler.stop();
        }
    }
}
