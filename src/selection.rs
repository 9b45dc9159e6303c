use crate::client::FleetApi;
use crate::dispatcher::ActionDispatcher;
use crate::notify::{Notification, Notifier};
use crate::store::FleetStateStore;
use crate::vm::{ActionKind, SelectionState, VmDetail};
use crate::{Result, log_debug, log_warn};
use std::sync::Arc;

/// Loaded detail of the selected VM, bound to the dispatcher that acts on it.
#[derive(Clone)]
pub struct VmView {
    pub detail: VmDetail,
    dispatcher: ActionDispatcher,
}

impl VmView {
    pub fn id(&self) -> &str {
        self.detail.id()
    }

    pub async fn dispatch(&self, kind: ActionKind) -> Result<()> {
        self.dispatcher.dispatch(self.detail.id(), kind).await
    }

    pub fn actions_enabled(&self) -> bool {
        !self.dispatcher.action_in_flight()
    }
}

#[derive(Clone)]
pub struct SelectionController {
    api: Arc<dyn FleetApi>,
    store: FleetStateStore,
    dispatcher: ActionDispatcher,
    notifier: Notifier,
}

impl SelectionController {
    pub fn new(
        api: Arc<dyn FleetApi>,
        store: FleetStateStore,
        dispatcher: ActionDispatcher,
        notifier: Notifier,
    ) -> Self {
        Self {
            api,
            store,
            dispatcher,
            notifier,
        }
    }

    /// Select `vm_id` and load its detail. Failures land in the selection
    /// slot and are notified; results of abandoned selections are dropped.
    pub async fn select_vm(&self, vm_id: &str) {
        match self.store.set_selection(self.api.as_ref(), vm_id).await {
            Ok(()) => log_debug!("Loaded details for VM '{}'", vm_id),
            Err(err) if err.is_stale() => {
                log_debug!("Detail for '{}' arrived after the selection moved on", vm_id)
            }
            Err(err) => {
                log_warn!("Failed to load details for VM '{}': {}", vm_id, err);
                self.notifier.publish(Notification::DetailFailed {
                    vm_id: vm_id.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    /// Re-fetch the detail of the current selection, if any.
    pub async fn refresh(&self) {
        let selected = self.store.selection().selected_id().map(str::to_string);
        if let Some(vm_id) = selected {
            self.select_vm(&vm_id).await;
        }
    }

    pub fn clear(&self) {
        if let Some(vm_id) = self.store.clear_selection() {
            log_debug!("Cleared selection of VM '{}'", vm_id);
        }
    }

    pub fn selection(&self) -> SelectionState {
        self.store.selection()
    }

    pub fn current_view(&self) -> Option<VmView> {
        self.store.selection().detail().cloned().map(|detail| VmView {
            detail,
            dispatcher: self.dispatcher.clone(),
        })
    }
}
