use crate::client::FleetApi;
use crate::notify::{Notification, Notifier};
use crate::scheduler::PollingScheduler;
use crate::store::FleetStateStore;
use crate::vm::{ActionKind, ActionRequest};
use crate::{Result, log_info, log_warn};
use std::sync::Arc;

/// Submits one lifecycle action at a time and resynchronizes afterwards.
///
/// Actions are one-shot and never retried: repeating a `restart` behind the
/// operator's back would restart the machine twice.
#[derive(Clone)]
pub struct ActionDispatcher {
    api: Arc<dyn FleetApi>,
    store: FleetStateStore,
    scheduler: PollingScheduler,
    notifier: Notifier,
}

impl ActionDispatcher {
    pub fn new(
        api: Arc<dyn FleetApi>,
        store: FleetStateStore,
        scheduler: PollingScheduler,
        notifier: Notifier,
    ) -> Self {
        Self {
            api,
            store,
            scheduler,
            notifier,
        }
    }

    /// Submit `kind` for `vm_id`. Fails without touching the network when
    /// another action is still outstanding.
    pub async fn dispatch(&self, vm_id: &str, kind: ActionKind) -> Result<()> {
        self.dispatch_tracked(vm_id, kind).await.map(|_| ())
    }

    /// Like [`dispatch`](Self::dispatch), also returning the first poll
    /// sequence that observes the fleet after the action was answered.
    pub async fn dispatch_tracked(&self, vm_id: &str, kind: ActionKind) -> Result<Option<u64>> {
        let guard = match self.store.try_begin_action(vm_id, kind) {
            Ok(guard) => guard,
            Err(err) => {
                log_warn!("Refusing {} on '{}': an action is already in flight", kind, vm_id);
                return Err(err);
            }
        };

        let request = ActionRequest::new(vm_id, kind);
        log_info!(
            "Submitting {} for VM '{}' (request {})",
            kind,
            vm_id,
            request.request_id
        );
        let result = self.api.submit_action(&request).await;

        drop(guard);
        let resync = self.scheduler.resync();

        match result {
            Ok(()) => {
                log_info!("{} accepted for VM '{}'", kind, vm_id);
                self.notifier.publish(Notification::ActionSucceeded {
                    vm_id: vm_id.to_string(),
                    kind,
                });
                Ok(resync)
            }
            Err(err) => {
                log_warn!("{} failed for VM '{}': {}", kind, vm_id, err);
                self.notifier.publish_error(&err, |error| Notification::ActionFailed {
                    vm_id: vm_id.to_string(),
                    kind,
                    error,
                });
                Err(err)
            }
        }
    }

    pub fn action_in_flight(&self) -> bool {
        self.store.action_in_flight()
    }
}
