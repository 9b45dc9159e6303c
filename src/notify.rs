//! Typed notifications for the presentation layer.
//!
//! Failures never cross the engine boundary as panics or errors the caller
//! must handle; they are published here for whatever renders them (toast,
//! banner, log line).

use crate::error::FleetError;
use crate::log_debug;
use crate::vm::ActionKind;
use std::fmt;
use tokio::sync::broadcast;

const NOTIFICATION_BUFFER_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    FleetUpdated { sequence: u64, count: usize },
    PollFailed { sequence: u64, error: String },
    DetailFailed { vm_id: String, error: String },
    SelectionCleared { vm_id: String },
    ActionSucceeded { vm_id: String, kind: ActionKind },
    ActionFailed { vm_id: String, kind: ActionKind, error: String },
}

impl Notification {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Notification::PollFailed { .. }
                | Notification::DetailFailed { .. }
                | Notification::ActionFailed { .. }
        )
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::FleetUpdated { sequence, count } => {
                write!(f, "fleet updated (poll #{}, {} VMs)", sequence, count)
            }
            Notification::PollFailed { sequence, error } => {
                write!(f, "poll #{} failed: {}", sequence, error)
            }
            Notification::DetailFailed { vm_id, error } => {
                write!(f, "could not load details for '{}': {}", vm_id, error)
            }
            Notification::SelectionCleared { vm_id } => {
                write!(f, "'{}' is no longer in the fleet", vm_id)
            }
            Notification::ActionSucceeded { vm_id, kind } => {
                write!(f, "{} sent to '{}'", kind.as_str().to_uppercase(), vm_id)
            }
            Notification::ActionFailed { vm_id, kind, error } => {
                write!(f, "{} on '{}' failed: {}", kind, vm_id, error)
            }
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_BUFFER_SIZE);
        Self { sender }
    }

    pub fn publish(&self, notification: Notification) {
        log_debug!("Publishing notification: {}", notification);
        // No subscribers is fine
        let _ = self.sender.send(notification);
    }

    /// Publish an error unless it is stale-response bookkeeping.
    pub(crate) fn publish_error(&self, error: &FleetError, build: impl FnOnce(String) -> Notification) {
        if error.is_stale() {
            return;
        }
        self.publish(build(error.to_string()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
