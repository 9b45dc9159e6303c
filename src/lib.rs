pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logger;
pub mod notify;
pub mod scheduler;
pub mod selection;
pub mod store;
pub mod vm;

pub use error::FleetError;
pub use vm::{ActionKind, SelectionState, SortDirection, SortKey, SortOrder, VmDetail, VmSummary};

pub type Result<T> = std::result::Result<T, FleetError>;

// Convenience re-exports for the engine components
pub use client::{FleetApi, FleetClient};
pub use engine::FleetEngine;
pub use notify::{Notification, Notifier};
pub use scheduler::PollingScheduler;
pub use store::{FleetStateStore, StorePhase};
