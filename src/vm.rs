use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Running,
    ShutOff,
    Paused,
    Other(String),
}

impl VmState {
    /// Map a control-plane state label (libvirt vocabulary) onto a state.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "running" => VmState::Running,
            "shutoff" | "shut-off" | "shut off" | "stopped" => VmState::ShutOff,
            "paused" => VmState::Paused,
            other => VmState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VmState::Running => "running",
            VmState::ShutOff => "shut-off",
            VmState::Paused => "paused",
            VmState::Other(label) => label.as_str(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub cpu_allocation: u32,
    pub memory_mb: u64,
    pub observed_at: DateTime<Utc>,
}

impl VmSummary {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            self.name.as_str()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub device: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<String>,
    #[serde(default)]
    pub addresses: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDetail {
    pub summary: VmSummary,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl VmDetail {
    pub fn id(&self) -> &str {
        &self.summary.id
    }

    /// Replace the summary-level fields while keeping disks, interfaces and metadata.
    pub fn refresh_summary(&mut self, summary: &VmSummary) {
        self.summary = summary.clone();
    }
}

/// One complete listing, tagged with the poll sequence that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSnapshot {
    pub sequence: u64,
    pub summaries: Vec<VmSummary>,
}

impl FleetSnapshot {
    pub fn new(sequence: u64, summaries: Vec<VmSummary>) -> Self {
        Self { sequence, summaries }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailSlot {
    Pending,
    Loaded(VmDetail),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionState {
    #[default]
    None,
    Selected { id: String, detail: DetailSlot },
}

impl SelectionState {
    pub fn selected_id(&self) -> Option<&str> {
        match self {
            SelectionState::None => None,
            SelectionState::Selected { id, .. } => Some(id.as_str()),
        }
    }

    pub fn detail(&self) -> Option<&VmDetail> {
        match self {
            SelectionState::Selected {
                detail: DetailSlot::Loaded(detail),
                ..
            } => Some(detail),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SelectionState::Selected {
                detail: DetailSlot::Pending,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Start,
    Stop,
    Restart,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::Restart => "restart",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub request_id: Uuid,
    pub vm_id: String,
    pub kind: ActionKind,
    pub submitted_at: DateTime<Utc>,
}

impl ActionRequest {
    pub fn new(vm_id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            vm_id: vm_id.into(),
            kind,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortKey {
    #[default]
    Name,
    ObservedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortOrder {
    #[serde(default)]
    pub key: SortKey,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortOrder {
    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        Self { key, direction }
    }

    pub fn compare(&self, a: &VmSummary, b: &VmSummary) -> Ordering {
        let ordering = match self.key {
            SortKey::Name => compare_names(&a.name, &b.name),
            SortKey::ObservedAt => a.observed_at.cmp(&b.observed_at),
        };
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }

    /// Stable: summaries equal under the key keep their incoming order.
    pub fn apply(&self, summaries: &mut [VmSummary]) {
        summaries.sort_by(|a, b| self.compare(a, b));
    }
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}
