use crate::vm::ActionKind;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote API returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Stale response for sequence {sequence} discarded")]
    StaleResponse { sequence: u64 },

    #[error("Malformed response: {0}")]
    Validation(String),

    #[error("Another action is in flight; refusing {kind} on '{vm_id}'")]
    ActionInFlight { vm_id: String, kind: ActionKind },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FleetError {
    /// Stale results are internal bookkeeping and never reach the operator.
    pub fn is_stale(&self) -> bool {
        matches!(self, FleetError::StaleResponse { .. })
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FleetError::Network(format!("request timed out: {}", err))
        } else if err.is_decode() {
            FleetError::Validation(err.to_string())
        } else {
            FleetError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Validation(err.to_string())
    }
}
