use crate::client::parse_base_url;
use crate::vm::{SortDirection, SortKey, SortOrder};
use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "fleetview.toml";
pub const TOKEN_ENV_VAR: &str = "FLEETVIEW_API_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub view: ViewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Control-plane root; `/vms` is appended to it.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Deadline for every request, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Opaque bearer token; falls back to `FLEETVIEW_API_TOKEN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ViewConfig {
    #[serde(default)]
    pub sort_key: SortKey,
    #[serde(default)]
    pub sort_direction: SortDirection,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            token: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_interval_ms() -> u64 {
    5_000
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ViewConfig {
    pub fn sort_order(&self) -> SortOrder {
        SortOrder::new(self.sort_key, self.sort_direction)
    }
}

impl FleetConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: FleetConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| FleetError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// The explicit path if it exists, else the per-user config file, else nothing.
    pub fn locate(explicit: &Path) -> Option<PathBuf> {
        if explicit.exists() {
            return Some(explicit.to_path_buf());
        }
        dirs::config_dir()
            .map(|dir| dir.join("fleetview").join(DEFAULT_CONFIG_FILE))
            .filter(|path| path.exists())
    }

    /// Fill the token from the environment when the file does not set one.
    pub fn apply_env(&mut self) {
        if self.api.token.is_none() {
            self.api.token = std::env::var(TOKEN_ENV_VAR)
                .ok()
                .filter(|token| !token.trim().is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_base_url(&self.api.base_url)?;
        if self.api.timeout_ms == 0 {
            return Err(FleetError::Config("api.timeout_ms must be greater than zero".into()));
        }
        if self.polling.interval_ms == 0 {
            return Err(FleetError::Config(
                "polling.interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
