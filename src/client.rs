//! Remote control-plane access.
//!
//! `FleetApi` is the seam the engine talks to; `FleetClient` is the HTTP
//! implementation against the `/vms` endpoints.

use crate::config::ApiConfig;
use crate::error::FleetError;
use crate::vm::{ActionRequest, Disk, NetworkInterface, VmDetail, VmState, VmSummary};
use crate::{Result, log_debug};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// The three remote operations the engine depends on.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// List every VM summary, in server order.
    async fn list_summaries(&self) -> Result<Vec<VmSummary>>;

    /// Fetch the full detail of one VM.
    async fn fetch_detail(&self, vm_id: &str) -> Result<VmDetail>;

    /// Submit one lifecycle action. Success carries no payload.
    async fn submit_action(&self, request: &ActionRequest) -> Result<()>;
}

pub struct FleetClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl FleetClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| FleetError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FleetError::Config(format!("base URL '{}' cannot have a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(FleetError::Remote {
            status: status.as_u16(),
            message: message.trim().to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        log_debug!("GET {}", url);
        let response = self.send(self.http.get(url)).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl FleetApi for FleetClient {
    async fn list_summaries(&self) -> Result<Vec<VmSummary>> {
        let url = self.endpoint(&["vms"])?;
        // An empty fleet is encoded as `null`
        let records: Option<Vec<WireVm>> = self.get_json(url).await?;
        let observed = Utc::now();
        let summaries = records
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.into_summary(observed))
            .collect::<Result<Vec<_>>>()?;
        ensure_unique_ids(&summaries)?;
        Ok(summaries)
    }

    async fn fetch_detail(&self, vm_id: &str) -> Result<VmDetail> {
        let url = self.endpoint(&["vms", vm_id])?;
        let record: WireVm = self.get_json(url).await?;
        record.into_detail(Utc::now())
    }

    async fn submit_action(&self, request: &ActionRequest) -> Result<()> {
        let url = self.endpoint(&["vms", request.vm_id.as_str(), request.kind.as_str()])?;
        log_debug!("POST {} (request {})", url, request.request_id);
        self.send(self.http.post(url)).await?;
        Ok(())
    }
}

fn ensure_unique_ids(summaries: &[VmSummary]) -> Result<()> {
    let mut seen = HashSet::with_capacity(summaries.len());
    for summary in summaries {
        if !seen.insert(summary.id.as_str()) {
            return Err(FleetError::Validation(format!(
                "VM id '{}' is listed more than once",
                summary.id
            )));
        }
    }
    Ok(())
}

pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| FleetError::Config(format!("invalid base URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FleetError::Config(format!(
            "unsupported URL scheme '{}' in '{}'",
            scheme, raw
        ))),
    }
}

/// VM record as reported by the control plane.
#[derive(Debug, Deserialize)]
struct WireVm {
    #[serde(alias = "id")]
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    cpu_allocation: u32,
    /// KiB, as libvirt reports it.
    #[serde(default)]
    memory_allocation: u64,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    disks: Option<Vec<WireDisk>>,
    #[serde(default)]
    interfaces: Option<Vec<WireInterface>>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireDisk {
    device: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct WireInterface {
    name: String,
    #[serde(default)]
    mac: Option<String>,
    #[serde(default, alias = "addresses")]
    addrs: Option<Vec<String>>,
}

impl WireVm {
    fn into_summary(self, observed: DateTime<Utc>) -> Result<VmSummary> {
        if self.uuid.trim().is_empty() {
            return Err(FleetError::Validation(format!(
                "VM record '{}' has an empty id",
                self.name
            )));
        }

        let observed_at = match self.timestamp.as_deref().map(str::trim) {
            None | Some("") => observed,
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    FleetError::Validation(format!("bad timestamp '{}' for '{}': {}", raw, self.uuid, e))
                })?,
        };

        Ok(VmSummary {
            id: self.uuid,
            name: self.name,
            state: VmState::from_label(&self.state),
            cpu_allocation: self.cpu_allocation,
            memory_mb: self.memory_allocation / 1024,
            observed_at,
        })
    }

    fn into_detail(mut self, observed: DateTime<Utc>) -> Result<VmDetail> {
        let disks = self
            .disks
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|d| Disk {
                device: d.device,
                path: d.path,
            })
            .collect();
        let interfaces = self
            .interfaces
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|i| NetworkInterface {
                name: i.name,
                mac: i.mac,
                addresses: i.addrs.unwrap_or_default().into_iter().collect(),
            })
            .collect();
        let metadata = flatten_metadata(self.metadata.take());

        Ok(VmDetail {
            summary: self.into_summary(observed)?,
            disks,
            interfaces,
            metadata,
        })
    }
}

fn flatten_metadata(value: Option<serde_json::Value>) -> BTreeMap<String, String> {
    match value {
        Some(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}
