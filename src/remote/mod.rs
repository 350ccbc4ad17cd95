pub mod powershell;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// Remote execution over WS-Management; runs the collector bundle in one session.
    WinRm,
    /// Query-only DCOM/RPC path; every collector is an independent call.
    Rpc,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::WinRm => write!(f, "WinRM"),
            Transport::Rpc => write!(f, "RPC"),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote call failed: {0}")]
    Failed(String),
    #[error("unexpected remote output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQuery {
    pub channel: &'static str,
    pub event_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub domain: Option<String>,
    pub os_name: Option<String>,
    pub os_build: Option<String>,
    pub last_boot_unix: Option<i64>,
    pub total_ram_gb: Option<f64>,
    pub free_ram_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeStat {
    #[serde(default)]
    pub name: String,
    pub size_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionStatus {
    pub last_quick_scan_unix: Option<i64>,
    pub recent_detections: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultArtifacts {
    pub archived_reports: Option<u64>,
    pub crash_dumps: Option<u64>,
}

/// What the remote bundle should gather besides the required collectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleRequest {
    pub since_unix: i64,
    pub security: bool,
    pub crash_artifacts: bool,
    pub updates: bool,
}

/// Everything one bundle execution can report. Keys of `errors` name the
/// collector that failed inside an otherwise healthy session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawBundle {
    #[serde(default)]
    pub fields: CollectedFields,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectedFields {
    pub domain: Option<String>,
    pub os_name: Option<String>,
    pub os_build: Option<String>,
    pub last_boot_unix: Option<i64>,
    pub total_ram_gb: Option<f64>,
    pub free_ram_gb: Option<f64>,
    pub volumes: Option<Vec<VolumeStat>>,
    pub app_crash: Option<u64>,
    pub kernel_power: Option<u64>,
    pub unexpected_shutdown: Option<u64>,
    pub resource_exhaustion: Option<u64>,
    pub boot_degradation: Option<u64>,
    pub last_quick_scan_unix: Option<i64>,
    pub recent_detections: Option<u64>,
    pub archived_reports: Option<u64>,
    pub crash_dumps: Option<u64>,
    pub recent_updates: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawCounterSample {
    pub timestamp_unix: i64,
    pub counter_path: String,
    pub value: f64,
}

/// Narrow capability set over the OS management transport.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    async fn probe_connectivity(&self, target: &str, timeout: Duration) -> bool;

    async fn probe_transport(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<(), RemoteError>;

    async fn execute_bundle(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        request: &BundleRequest,
    ) -> Result<RawBundle, RemoteError>;

    async fn query_event_count(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        query: &EventQuery,
        since_unix: i64,
    ) -> Result<u64, RemoteError>;

    async fn query_host_facts(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<HostFacts, RemoteError>;

    async fn query_volumes(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<Vec<VolumeStat>, RemoteError>;

    async fn query_protection_status(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        since_unix: i64,
    ) -> Result<ProtectionStatus, RemoteError>;

    async fn query_fault_artifacts(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<FaultArtifacts, RemoteError>;

    async fn query_recent_updates(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        since_unix: i64,
    ) -> Result<u64, RemoteError>;

    async fn sample_counters(
        &self,
        target: &str,
        counters: &[String],
        interval: Duration,
        max_samples: u32,
        creds: Option<&Credentials>,
    ) -> Result<Vec<RawCounterSample>, RemoteError>;
}
