use crate::activity::ActivityLog;
use crate::collectors::system::{lowest_free_percent, round_to};
use crate::collectors::{self, BundleOutcome, CollectorOptions};
use crate::remote::{CollectedFields, Credentials, RemoteHost, Transport};
use crate::transport::{select_transport, TransportPreference};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::Level;

pub const LOW_DISK_PERCENT: f64 = 15.0;
pub const LOW_RAM_GB: f64 = 2.0;
pub const HIGH_CRASH_COUNT: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCounts {
    pub app_crash: Option<u64>,
    pub kernel_power: Option<u64>,
    pub unexpected_shutdown: Option<u64>,
    pub resource_exhaustion: Option<u64>,
    pub boot_degradation: Option<u64>,
}

impl EventCounts {
    /// App crash + kernel power + unexpected shutdown, unknowns counted as zero.
    pub fn crash_family_total(&self) -> u64 {
        [self.app_crash, self.kernel_power, self.unexpected_shutdown]
            .iter()
            .map(|v| v.unwrap_or(0))
            .fold(0, u64::saturating_add)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedFacts {
    pub last_quick_scan_unix: Option<i64>,
    pub recent_detections: Option<u64>,
    pub archived_fault_reports: Option<u64>,
    pub crash_dumps: Option<u64>,
    pub recent_updates: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlags {
    pub low_disk: bool,
    pub low_ram: bool,
    pub high_crash: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub target: String,
    pub collected_at_unix: i64,
    pub transport: Option<Transport>,
    pub reachable: bool,
    pub failure_reason: Option<String>,
    pub domain: Option<String>,
    pub os_name: Option<String>,
    pub os_build: Option<String>,
    pub last_boot_unix: Option<i64>,
    pub uptime_days: Option<f64>,
    pub total_ram_gb: Option<f64>,
    pub free_ram_gb: Option<f64>,
    pub lowest_free_disk_percent: Option<f64>,
    pub events: EventCounts,
    pub extended: ExtendedFacts,
    pub flags: RiskFlags,
}

impl HostSnapshot {
    pub fn unreachable(
        target: &str,
        collected_at_unix: i64,
        transport: Option<Transport>,
        reason: impl Into<String>,
    ) -> Self {
        let mut reason = reason.into();
        if reason.trim().is_empty() {
            reason = "unknown failure".to_string();
        }
        Self {
            target: target.to_string(),
            collected_at_unix,
            transport,
            reachable: false,
            failure_reason: Some(reason),
            domain: None,
            os_name: None,
            os_build: None,
            last_boot_unix: None,
            uptime_days: None,
            total_ram_gb: None,
            free_ram_gb: None,
            lowest_free_disk_percent: None,
            events: EventCounts::default(),
            extended: ExtendedFacts::default(),
            flags: RiskFlags::default(),
        }
    }

    /// Builds a reachable snapshot and derives its flags. Pure: no I/O.
    pub fn from_fields(
        target: &str,
        collected_at_unix: i64,
        transport: Transport,
        fields: CollectedFields,
    ) -> Self {
        let uptime_days = fields
            .last_boot_unix
            .map(|boot| round_to((collected_at_unix - boot).max(0) as f64 / 86_400.0, 2));
        let lowest_free_disk_percent = fields.volumes.as_deref().and_then(lowest_free_percent);

        let mut snapshot = Self {
            target: target.to_string(),
            collected_at_unix,
            transport: Some(transport),
            reachable: true,
            failure_reason: None,
            domain: fields.domain,
            os_name: fields.os_name,
            os_build: fields.os_build,
            last_boot_unix: fields.last_boot_unix,
            uptime_days,
            total_ram_gb: fields.total_ram_gb,
            free_ram_gb: fields.free_ram_gb,
            lowest_free_disk_percent,
            events: EventCounts {
                app_crash: fields.app_crash,
                kernel_power: fields.kernel_power,
                unexpected_shutdown: fields.unexpected_shutdown,
                resource_exhaustion: fields.resource_exhaustion,
                boot_degradation: fields.boot_degradation,
            },
            extended: ExtendedFacts {
                last_quick_scan_unix: fields.last_quick_scan_unix,
                recent_detections: fields.recent_detections,
                archived_fault_reports: fields.archived_reports,
                crash_dumps: fields.crash_dumps,
                recent_updates: fields.recent_updates,
            },
            flags: RiskFlags::default(),
        };
        snapshot.flags = derive_flags(&snapshot);
        snapshot
    }
}

pub fn derive_flags(snapshot: &HostSnapshot) -> RiskFlags {
    RiskFlags {
        low_disk: snapshot
            .lowest_free_disk_percent
            .is_some_and(|pct| pct < LOW_DISK_PERCENT),
        low_ram: snapshot.free_ram_gb.is_some_and(|gb| gb < LOW_RAM_GB),
        high_crash: snapshot.events.crash_family_total() >= HIGH_CRASH_COUNT,
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    pub collectors: CollectorOptions,
    pub transport: TransportPreference,
    pub credentials: Option<Credentials>,
    pub precheck_timeout: Duration,
    pub transport_probe_timeout: Duration,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            collectors: CollectorOptions::default(),
            transport: TransportPreference::Auto,
            credentials: None,
            precheck_timeout: Duration::from_millis(1500),
            transport_probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Drives one target through precheck, transport selection, collection and
/// derivation. The first terminal state reached wins.
#[derive(Clone)]
pub struct SnapshotAssembler {
    remote: Arc<dyn RemoteHost>,
    log: Arc<dyn ActivityLog>,
    options: Arc<AssemblerOptions>,
}

impl SnapshotAssembler {
    pub fn new(
        remote: Arc<dyn RemoteHost>,
        log: Arc<dyn ActivityLog>,
        options: AssemblerOptions,
    ) -> Self {
        Self {
            remote,
            log,
            options: Arc::new(options),
        }
    }

    pub async fn assemble(&self, target: &str) -> HostSnapshot {
        let now = now_unix();
        let remote = self.remote.as_ref();
        let log = self.log.as_ref();
        let opts = self.options.as_ref();
        let creds = opts.credentials.as_ref();

        if !remote.probe_connectivity(target, opts.precheck_timeout).await {
            let reason = format!(
                "host did not answer the connectivity check within {}",
                humantime::format_duration(opts.precheck_timeout)
            );
            log.log(Level::WARN, &format!("[{target}] unreachable: {reason}"));
            return HostSnapshot::unreachable(target, now, None, reason);
        }

        let transport = select_transport(
            remote,
            log,
            target,
            opts.transport,
            creds,
            opts.transport_probe_timeout,
        )
        .await;

        let request = opts.collectors.request(now);
        let fields = match transport {
            Transport::WinRm => {
                match collectors::run_bundle(remote, log, target, creds, &request).await {
                    BundleOutcome::Unreachable(reason) => {
                        return HostSnapshot::unreachable(target, now, Some(transport), reason);
                    }
                    BundleOutcome::Partial { fields, .. } | BundleOutcome::Complete(fields) => {
                        fields
                    }
                }
            }
            Transport::Rpc => {
                collectors::collect_independently(remote, log, target, creds, &request).await
            }
        };

        let snapshot = HostSnapshot::from_fields(target, now, transport, fields);
        log.log(
            Level::INFO,
            &format!(
                "[{target}] collected via {transport} (low_disk={}, low_ram={}, high_crash={})",
                snapshot.flags.low_disk, snapshot.flags.low_ram, snapshot.flags.high_crash
            ),
        );
        snapshot
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
