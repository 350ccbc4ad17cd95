use crate::activity::ActivityLog;
use crate::remote::{BundleRequest, CollectedFields, Credentials, RemoteHost, VolumeStat};
use tracing::Level;

/// Minimum free percentage across fixed volumes. Zero-capacity volumes are
/// skipped; `None` when nothing is left to measure. Unrounded: thresholds
/// are checked against this value, rounding happens at render time.
pub fn lowest_free_percent(volumes: &[VolumeStat]) -> Option<f64> {
    volumes
        .iter()
        .filter(|v| v.size_bytes > 0)
        .map(|v| (v.free_bytes as f64 / v.size_bytes as f64) * 100.0)
        .min_by(|a, b| a.total_cmp(b))
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}

pub async fn collect_host_facts(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    creds: Option<&Credentials>,
    fields: &mut CollectedFields,
) {
    match remote.query_host_facts(target, creds).await {
        Ok(facts) => {
            fields.domain = facts.domain;
            fields.os_name = facts.os_name;
            fields.os_build = facts.os_build;
            fields.last_boot_unix = facts.last_boot_unix;
            fields.total_ram_gb = facts.total_ram_gb;
            fields.free_ram_gb = facts.free_ram_gb;
        }
        Err(err) => log.log(Level::WARN, &format!("[{target}] host facts query failed: {err}")),
    }
}

pub async fn collect_volumes(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    creds: Option<&Credentials>,
    fields: &mut CollectedFields,
) {
    match remote.query_volumes(target, creds).await {
        Ok(volumes) => fields.volumes = Some(volumes),
        Err(err) => log.log(Level::WARN, &format!("[{target}] volume query failed: {err}")),
    }
}

/// Extended collectors that only run when the request asks for them.
pub async fn collect_optional(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    creds: Option<&Credentials>,
    request: &BundleRequest,
    fields: &mut CollectedFields,
) {
    if request.security {
        match remote
            .query_protection_status(target, creds, request.since_unix)
            .await
        {
            Ok(status) => {
                fields.last_quick_scan_unix = status.last_quick_scan_unix;
                fields.recent_detections = status.recent_detections;
            }
            Err(err) => log.log(
                Level::WARN,
                &format!("[{target}] endpoint protection query failed: {err}"),
            ),
        }
    }

    if request.crash_artifacts {
        match remote.query_fault_artifacts(target, creds).await {
            Ok(artifacts) => {
                fields.archived_reports = artifacts.archived_reports;
                fields.crash_dumps = artifacts.crash_dumps;
            }
            Err(err) => log.log(
                Level::WARN,
                &format!("[{target}] crash artifact query failed: {err}"),
            ),
        }
    }

    if request.updates {
        match remote
            .query_recent_updates(target, creds, request.since_unix)
            .await
        {
            Ok(count) => fields.recent_updates = Some(count),
            Err(err) => log.log(Level::WARN, &format!("[{target}] update query failed: {err}")),
        }
    }
}
