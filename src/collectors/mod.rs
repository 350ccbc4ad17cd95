pub mod events;
pub mod system;

use crate::activity::ActivityLog;
use crate::remote::{
    BundleRequest, CollectedFields, Credentials, RawBundle, RemoteError, RemoteHost,
};
use std::collections::BTreeMap;
use tracing::Level;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    pub lookback_days: u32,
    pub fast: bool,
    pub include_security: bool,
    pub include_crash_artifacts: bool,
    pub include_updates: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            fast: false,
            include_security: false,
            include_crash_artifacts: false,
            include_updates: false,
        }
    }
}

impl CollectorOptions {
    /// Resolves the enable flags against fast mode and the lookback window.
    pub fn request(&self, now_unix: i64) -> BundleRequest {
        BundleRequest {
            since_unix: now_unix - i64::from(self.lookback_days) * SECONDS_PER_DAY,
            security: self.include_security && !self.fast,
            crash_artifacts: self.include_crash_artifacts && !self.fast,
            updates: self.include_updates && !self.fast,
        }
    }
}

/// Result of one remote-execution bundle. The channel is the unit of
/// atomicity: it either failed as a whole or delivered fields.
#[derive(Debug, Clone, PartialEq)]
pub enum BundleOutcome {
    Unreachable(String),
    Partial {
        fields: CollectedFields,
        errors: BTreeMap<String, String>,
    },
    Complete(CollectedFields),
}

impl From<Result<RawBundle, RemoteError>> for BundleOutcome {
    fn from(value: Result<RawBundle, RemoteError>) -> Self {
        match value {
            Err(err) => BundleOutcome::Unreachable(err.to_string()),
            Ok(raw) if raw.errors.is_empty() => BundleOutcome::Complete(raw.fields),
            Ok(raw) => BundleOutcome::Partial {
                fields: raw.fields,
                errors: raw.errors,
            },
        }
    }
}

pub async fn run_bundle(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    creds: Option<&Credentials>,
    request: &BundleRequest,
) -> BundleOutcome {
    let outcome = BundleOutcome::from(remote.execute_bundle(target, creds, request).await);
    match &outcome {
        BundleOutcome::Unreachable(reason) => {
            log.log(Level::ERROR, &format!("[{target}] WinRM execution failed: {reason}"));
        }
        BundleOutcome::Partial { errors, .. } => {
            for (collector, reason) in errors {
                log.log(Level::WARN, &format!("[{target}] {collector} failed: {reason}"));
            }
        }
        BundleOutcome::Complete(_) => {}
    }
    outcome
}

/// Query-only path: every collector is its own remote call, so partial
/// results are the normal outcome rather than a failure.
pub async fn collect_independently(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    creds: Option<&Credentials>,
    request: &BundleRequest,
) -> CollectedFields {
    let mut fields = CollectedFields::default();
    system::collect_host_facts(remote, log, target, creds, &mut fields).await;
    system::collect_volumes(remote, log, target, creds, &mut fields).await;
    events::collect_event_counts(remote, log, target, creds, request.since_unix, &mut fields)
        .await;
    system::collect_optional(remote, log, target, creds, request, &mut fields).await;
    fields
}
