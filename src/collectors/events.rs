use crate::activity::ActivityLog;
use crate::remote::{CollectedFields, Credentials, EventQuery, RemoteHost};
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventMetric {
    AppCrash,
    KernelPower,
    UnexpectedShutdown,
    ResourceExhaustion,
    BootDegradation,
}

impl EventMetric {
    pub const ALL: [EventMetric; 5] = [
        EventMetric::AppCrash,
        EventMetric::KernelPower,
        EventMetric::UnexpectedShutdown,
        EventMetric::ResourceExhaustion,
        EventMetric::BootDegradation,
    ];

    pub fn query(self) -> EventQuery {
        match self {
            EventMetric::AppCrash => EventQuery {
                channel: "Application",
                event_id: 1000,
            },
            EventMetric::KernelPower => EventQuery {
                channel: "System",
                event_id: 41,
            },
            EventMetric::UnexpectedShutdown => EventQuery {
                channel: "System",
                event_id: 6008,
            },
            EventMetric::ResourceExhaustion => EventQuery {
                channel: "Microsoft-Windows-Resource-Exhaustion-Detector/Operational",
                event_id: 2004,
            },
            EventMetric::BootDegradation => EventQuery {
                channel: "Microsoft-Windows-Diagnostics-Performance/Operational",
                event_id: 100,
            },
        }
    }

    /// Field name used in bundle output and activity log lines.
    pub fn key(self) -> &'static str {
        match self {
            EventMetric::AppCrash => "app_crash",
            EventMetric::KernelPower => "kernel_power",
            EventMetric::UnexpectedShutdown => "unexpected_shutdown",
            EventMetric::ResourceExhaustion => "resource_exhaustion",
            EventMetric::BootDegradation => "boot_degradation",
        }
    }

    pub fn slot(self, fields: &mut CollectedFields) -> &mut Option<u64> {
        match self {
            EventMetric::AppCrash => &mut fields.app_crash,
            EventMetric::KernelPower => &mut fields.kernel_power,
            EventMetric::UnexpectedShutdown => &mut fields.unexpected_shutdown,
            EventMetric::ResourceExhaustion => &mut fields.resource_exhaustion,
            EventMetric::BootDegradation => &mut fields.boot_degradation,
        }
    }
}

/// Runs the five event queries one by one; each failure only nulls its own metric.
pub async fn collect_event_counts(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    creds: Option<&Credentials>,
    since_unix: i64,
    fields: &mut CollectedFields,
) {
    for metric in EventMetric::ALL {
        let query = metric.query();
        let value = match remote
            .query_event_count(target, creds, &query, since_unix)
            .await
        {
            Ok(count) => Some(count),
            Err(err) => {
                log.log(
                    Level::WARN,
                    &format!(
                        "[{target}] {} query ({} / {}) failed: {err}",
                        metric.key(),
                        query.channel,
                        query.event_id
                    ),
                );
                None
            }
        };
        *metric.slot(fields) = value;
    }
}
