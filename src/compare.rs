use crate::collectors::system::round_to;
use crate::snapshot::{HostSnapshot, LOW_DISK_PERCENT};
use serde::{Deserialize, Serialize};
use std::fmt;

const CRASH_FAMILY_MARGIN: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Mismatch,
    Delta,
    LowerIsBad,
    HigherIsBad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "Info"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Missing,
}

impl MetricValue {
    fn number(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(v) => write!(f, "{}", round_to(*v, 4)),
            MetricValue::Text(s) => write!(f, "{s}"),
            MetricValue::Missing => write!(f, "n/a"),
        }
    }
}

fn num<T: Into<f64>>(value: Option<T>) -> MetricValue {
    value.map_or(MetricValue::Missing, |v| MetricValue::Number(v.into()))
}

fn count(value: Option<u64>) -> MetricValue {
    value.map_or(MetricValue::Missing, |v| MetricValue::Number(v as f64))
}

fn text(value: Option<&String>) -> MetricValue {
    value.map_or(MetricValue::Missing, |v| MetricValue::Text(v.clone()))
}

struct TrackedMetric {
    name: &'static str,
    direction: Direction,
    read: fn(&HostSnapshot) -> MetricValue,
}

const TRACKED: [TrackedMetric; 9] = [
    TrackedMetric {
        name: "OS build",
        direction: Direction::Mismatch,
        read: |s| text(s.os_build.as_ref()),
    },
    TrackedMetric {
        name: "Uptime (days)",
        direction: Direction::Delta,
        read: |s| num(s.uptime_days),
    },
    TrackedMetric {
        name: "Lowest free disk %",
        direction: Direction::LowerIsBad,
        read: |s| num(s.lowest_free_disk_percent),
    },
    TrackedMetric {
        name: "Free RAM (GB)",
        direction: Direction::LowerIsBad,
        read: |s| num(s.free_ram_gb),
    },
    TrackedMetric {
        name: "App crashes",
        direction: Direction::HigherIsBad,
        read: |s| count(s.events.app_crash),
    },
    TrackedMetric {
        name: "Kernel power events",
        direction: Direction::HigherIsBad,
        read: |s| count(s.events.kernel_power),
    },
    TrackedMetric {
        name: "Unexpected shutdowns",
        direction: Direction::HigherIsBad,
        read: |s| count(s.events.unexpected_shutdown),
    },
    TrackedMetric {
        name: "Resource exhaustion events",
        direction: Direction::HigherIsBad,
        read: |s| count(s.events.resource_exhaustion),
    },
    TrackedMetric {
        name: "Boot degradation events",
        direction: Direction::HigherIsBad,
        read: |s| count(s.events.boot_degradation),
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: String,
    pub direction: Direction,
    pub reference: MetricValue,
    pub difference: MetricValue,
    pub delta: Option<f64>,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub reference_target: String,
    pub difference_target: String,
    pub rows: Vec<MetricComparison>,
    pub likely_contributors: Vec<String>,
}

/// Metric-by-metric diff of a known-good (`reference`) and a known-bad
/// (`difference`) host. Pure: same inputs always give the same result.
pub fn compare(reference: &HostSnapshot, difference: &HostSnapshot) -> ComparisonResult {
    let rows = TRACKED
        .iter()
        .map(|m| compare_metric(m.name, m.direction, (m.read)(reference), (m.read)(difference)))
        .collect();

    ComparisonResult {
        reference_target: reference.target.clone(),
        difference_target: difference.target.clone(),
        rows,
        likely_contributors: likely_contributors(reference, difference),
    }
}

fn compare_metric(
    name: &str,
    direction: Direction,
    reference: MetricValue,
    difference: MetricValue,
) -> MetricComparison {
    let raw_delta = match (reference.number(), difference.number()) {
        (Some(r), Some(d)) => Some(d - r),
        _ => None,
    };

    // Severity looks at the exact difference; only the reported delta is rounded.
    let severity = match direction {
        Direction::Mismatch if reference != difference => Severity::Warning,
        Direction::Mismatch | Direction::Delta => Severity::Info,
        Direction::LowerIsBad if raw_delta.is_some_and(|d| d < 0.0) => Severity::Warning,
        Direction::HigherIsBad if raw_delta.is_some_and(|d| d > 0.0) => Severity::Warning,
        Direction::LowerIsBad | Direction::HigherIsBad => Severity::Info,
    };
    let delta = raw_delta.map(|d| round_to(d, 4));

    MetricComparison {
        metric: name.to_string(),
        direction,
        reference,
        difference,
        delta,
        severity,
    }
}

fn likely_contributors(reference: &HostSnapshot, difference: &HostSnapshot) -> Vec<String> {
    let mut out = Vec::new();
    let (r, d) = (&reference.events, &difference.events);

    if let Some(pct) = difference
        .lowest_free_disk_percent
        .filter(|pct| *pct < LOW_DISK_PERCENT)
    {
        out.push(format!(
            "Low free disk space on {} ({}% free on the fullest volume) can cause paging failures, update rollbacks and application errors.",
            difference.target,
            (pct * 100.0).floor() / 100.0
        ));
    }

    let (r_exhaust, d_exhaust) = (
        r.resource_exhaustion.unwrap_or(0),
        d.resource_exhaustion.unwrap_or(0),
    );
    if d_exhaust > r_exhaust {
        out.push(format!(
            "Resource exhaustion events are higher on {} ({d_exhaust} vs {r_exhaust}); look for memory pressure or a leaking process.",
            difference.target
        ));
    }

    let (r_crash, d_crash) = (r.crash_family_total(), d.crash_family_total());
    if d_crash > r_crash.saturating_add(CRASH_FAMILY_MARGIN) {
        out.push(format!(
            "Crash and unexpected shutdown activity is elevated on {} ({d_crash} vs {r_crash}); check drivers, power and recent changes.",
            difference.target
        ));
    }

    let (r_boot, d_boot) = (
        r.boot_degradation.unwrap_or(0),
        d.boot_degradation.unwrap_or(0),
    );
    if d_boot > r_boot {
        out.push(format!(
            "Boot performance degradation is higher on {} ({d_boot} vs {r_boot}); review startup programs and services.",
            difference.target
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CollectedFields, Transport};

    fn snap(target: &str, fields: CollectedFields) -> HostSnapshot {
        HostSnapshot::from_fields(target, 1_700_000_000, Transport::WinRm, fields)
    }

    fn row<'a>(result: &'a ComparisonResult, metric: &str) -> &'a MetricComparison {
        result.rows.iter().find(|r| r.metric == metric).unwrap()
    }

    fn with_disk(pct_free: u64) -> CollectedFields {
        CollectedFields {
            volumes: Some(vec![crate::remote::VolumeStat {
                name: "C:".into(),
                size_bytes: 100,
                free_bytes: pct_free,
            }]),
            ..CollectedFields::default()
        }
    }

    #[test]
    fn rows_follow_declared_order() {
        let a = snap("good", CollectedFields::default());
        let b = snap("bad", CollectedFields::default());
        let names: Vec<String> = compare(&a, &b).rows.into_iter().map(|r| r.metric).collect();
        let expected: Vec<&str> = TRACKED.iter().map(|m| m.name).collect();
        assert_eq!(names, expected);
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn os_build_mismatch_warns_without_delta() {
        let a = snap(
            "good",
            CollectedFields {
                os_build: Some("10.0.19045".into()),
                ..CollectedFields::default()
            },
        );
        let b = snap(
            "bad",
            CollectedFields {
                os_build: Some("10.0.22631".into()),
                ..CollectedFields::default()
            },
        );
        let result = compare(&a, &b);
        let r = row(&result, "OS build");
        assert_eq!(r.severity, Severity::Warning);
        assert_eq!(r.delta, None);

        let same = compare(&a, &a);
        assert_eq!(row(&same, "OS build").severity, Severity::Info);
    }

    #[test]
    fn lower_free_disk_warns() {
        let result = compare(&snap("good", with_disk(40)), &snap("bad", with_disk(10)));
        let r = row(&result, "Lowest free disk %");
        assert_eq!(r.delta, Some(-30.0));
        assert_eq!(r.severity, Severity::Warning);
    }

    #[test]
    fn uptime_never_escalates() {
        let now = 1_700_000_000;
        let a = snap(
            "good",
            CollectedFields {
                last_boot_unix: Some(now - 86_400),
                ..CollectedFields::default()
            },
        );
        let b = snap(
            "bad",
            CollectedFields {
                last_boot_unix: Some(now - 40 * 86_400),
                ..CollectedFields::default()
            },
        );
        let result = compare(&a, &b);
        let r = row(&result, "Uptime (days)");
        assert_eq!(r.delta, Some(39.0));
        assert_eq!(r.severity, Severity::Info);
    }

    #[test]
    fn higher_counts_warn_and_missing_sides_stay_info() {
        let a = snap(
            "good",
            CollectedFields {
                app_crash: Some(1),
                kernel_power: Some(2),
                ..CollectedFields::default()
            },
        );
        let b = snap(
            "bad",
            CollectedFields {
                app_crash: Some(4),
                kernel_power: None,
                ..CollectedFields::default()
            },
        );
        let result = compare(&a, &b);
        let crash = row(&result, "App crashes");
        assert_eq!(crash.delta, Some(3.0));
        assert_eq!(crash.severity, Severity::Warning);

        let power = row(&result, "Kernel power events");
        assert_eq!(power.delta, None);
        assert_eq!(power.difference, MetricValue::Missing);
        assert_eq!(power.severity, Severity::Info);
    }

    #[test]
    fn low_disk_contributor_depends_only_on_difference_host() {
        let result = compare(&snap("good", with_disk(5)), &snap("bad", with_disk(14)));
        assert!(result.likely_contributors.iter().any(|c| c.starts_with("Low free disk")));

        let result = compare(&snap("good", with_disk(5)), &snap("bad", with_disk(15)));
        assert!(result.likely_contributors.is_empty());
    }

    #[test]
    fn crash_family_needs_margin_above_three() {
        let a = snap(
            "good",
            CollectedFields {
                app_crash: Some(1),
                ..CollectedFields::default()
            },
        );
        let exactly_three_more = snap(
            "bad",
            CollectedFields {
                app_crash: Some(2),
                kernel_power: None,
                unexpected_shutdown: Some(2),
                ..CollectedFields::default()
            },
        );
        assert!(compare(&a, &exactly_three_more).likely_contributors.is_empty());

        let four_more = snap(
            "bad",
            CollectedFields {
                app_crash: Some(2),
                kernel_power: Some(1),
                unexpected_shutdown: Some(2),
                ..CollectedFields::default()
            },
        );
        let result = compare(&a, &four_more);
        assert_eq!(result.likely_contributors.len(), 1);
        assert!(result.likely_contributors[0].starts_with("Crash and unexpected shutdown"));
    }

    #[test]
    fn several_contributors_can_fire_together() {
        let a = snap("good", with_disk(50));
        let b = snap(
            "bad",
            CollectedFields {
                resource_exhaustion: Some(2),
                boot_degradation: Some(1),
                ..with_disk(3)
            },
        );
        let result = compare(&a, &b);
        assert_eq!(result.likely_contributors.len(), 3);
    }

    fn with_volume(size_bytes: u64, free_bytes: u64) -> CollectedFields {
        CollectedFields {
            volumes: Some(vec![crate::remote::VolumeStat {
                name: "C:".into(),
                size_bytes,
                free_bytes,
            }]),
            ..CollectedFields::default()
        }
    }

    #[test]
    fn just_under_fifteen_percent_is_low_disk() {
        let result = compare(
            &snap("good", with_disk(40)),
            &snap("bad", with_volume(100_000, 14_996)),
        );
        let low: Vec<&String> = result
            .likely_contributors
            .iter()
            .filter(|c| c.starts_with("Low free disk"))
            .collect();
        assert_eq!(low.len(), 1);
        assert!(low[0].contains("(14.99% free"));
    }

    #[test]
    fn tiny_disk_drop_warns_though_delta_rounds_to_zero() {
        let result = compare(
            &snap("good", with_volume(10_000_000, 1_500_001)),
            &snap("bad", with_volume(10_000_000, 1_500_000)),
        );
        let r = row(&result, "Lowest free disk %");
        assert_eq!(r.delta.map(f64::abs), Some(0.0));
        assert_eq!(r.severity, Severity::Warning);
    }

    #[test]
    fn huge_crash_counts_do_not_overflow() {
        let a = snap(
            "good",
            CollectedFields {
                app_crash: Some(u64::MAX),
                ..CollectedFields::default()
            },
        );
        let b = snap(
            "bad",
            CollectedFields {
                app_crash: Some(u64::MAX),
                kernel_power: Some(1),
                ..CollectedFields::default()
            },
        );
        assert!(compare(&a, &b).likely_contributors.is_empty());

        let quiet = snap("good", CollectedFields::default());
        let result = compare(&quiet, &b);
        assert_eq!(result.likely_contributors.len(), 1);
        assert!(result.likely_contributors[0].starts_with("Crash and unexpected shutdown"));
    }

    #[test]
    fn compare_is_deterministic() {
        let a = snap("good", with_disk(40));
        let b = snap(
            "bad",
            CollectedFields {
                app_crash: Some(9),
                ..with_disk(8)
            },
        );
        let first = serde_json::to_string(&compare(&a, &b)).unwrap();
        let second = serde_json::to_string(&compare(&a, &b)).unwrap();
        assert_eq!(first, second);
    }
}
