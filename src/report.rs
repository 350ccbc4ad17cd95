use crate::collectors::system::round_to;
use crate::compare::{ComparisonResult, Severity};
use crate::perf::PerformanceSample;
use crate::snapshot::HostSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Csv,
    Html,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
}

const SNAPSHOT_COLUMNS: [&str; 26] = [
    "target",
    "collected_at",
    "transport",
    "reachable",
    "failure_reason",
    "domain",
    "os_name",
    "os_build",
    "last_boot",
    "uptime_days",
    "total_ram_gb",
    "free_ram_gb",
    "lowest_free_disk_percent",
    "app_crash",
    "kernel_power",
    "unexpected_shutdown",
    "resource_exhaustion",
    "boot_degradation",
    "last_quick_scan",
    "recent_detections",
    "archived_fault_reports",
    "crash_dumps",
    "recent_updates",
    "low_disk",
    "low_ram",
    "high_crash",
];

pub fn render_snapshots(snapshots: &[HostSnapshot], format: ReportFormat) -> Result<String, ReportError> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(snapshots)?),
        ReportFormat::Csv => Ok(snapshots_csv(snapshots)),
        ReportFormat::Html => Ok(snapshots_html(snapshots)),
    }
}

pub fn render_performance(
    samples: &[PerformanceSample],
    format: ReportFormat,
) -> Result<String, ReportError> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(samples)?),
        ReportFormat::Csv => Ok(performance_csv(samples)),
        ReportFormat::Html => Ok(performance_html(samples)),
    }
}

pub fn write_report(path: &Path, contents: &str) -> Result<(), ReportError> {
    std::fs::write(path, contents).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn opt<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn timestamp(unix: Option<i64>) -> String {
    unix.and_then(|secs| u64::try_from(secs).ok())
        .map(|secs| humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string())
        .unwrap_or_default()
}

/// Flattens one snapshot into cells matching `SNAPSHOT_COLUMNS`.
fn snapshot_cells(s: &HostSnapshot) -> Vec<String> {
    vec![
        s.target.clone(),
        timestamp(Some(s.collected_at_unix)),
        opt(s.transport),
        s.reachable.to_string(),
        opt(s.failure_reason.as_deref()),
        opt(s.domain.as_deref()),
        opt(s.os_name.as_deref()),
        opt(s.os_build.as_deref()),
        timestamp(s.last_boot_unix),
        opt(s.uptime_days),
        opt(s.total_ram_gb),
        opt(s.free_ram_gb),
        opt(s.lowest_free_disk_percent.map(|p| round_to(p, 2))),
        opt(s.events.app_crash),
        opt(s.events.kernel_power),
        opt(s.events.unexpected_shutdown),
        opt(s.events.resource_exhaustion),
        opt(s.events.boot_degradation),
        timestamp(s.extended.last_quick_scan_unix),
        opt(s.extended.recent_detections),
        opt(s.extended.archived_fault_reports),
        opt(s.extended.crash_dumps),
        opt(s.extended.recent_updates),
        s.flags.low_disk.to_string(),
        s.flags.low_ram.to_string(),
        s.flags.high_crash.to_string(),
    ]
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line<S: AsRef<str>>(cells: &[S]) -> String {
    let mut line = cells
        .iter()
        .map(|c| csv_field(c.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

fn snapshots_csv(snapshots: &[HostSnapshot]) -> String {
    let mut out = csv_line(&SNAPSHOT_COLUMNS);
    for s in snapshots {
        out.push_str(&csv_line(&snapshot_cells(s)));
    }
    out
}

fn performance_csv(samples: &[PerformanceSample]) -> String {
    let mut out = csv_line(&["target", "counter_path", "average", "min", "max", "failure_reason"]);
    for sample in samples {
        if sample.summary.is_empty() {
            out.push_str(&csv_line(&[
                sample.target.as_str(),
                "",
                "",
                "",
                "",
                sample.failure_reason.as_deref().unwrap_or(""),
            ]));
        }
        for row in &sample.summary {
            out.push_str(&csv_line(&[
                sample.target.clone(),
                row.counter_path.clone(),
                row.average.to_string(),
                row.min.to_string(),
                row.max.to_string(),
                String::new(),
            ]));
        }
    }
    out
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const HTML_HEAD: &str = "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Fleet diagnostics</title>\n<style>\nbody { font-family: sans-serif; }\ntable { border-collapse: collapse; }\nth, td { border: 1px solid #999; padding: 2px 6px; }\ntr.flagged { background: #fdd; }\ntr.unreachable { color: #777; }\n</style>\n</head>\n<body>\n";

fn snapshots_html(snapshots: &[HostSnapshot]) -> String {
    let mut out = String::from(HTML_HEAD);
    out.push_str("<table>\n<tr>");
    for col in SNAPSHOT_COLUMNS {
        out.push_str(&format!("<th>{col}</th>"));
    }
    out.push_str("</tr>\n");

    for s in snapshots {
        let class = if !s.reachable {
            " class=\"unreachable\""
        } else if s.flags.low_disk || s.flags.low_ram || s.flags.high_crash {
            " class=\"flagged\""
        } else {
            ""
        };
        out.push_str(&format!("<tr{class}>"));
        for cell in snapshot_cells(s) {
            out.push_str(&format!("<td>{}</td>", escape_html(&cell)));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</table>\n</body>\n</html>\n");
    out
}

fn performance_html(samples: &[PerformanceSample]) -> String {
    let mut out = String::from(HTML_HEAD);
    out.push_str("<table>\n<tr><th>target</th><th>counter_path</th><th>average</th><th>min</th><th>max</th><th>failure_reason</th></tr>\n");
    for sample in samples {
        let target = escape_html(&sample.target);
        if let Some(reason) = &sample.failure_reason {
            out.push_str(&format!(
                "<tr class=\"unreachable\"><td>{target}</td><td></td><td></td><td></td><td></td><td>{}</td></tr>\n",
                escape_html(reason)
            ));
            continue;
        }
        for row in &sample.summary {
            out.push_str(&format!(
                "<tr><td>{target}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td></td></tr>\n",
                escape_html(&row.counter_path),
                row.average,
                row.min,
                row.max
            ));
        }
    }
    out.push_str("</table>\n</body>\n</html>\n");
    out
}

/// Plain-text comparison table for the terminal.
pub fn comparison_table(result: &ComparisonResult) -> String {
    let header = [
        "Metric".to_string(),
        result.reference_target.clone(),
        result.difference_target.clone(),
        "Delta".to_string(),
        "Severity".to_string(),
    ];
    let rows: Vec<[String; 5]> = result
        .rows
        .iter()
        .map(|r| {
            [
                r.metric.clone(),
                r.reference.to_string(),
                r.difference.to_string(),
                r.delta.map(|d| format!("{d:+}")).unwrap_or_else(|| "-".to_string()),
                match r.severity {
                    Severity::Warning => "WARNING".to_string(),
                    Severity::Info => "info".to_string(),
                },
            ]
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: &[String; 5]| {
        let mut s = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}", w = *w))
            .collect::<Vec<_>>()
            .join("  ");
        s.truncate(s.trim_end().len());
        s.push('\n');
        s
    };

    let mut out = line(&header);
    out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * (widths.len() - 1)));
    out.push('\n');
    for row in &rows {
        out.push_str(&line(row));
    }

    out.push('\n');
    if result.likely_contributors.is_empty() {
        out.push_str("No likely contributors identified.\n");
    } else {
        out.push_str("Likely contributors:\n");
        for c in &result.likely_contributors {
            out.push_str(&format!("  - {c}\n"));
        }
    }
    out
}
