use crate::activity::ActivityLog;
use crate::collectors::system::round_to;
use crate::fleet::{join_failure_reason, validate_targets, FleetError};
use crate::remote::{Credentials, RawCounterSample, RemoteHost};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Level;

pub const DEFAULT_COUNTERS: [&str; 4] = [
    r"\Processor(_Total)\% Processor Time",
    r"\Memory\Available MBytes",
    r"\PhysicalDisk(_Total)\% Disk Time",
    r"\PhysicalDisk(_Total)\Avg. Disk Queue Length",
];

const MIN_SAMPLING_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PerfOptions {
    pub duration: Duration,
    pub interval: Duration,
    pub counters: Vec<String>,
}

impl Default for PerfOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            counters: DEFAULT_COUNTERS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl PerfOptions {
    fn validate(&self) -> Result<(), FleetError> {
        // Get-Counter only samples at whole-second intervals.
        if self.interval < MIN_SAMPLING_STEP {
            return Err(FleetError::InvalidSampling(format!(
                "interval must be at least {}",
                humantime::format_duration(MIN_SAMPLING_STEP)
            )));
        }
        if self.duration < MIN_SAMPLING_STEP {
            return Err(FleetError::InvalidSampling(format!(
                "duration must be at least {}",
                humantime::format_duration(MIN_SAMPLING_STEP)
            )));
        }
        if self.counters.is_empty() {
            return Err(FleetError::InvalidSampling("no counters to sample".into()));
        }
        if self.counters.iter().any(|c| c.trim().is_empty()) {
            return Err(FleetError::InvalidSampling("blank counter path".into()));
        }
        Ok(())
    }

    /// Always at least one sample, even when duration < interval.
    pub fn sample_count(&self) -> u32 {
        let ratio = self.duration.as_secs_f64() / self.interval.as_secs_f64();
        (ratio.floor() as u32).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterReading {
    pub target: String,
    pub timestamp_unix: i64,
    pub counter_path: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSummary {
    pub counter_path: String,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub target: String,
    pub duration_secs: f64,
    pub interval_secs: f64,
    pub counters: Vec<String>,
    pub samples: Vec<CounterReading>,
    pub summary: Vec<CounterSummary>,
    pub failure_reason: Option<String>,
}

impl PerformanceSample {
    fn empty(target: &str, opts: &PerfOptions) -> Self {
        Self {
            target: target.to_string(),
            duration_secs: opts.duration.as_secs_f64(),
            interval_secs: opts.interval.as_secs_f64(),
            counters: opts.counters.clone(),
            samples: Vec::new(),
            summary: Vec::new(),
            failure_reason: None,
        }
    }

    fn failed(target: &str, opts: &PerfOptions, reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::empty(target, opts)
        }
    }
}

/// Per-counter average/min/max in order of first appearance.
pub fn summarize(samples: &[CounterReading]) -> Vec<CounterSummary> {
    let mut groups: Vec<(&str, Vec<f64>)> = Vec::new();
    for s in samples {
        match groups.iter_mut().find(|(path, _)| *path == s.counter_path) {
            Some((_, values)) => values.push(s.value),
            None => groups.push((&s.counter_path, vec![s.value])),
        }
    }

    groups
        .into_iter()
        .map(|(path, values)| {
            let sum: f64 = values.iter().sum();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            CounterSummary {
                counter_path: path.to_string(),
                average: round_to(sum / values.len() as f64, 4),
                min: round_to(min, 4),
                max: round_to(max, 4),
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct PerfSampler {
    remote: Arc<dyn RemoteHost>,
    log: Arc<dyn ActivityLog>,
    credentials: Option<Credentials>,
    precheck_timeout: Duration,
    max_parallel: usize,
}

impl PerfSampler {
    pub fn new(
        remote: Arc<dyn RemoteHost>,
        log: Arc<dyn ActivityLog>,
        credentials: Option<Credentials>,
        precheck_timeout: Duration,
        max_parallel: usize,
    ) -> Self {
        Self {
            remote,
            log,
            credentials,
            precheck_timeout,
            max_parallel: max_parallel.max(1),
        }
    }

    /// One result per target, in input order. Only bad parameters fail the
    /// whole call; everything per-target lands in `failure_reason`.
    pub async fn sample(
        &self,
        targets: &[String],
        opts: &PerfOptions,
    ) -> Result<Vec<PerformanceSample>, FleetError> {
        validate_targets(targets)?;
        opts.validate()?;
        self.log.log(
            Level::INFO,
            &format!(
                "performance sampling started: {} target(s), {} sample(s) every {}",
                targets.len(),
                opts.sample_count(),
                humantime::format_duration(opts.interval)
            ),
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        for (idx, target) in targets.iter().enumerate() {
            let sampler = self.clone();
            let semaphore = semaphore.clone();
            let target = target.trim().to_string();
            let opts = opts.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut inner = JoinSet::new();
                let (inner_sampler, inner_target, inner_opts) =
                    (sampler.clone(), target.clone(), opts.clone());
                inner.spawn(async move { inner_sampler.sample_one(&inner_target, &inner_opts).await });
                let result = match inner.join_next().await {
                    Some(Ok(result)) => result,
                    Some(Err(err)) => {
                        let reason = join_failure_reason(err);
                        sampler
                            .log
                            .log(Level::ERROR, &format!("[{target}] sampling failed: {reason}"));
                        PerformanceSample::failed(&target, &opts, reason)
                    }
                    None => PerformanceSample::failed(&target, &opts, "sampling task was lost"),
                };
                (idx, result)
            });
        }

        let mut slots: Vec<Option<PerformanceSample>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            if let Ok((idx, result)) = joined {
                slots[idx] = Some(result);
            }
        }

        Ok(slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| {
                    PerformanceSample::failed(target.trim(), opts, "sampling task was lost")
                })
            })
            .collect())
    }

    async fn sample_one(&self, target: &str, opts: &PerfOptions) -> PerformanceSample {
        if !self
            .remote
            .probe_connectivity(target, self.precheck_timeout)
            .await
        {
            let reason = "host did not answer the connectivity check";
            self.log
                .log(Level::WARN, &format!("[{target}] skipping sampling: {reason}"));
            return PerformanceSample::failed(target, opts, reason);
        }

        let raw = self
            .remote
            .sample_counters(
                target,
                &opts.counters,
                opts.interval,
                opts.sample_count(),
                self.credentials.as_ref(),
            )
            .await;

        match raw {
            Ok(raw) => {
                let samples: Vec<CounterReading> = raw
                    .into_iter()
                    .map(|s: RawCounterSample| CounterReading {
                        target: target.to_string(),
                        timestamp_unix: s.timestamp_unix,
                        counter_path: s.counter_path,
                        value: round_to(s.value, 4),
                    })
                    .collect();
                let summary = summarize(&samples);
                self.log.log(
                    Level::INFO,
                    &format!(
                        "[{target}] {} sample(s) across {} counter(s)",
                        samples.len(),
                        summary.len()
                    ),
                );
                PerformanceSample {
                    samples,
                    summary,
                    ..PerformanceSample::empty(target, opts)
                }
            }
            Err(err) => {
                self.log
                    .log(Level::ERROR, &format!("[{target}] sampling failed: {err}"));
                PerformanceSample::failed(target, opts, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::NoopLog;
    use crate::remote::fake::{FakeRemote, HostScript};

    fn reading(path: &str, value: f64) -> CounterReading {
        CounterReading {
            target: "pc01".into(),
            timestamp_unix: 0,
            counter_path: path.into(),
            value,
        }
    }

    fn raw(ts: i64, path: &str, value: f64) -> RawCounterSample {
        RawCounterSample {
            timestamp_unix: ts,
            counter_path: path.into(),
            value,
        }
    }

    fn opts(duration: u64, interval: u64) -> PerfOptions {
        PerfOptions {
            duration: Duration::from_secs(duration),
            interval: Duration::from_secs(interval),
            ..PerfOptions::default()
        }
    }

    fn sampler(remote: Arc<FakeRemote>) -> PerfSampler {
        PerfSampler::new(remote, Arc::new(NoopLog), None, Duration::from_millis(100), 2)
    }

    #[test]
    fn sample_count_is_at_least_one() {
        assert_eq!(opts(30, 5).sample_count(), 6);
        assert_eq!(opts(7, 2).sample_count(), 3);
        assert_eq!(opts(1, 10).sample_count(), 1);
    }

    #[test]
    fn summary_keeps_first_appearance_order() {
        let samples = vec![
            reading("cpu", 10.0),
            reading("mem", 2048.0),
            reading("cpu", 20.0),
            reading("cpu", 15.5),
            reading("mem", 1024.0),
        ];
        let summary = summarize(&samples);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].counter_path, "cpu");
        assert_eq!(summary[0].average, 15.1667);
        assert_eq!(summary[0].min, 10.0);
        assert_eq!(summary[0].max, 20.0);
        assert_eq!(summary[1].counter_path, "mem");
        assert_eq!(summary[1].average, 1536.0);
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let mut o = opts(10, 0);
        assert!(matches!(o.validate(), Err(FleetError::InvalidSampling(_))));
        o = opts(0, 1);
        assert!(o.validate().is_err());
        o = opts(10, 1);
        o.interval = Duration::from_millis(500);
        assert!(matches!(o.validate(), Err(FleetError::InvalidSampling(_))));
        o = opts(10, 1);
        o.duration = Duration::from_millis(500);
        assert!(matches!(o.validate(), Err(FleetError::InvalidSampling(_))));
        o = opts(1, 1);
        assert!(o.validate().is_ok());
        o.counters.push("  ".into());
        assert!(o.validate().is_err());
        o.counters.clear();
        assert!(o.validate().is_err());
    }

    #[tokio::test]
    async fn failures_are_isolated_per_target() {
        let remote = Arc::new(
            FakeRemote::new()
                .with_host(
                    "good",
                    HostScript {
                        counters: Some(Ok(vec![
                            raw(1, "cpu", 12.345678),
                            raw(1, "mem", 4000.0),
                            raw(2, "cpu", 30.0),
                        ])),
                        ..HostScript::default()
                    },
                )
                .with_host(
                    "offline",
                    HostScript {
                        offline: true,
                        ..HostScript::default()
                    },
                )
                .with_host(
                    "denied",
                    HostScript {
                        counters: Some(Err("Access is denied".into())),
                        ..HostScript::default()
                    },
                )
                .with_host(
                    "panics",
                    HostScript {
                        panic_on_collect: true,
                        ..HostScript::default()
                    },
                ),
        );
        let targets: Vec<String> = ["good", "offline", "denied", "panics"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = sampler(remote.clone())
            .sample(&targets, &opts(10, 5))
            .await
            .unwrap();

        assert_eq!(out.len(), 4);
        assert_eq!(out[0].target, "good");
        assert_eq!(out[0].failure_reason, None);
        assert_eq!(out[0].samples.len(), 3);
        assert_eq!(out[0].samples[0].value, 12.3457);
        assert_eq!(out[0].summary[0].counter_path, "cpu");
        assert_eq!(out[0].summary[0].max, 30.0);

        for failed in &out[1..] {
            assert!(failed.samples.is_empty());
            assert!(failed.summary.is_empty());
            assert!(failed.failure_reason.is_some());
        }
        assert!(out[3]
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("panicked")));

        let requests = remote.sample_requests();
        assert!(requests.iter().all(|(_, n)| *n == 2));
        assert!(!requests.iter().any(|(t, _)| t == "offline"));
    }

    #[tokio::test]
    async fn invalid_sampling_fails_before_any_target() {
        let remote = Arc::new(FakeRemote::new());
        let err = sampler(remote.clone())
            .sample(&["pc01".to_string()], &opts(5, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidSampling(_)));
        assert!(remote.sample_requests().is_empty());
    }
}
