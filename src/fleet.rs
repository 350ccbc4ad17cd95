use crate::activity::ActivityLog;
use crate::snapshot::{now_unix, HostSnapshot, SnapshotAssembler};
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::Level;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("no targets were given")]
    EmptyTargets,
    #[error("target #{0} is blank")]
    BlankTarget(usize),
    #[error("a collection run is already active on this driver")]
    AlreadyRunning,
    #[error("invalid sampling parameters: {0}")]
    InvalidSampling(String),
}

pub fn validate_targets(targets: &[String]) -> Result<(), FleetError> {
    if targets.is_empty() {
        return Err(FleetError::EmptyTargets);
    }
    if let Some(idx) = targets.iter().position(|t| t.trim().is_empty()) {
        return Err(FleetError::BlankTarget(idx + 1));
    }
    Ok(())
}

/// Iterates a target list through the assembler with per-target isolation.
pub struct FleetDriver {
    assembler: SnapshotAssembler,
    log: Arc<dyn ActivityLog>,
    max_parallel: usize,
    run_gate: Arc<Mutex<()>>,
}

impl FleetDriver {
    pub fn new(assembler: SnapshotAssembler, log: Arc<dyn ActivityLog>, max_parallel: usize) -> Self {
        Self {
            assembler,
            log,
            max_parallel: max_parallel.max(1),
            run_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Batch mode: one snapshot per target, in input order.
    pub async fn collect(&self, targets: &[String]) -> Result<Vec<HostSnapshot>, FleetError> {
        validate_targets(targets)?;
        let _gate = self.acquire()?;
        self.log.log(
            Level::INFO,
            &format!(
                "fleet run started: {} target(s), parallelism {}",
                targets.len(),
                self.max_parallel
            ),
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        for (idx, target) in targets.iter().enumerate() {
            let assembler = self.assembler.clone();
            let semaphore = semaphore.clone();
            let target = target.trim().to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (idx, isolate(assembler, target).await)
            });
        }

        let mut slots: Vec<Option<HostSnapshot>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            // isolate() already turns per-target panics into snapshots; the
            // outer task only fails if the runtime is shutting down.
            if let Ok((idx, snapshot)) = joined {
                slots[idx] = Some(snapshot);
            }
        }

        let snapshots: Vec<HostSnapshot> = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| {
                    HostSnapshot::unreachable(target.trim(), now_unix(), None, "collection task was lost")
                })
            })
            .collect();
        self.log_summary(&snapshots);
        Ok(snapshots)
    }

    /// Streaming mode: snapshots are sent as each target finishes, in
    /// completion order. Setting `cancel` to true aborts targets still in
    /// flight; snapshots already sent are untouched.
    pub fn stream(
        &self,
        targets: &[String],
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(mpsc::Receiver<HostSnapshot>, JoinHandle<()>), FleetError> {
        validate_targets(targets)?;
        let gate = self.acquire()?;
        let (tx, rx) = mpsc::channel(targets.len());
        let assembler = self.assembler.clone();
        let log = self.log.clone();
        let max_parallel = self.max_parallel;
        let targets: Vec<String> = targets.iter().map(|t| t.trim().to_string()).collect();

        let handle = tokio::spawn(async move {
            let _gate: OwnedMutexGuard<()> = gate;
            let semaphore = Arc::new(Semaphore::new(max_parallel));
            let mut tasks = JoinSet::new();
            for target in &targets {
                let assembler = assembler.clone();
                let semaphore = semaphore.clone();
                let target = target.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    isolate(assembler, target).await
                });
            }

            let mut delivered = 0_usize;
            let mut watching = true;
            if *cancel.borrow() {
                tasks.abort_all();
            }
            loop {
                tokio::select! {
                    biased;
                    changed = cancel.changed(), if watching => {
                        match changed {
                            Ok(()) if *cancel.borrow() => {
                                tasks.abort_all();
                                log.log(
                                    Level::WARN,
                                    &format!(
                                        "fleet run cancelled after {delivered} of {} target(s)",
                                        targets.len()
                                    ),
                                );
                                break;
                            }
                            Ok(()) => {}
                            // Nobody can cancel any more; keep collecting.
                            Err(_) => watching = false,
                        }
                    }
                    joined = tasks.join_next() => {
                        match joined {
                            Some(Ok(snapshot)) => {
                                delivered += 1;
                                if tx.send(snapshot).await.is_err() {
                                    tasks.abort_all();
                                    break;
                                }
                            }
                            Some(Err(_)) => {}
                            None => break,
                        }
                    }
                }
            }
            while tasks.join_next().await.is_some() {}
        });

        Ok((rx, handle))
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<()>, FleetError> {
        self.run_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| FleetError::AlreadyRunning)
    }

    fn log_summary(&self, snapshots: &[HostSnapshot]) {
        let reachable = snapshots.iter().filter(|s| s.reachable).count();
        self.log.log(
            Level::INFO,
            &format!(
                "fleet run finished: {reachable} reachable, {} unreachable",
                snapshots.len() - reachable
            ),
        );
    }
}

/// Outermost per-target boundary: anything that escapes the assembler,
/// panics included, becomes an unreachable snapshot. The inner task lives in
/// a JoinSet so aborting the caller also aborts the remote call.
async fn isolate(assembler: SnapshotAssembler, target: String) -> HostSnapshot {
    let started = now_unix();
    let inner_target = target.clone();
    let mut inner = JoinSet::new();
    inner.spawn(async move { assembler.assemble(&inner_target).await });
    match inner.join_next().await {
        Some(Ok(snapshot)) => snapshot,
        Some(Err(err)) => {
            HostSnapshot::unreachable(&target, started, None, join_failure_reason(err))
        }
        None => HostSnapshot::unreachable(&target, started, None, "collection task was lost"),
    }
}

pub(crate) fn join_failure_reason(err: JoinError) -> String {
    if err.is_cancelled() {
        return "collection was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("collection panicked: {}", panic_message(payload.as_ref())),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

pub fn dedupe_targets(targets: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_ascii_lowercase()))
        .collect()
}
