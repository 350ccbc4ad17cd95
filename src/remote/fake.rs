use super::{
    BundleRequest, Credentials, EventQuery, FaultArtifacts, HostFacts, ProtectionStatus,
    RawBundle, RawCounterSample, RemoteError, RemoteHost, VolumeStat,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted host behaviour. Anything not configured answers as a healthy,
/// empty Windows box.
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    pub offline: bool,
    pub winrm_error: Option<String>,
    pub probe_hangs: bool,
    pub bundle: Option<Result<RawBundle, String>>,
    pub facts: Option<Result<HostFacts, String>>,
    pub volumes: Option<Result<Vec<VolumeStat>, String>>,
    pub events: HashMap<u32, Result<u64, String>>,
    pub protection: Option<Result<ProtectionStatus, String>>,
    pub artifacts: Option<Result<FaultArtifacts, String>>,
    pub updates: Option<Result<u64, String>>,
    pub counters: Option<Result<Vec<RawCounterSample>, String>>,
    pub panic_on_collect: bool,
    pub delay: Option<Duration>,
}

#[derive(Default)]
pub struct FakeRemote {
    hosts: Mutex<HashMap<String, HostScript>>,
    pub transport_probes: AtomicUsize,
    pub bundle_calls: AtomicUsize,
    pub event_calls: AtomicUsize,
    pub optional_calls: AtomicUsize,
    sample_requests: Mutex<Vec<(String, u32)>>,
    finished: Mutex<HashSet<String>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, target: &str, script: HostScript) -> Self {
        if let Ok(mut hosts) = self.hosts.lock() {
            hosts.insert(target.to_string(), script);
        }
        self
    }

    pub fn sample_requests(&self) -> Vec<(String, u32)> {
        self.sample_requests.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn finished(&self, target: &str) -> bool {
        self.finished
            .lock()
            .map(|s| s.contains(target))
            .unwrap_or(false)
    }

    fn script(&self, target: &str) -> HostScript {
        self.hosts
            .lock()
            .ok()
            .and_then(|h| h.get(target).cloned())
            .unwrap_or_default()
    }

    async fn pause(&self, script: &HostScript) {
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn lift<T>(value: Result<T, String>) -> Result<T, RemoteError> {
    value.map_err(RemoteError::Failed)
}

#[async_trait]
impl RemoteHost for FakeRemote {
    async fn probe_connectivity(&self, target: &str, _timeout: Duration) -> bool {
        !self.script(target).offline
    }

    async fn probe_transport(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
    ) -> Result<(), RemoteError> {
        self.transport_probes.fetch_add(1, Ordering::SeqCst);
        let script = self.script(target);
        if script.probe_hangs {
            std::future::pending::<()>().await;
        }
        match script.winrm_error {
            Some(err) => Err(RemoteError::Failed(err)),
            None => Ok(()),
        }
    }

    async fn execute_bundle(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
        _request: &BundleRequest,
    ) -> Result<RawBundle, RemoteError> {
        self.bundle_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script(target);
        if script.panic_on_collect {
            panic!("collector blew up on {target}");
        }
        self.pause(&script).await;
        let result = lift(script.bundle.unwrap_or_else(|| Ok(RawBundle::default())));
        if let Ok(mut finished) = self.finished.lock() {
            finished.insert(target.to_string());
        }
        result
    }

    async fn query_event_count(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
        query: &EventQuery,
        _since_unix: i64,
    ) -> Result<u64, RemoteError> {
        self.event_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script(target);
        lift(script.events.get(&query.event_id).cloned().unwrap_or(Ok(0)))
    }

    async fn query_host_facts(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
    ) -> Result<HostFacts, RemoteError> {
        let script = self.script(target);
        if script.panic_on_collect {
            panic!("collector blew up on {target}");
        }
        self.pause(&script).await;
        lift(script.facts.unwrap_or_else(|| Ok(HostFacts::default())))
    }

    async fn query_volumes(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
    ) -> Result<Vec<VolumeStat>, RemoteError> {
        lift(self.script(target).volumes.unwrap_or_else(|| Ok(Vec::new())))
    }

    async fn query_protection_status(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
        _since_unix: i64,
    ) -> Result<ProtectionStatus, RemoteError> {
        self.optional_calls.fetch_add(1, Ordering::SeqCst);
        lift(self.script(target).protection.unwrap_or_else(|| Ok(ProtectionStatus::default())))
    }

    async fn query_fault_artifacts(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
    ) -> Result<FaultArtifacts, RemoteError> {
        self.optional_calls.fetch_add(1, Ordering::SeqCst);
        lift(self.script(target).artifacts.unwrap_or_else(|| Ok(FaultArtifacts::default())))
    }

    async fn query_recent_updates(
        &self,
        target: &str,
        _creds: Option<&Credentials>,
        _since_unix: i64,
    ) -> Result<u64, RemoteError> {
        self.optional_calls.fetch_add(1, Ordering::SeqCst);
        lift(self.script(target).updates.unwrap_or(Ok(0)))
    }

    async fn sample_counters(
        &self,
        target: &str,
        _counters: &[String],
        _interval: Duration,
        max_samples: u32,
        _creds: Option<&Credentials>,
    ) -> Result<Vec<RawCounterSample>, RemoteError> {
        if let Ok(mut requests) = self.sample_requests.lock() {
            requests.push((target.to_string(), max_samples));
        }
        let script = self.script(target);
        if script.panic_on_collect {
            panic!("sampler blew up on {target}");
        }
        lift(script.counters.unwrap_or_else(|| Ok(Vec::new())))
    }
}
