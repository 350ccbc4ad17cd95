use crate::collectors::CollectorOptions;
use crate::perf::{PerfOptions, DEFAULT_COUNTERS};
use crate::remote::Credentials;
use crate::snapshot::AssemblerOptions;
use crate::transport::TransportPreference;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub transport: TransportPreference,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default)]
    pub fast: bool,
    #[serde(default)]
    pub include_security: bool,
    #[serde(default)]
    pub include_crash_artifacts: bool,
    #[serde(default)]
    pub include_updates: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_precheck_timeout_ms")]
    pub precheck_timeout_ms: u64,
    #[serde(default = "default_precheck_ports")]
    pub precheck_ports: Vec<u16>,
    #[serde(default = "default_transport_probe_timeout_ms")]
    pub transport_probe_timeout_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    pub username: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_perf_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_perf_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_perf_counters")]
    pub counters: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            transport: TransportPreference::Auto,
            lookback_days: default_lookback_days(),
            fast: false,
            include_security: false,
            include_crash_artifacts: false,
            include_updates: false,
            max_parallel: default_max_parallel(),
            precheck_timeout_ms: default_precheck_timeout_ms(),
            precheck_ports: default_precheck_ports(),
            transport_probe_timeout_ms: default_transport_probe_timeout_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            credentials: None,
            performance: PerformanceConfig::default(),
            log_file: None,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_perf_duration_secs(),
            interval_secs: default_perf_interval_secs(),
            counters: default_perf_counters(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("password environment variable '{0}' is not set or empty")]
    MissingSecret(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;
        let cfg = Self::from_yaml(&text).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path_display,
                source,
            },
            other => other,
        })?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_days < 1 {
            return Err(ConfigError::Validation(
                "lookback_days must be >= 1".to_string(),
            ));
        }
        if self.max_parallel < 1 {
            return Err(ConfigError::Validation(
                "max_parallel must be >= 1".to_string(),
            ));
        }
        if self.precheck_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "precheck_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.transport_probe_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "transport_probe_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "command_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.precheck_ports.is_empty() {
            return Err(ConfigError::Validation(
                "precheck_ports needs at least one port".to_string(),
            ));
        }
        if self.precheck_ports.contains(&0) {
            return Err(ConfigError::Validation(
                "precheck_ports must be in 1..65535".to_string(),
            ));
        }
        if let Some(creds) = &self.credentials {
            if creds.username.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "credentials.username must not be empty".to_string(),
                ));
            }
            if creds.password_env.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "credentials.password_env must not be empty".to_string(),
                ));
            }
        }
        validate_performance(&self.performance)?;
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }

    /// Reads the password from the environment. Checked at startup rather
    /// than in `validate` so a config file can be linted without secrets.
    pub fn resolve_credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let Some(creds) = &self.credentials else {
            return Ok(None);
        };
        let password = std::env::var(&creds.password_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingSecret(creds.password_env.clone()))?;
        Ok(Some(Credentials {
            username: creds.username.trim().to_string(),
            password,
        }))
    }

    pub fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            lookback_days: self.lookback_days,
            fast: self.fast,
            include_security: self.include_security,
            include_crash_artifacts: self.include_crash_artifacts,
            include_updates: self.include_updates,
        }
    }

    pub fn assembler_options(&self, credentials: Option<Credentials>) -> AssemblerOptions {
        AssemblerOptions {
            collectors: self.collector_options(),
            transport: self.transport,
            credentials,
            precheck_timeout: self.precheck_timeout(),
            transport_probe_timeout: self.transport_probe_timeout(),
        }
    }

    pub fn perf_options(&self) -> PerfOptions {
        PerfOptions {
            duration: Duration::from_secs(self.performance.duration_secs),
            interval: Duration::from_secs(self.performance.interval_secs),
            counters: self.performance.counters.clone(),
        }
    }

    pub fn precheck_timeout(&self) -> Duration {
        Duration::from_millis(self.precheck_timeout_ms)
    }

    pub fn transport_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_probe_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn validate_performance(cfg: &PerformanceConfig) -> Result<(), ConfigError> {
    if cfg.interval_secs < 1 {
        return Err(ConfigError::Validation(
            "performance.interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.duration_secs < 1 {
        return Err(ConfigError::Validation(
            "performance.duration_secs must be >= 1".to_string(),
        ));
    }
    if cfg.counters.is_empty() {
        return Err(ConfigError::Validation(
            "performance.counters needs at least one counter path".to_string(),
        ));
    }
    if cfg.counters.iter().any(|c| c.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "performance.counters must not contain blank paths".to_string(),
        ));
    }
    Ok(())
}

const fn default_lookback_days() -> u32 {
    7
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_precheck_timeout_ms() -> u64 {
    1500
}

fn default_precheck_ports() -> Vec<u16> {
    vec![135, 445, 5985]
}

const fn default_transport_probe_timeout_ms() -> u64 {
    5000
}

const fn default_command_timeout_secs() -> u64 {
    120
}

fn default_password_env() -> String {
    "FLEETDIAG_PASSWORD".to_string()
}

const fn default_perf_duration_secs() -> u64 {
    30
}

const fn default_perf_interval_secs() -> u64 {
    5
}

fn default_perf_counters() -> Vec<String> {
    DEFAULT_COUNTERS.iter().map(|c| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_and_validates() {
        let cfg = Config::from_yaml(Config::example_yaml()).expect("example config must be valid");
        assert_eq!(cfg.precheck_ports, vec![135, 445, 5985]);
        assert_eq!(cfg.transport, TransportPreference::Auto);
    }

    #[test]
    fn empty_document_falls_back_to_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert_eq!(cfg.lookback_days, 7);
        assert_eq!(cfg.max_parallel, 4);
        assert!(cfg.credentials.is_none());
        assert_eq!(cfg.performance.counters.len(), DEFAULT_COUNTERS.len());
        assert_eq!(cfg.perf_options().sample_count(), 6);
    }

    #[test]
    fn transport_names_are_lowercase() {
        let cfg = Config::from_yaml("transport: winrm\ntargets: [pc01, pc02]\n").unwrap();
        assert_eq!(cfg.transport, TransportPreference::WinRm);
        assert_eq!(cfg.targets, vec!["pc01", "pc02"]);
        assert!(Config::from_yaml("transport: smb\n").is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        for doc in [
            "lookback_days: 0",
            "max_parallel: 0",
            "precheck_timeout_ms: 0",
            "precheck_ports: []",
            "precheck_ports: [135, 0]",
            "command_timeout_secs: 0",
            "performance: { interval_secs: 0 }",
            "performance: { counters: ['  '] }",
            "credentials: { username: admin, password_env: '' }",
        ] {
            match Config::from_yaml(doc) {
                Err(ConfigError::Validation(_)) => {}
                other => panic!("{doc}: expected validation error, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_password_env_is_reported_at_resolve_time() {
        let cfg = Config::from_yaml(
            "credentials: { username: 'CORP\\\\admin', password_env: FLEETDIAG_TEST_MISSING_9431 }",
        )
        .unwrap();
        std::env::remove_var("FLEETDIAG_TEST_MISSING_9431");
        match cfg.resolve_credentials() {
            Err(ConfigError::MissingSecret(name)) => assert_eq!(name, "FLEETDIAG_TEST_MISSING_9431"),
            other => panic!("expected missing secret, got {other:?}"),
        }
    }

    #[test]
    fn load_reports_path_on_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetdiag.yaml");
        fs::write(&path, "targets: [unclosed").unwrap();
        let err = Config::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("fleetdiag.yaml"));
    }
}
