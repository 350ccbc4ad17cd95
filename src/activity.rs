use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::Level;

/// Side-channel sink for collection activity. Callers never inspect the outcome.
pub trait ActivityLog: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl ActivityLog for TracingLog {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "fleetdiag::activity", "{message}"),
            Level::WARN => tracing::warn!(target: "fleetdiag::activity", "{message}"),
            Level::INFO => tracing::info!(target: "fleetdiag::activity", "{message}"),
            Level::DEBUG => tracing::debug!(target: "fleetdiag::activity", "{message}"),
            Level::TRACE => tracing::trace!(target: "fleetdiag::activity", "{message}"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl ActivityLog for NoopLog {
    fn log(&self, _level: Level, _message: &str) {}
}

pub struct FileLog {
    file: Mutex<File>,
}

impl FileLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ActivityLog for FileLog {
    fn log(&self, level: Level, message: &str) {
        let line = format_line(SystemTime::now(), level, message);
        // Blocking write from async callers: lines are short, the file is
        // local and callers never wait on the outcome. One write_all per
        // line while holding the lock keeps lines whole.
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

pub struct TeeLog {
    first: Arc<dyn ActivityLog>,
    second: Arc<dyn ActivityLog>,
}

impl TeeLog {
    pub fn new(first: Arc<dyn ActivityLog>, second: Arc<dyn ActivityLog>) -> Self {
        Self { first, second }
    }
}

impl ActivityLog for TeeLog {
    fn log(&self, level: Level, message: &str) {
        self.first.log(level, message);
        self.second.log(level, message);
    }
}

fn format_line(at: SystemTime, level: Level, message: &str) -> String {
    let flat = message.replace(['\r', '\n'], " ");
    format!(
        "{} [{}] {}\n",
        humantime::format_rfc3339_seconds(at),
        level,
        flat
    )
}
