mod activity;
mod collectors;
mod compare;
mod config;
mod fleet;
mod perf;
mod remote;
mod report;
mod snapshot;
mod transport;

use activity::{ActivityLog, FileLog, TeeLog, TracingLog};
use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use fleet::{dedupe_targets, FleetDriver, FleetError};
use perf::PerfSampler;
use remote::powershell::PowerShellRemote;
use remote::RemoteHost;
use report::{ReportError, ReportFormat};
use serde::Deserialize;
use snapshot::{HostSnapshot, SnapshotAssembler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::TransportPreference;

#[derive(Parser, Debug)]
#[command(name = "fleetdiag")]
#[command(version, about = "Fleet-wide Windows diagnostics and good-vs-bad host comparison")]
struct Cli {
    /// YAML config file; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append activity lines to this file as well as stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect a snapshot from every target.
    Collect(CollectArgs),
    /// Compare a known-good host against a known-bad one.
    Compare(CompareArgs),
    /// Sample performance counters and summarize them.
    Perf(PerfArgs),
}

#[derive(Args, Debug, Default)]
struct TargetArgs {
    #[arg(long = "target", short = 't')]
    targets: Vec<String>,
    /// One host per line; blank lines and `#` comments are ignored.
    #[arg(long)]
    targets_file: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct TuningArgs {
    #[arg(long, value_enum)]
    transport: Option<TransportPreference>,
    #[arg(long)]
    lookback: Option<u32>,
    #[arg(long)]
    fast: bool,
    #[arg(long)]
    security: bool,
    #[arg(long)]
    crash_artifacts: bool,
    #[arg(long)]
    updates: bool,
    #[arg(long)]
    parallel: Option<usize>,
}

impl TuningArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(transport) = self.transport {
            cfg.transport = transport;
        }
        if let Some(days) = self.lookback {
            cfg.lookback_days = days;
        }
        if let Some(parallel) = self.parallel {
            cfg.max_parallel = parallel;
        }
        cfg.fast |= self.fast;
        cfg.include_security |= self.security;
        cfg.include_crash_artifacts |= self.crash_artifacts;
        cfg.include_updates |= self.updates;
    }
}

#[derive(Args, Debug)]
struct CollectArgs {
    #[command(flatten)]
    targets: TargetArgs,
    #[command(flatten)]
    tuning: TuningArgs,
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    format: ReportFormat,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Print each snapshot as a JSON line as soon as its host finishes.
    #[arg(long)]
    stream: bool,
}

#[derive(Args, Debug)]
struct CompareArgs {
    #[arg(long)]
    reference: Option<String>,
    #[arg(long)]
    difference: Option<String>,
    /// Saved snapshot JSON (single snapshot or a collect report).
    #[arg(long)]
    reference_file: Option<PathBuf>,
    #[arg(long)]
    difference_file: Option<PathBuf>,
    #[command(flatten)]
    tuning: TuningArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PerfArgs {
    #[command(flatten)]
    targets: TargetArgs,
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
    #[arg(long = "counter")]
    counters: Vec<String>,
    #[arg(long)]
    parallel: Option<usize>,
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    format: ReportFormat,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid snapshot file {path}: {reason}")]
    SnapshotFile { path: String, reason: String },
    #[error("{0}")]
    Usage(String),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    if let Err(err) = run(cli).await {
        error!(error = %err, "fleetdiag failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let Some(command) = cli.command else {
        return Err(AppError::Usage(
            "no command given; try `fleetdiag collect --help`".to_string(),
        ));
    };

    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    let log = build_log(cli.log_file.as_ref().or(cfg.log_file.as_ref()))?;

    match command {
        Command::Collect(args) => {
            args.tuning.apply(&mut cfg);
            cfg.validate()?;
            run_collect(&cfg, log, args).await
        }
        Command::Compare(args) => {
            args.tuning.apply(&mut cfg);
            cfg.validate()?;
            run_compare(&cfg, log, args).await
        }
        Command::Perf(args) => run_perf(cfg, log, args).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn build_log(path: Option<&PathBuf>) -> Result<Arc<dyn ActivityLog>, AppError> {
    let tracing_log: Arc<dyn ActivityLog> = Arc::new(TracingLog);
    let Some(path) = path else {
        return Ok(tracing_log);
    };
    let file = FileLog::open(path).map_err(|source| AppError::LogFile {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Arc::new(TeeLog::new(tracing_log, Arc::new(file))))
}

fn build_remote(cfg: &Config) -> Arc<dyn RemoteHost> {
    Arc::new(PowerShellRemote::new(
        cfg.precheck_ports.clone(),
        cfg.transport_probe_timeout(),
        cfg.command_timeout(),
    ))
}

fn build_driver(cfg: &Config, log: Arc<dyn ActivityLog>) -> Result<FleetDriver, AppError> {
    let credentials = cfg.resolve_credentials()?;
    let assembler = SnapshotAssembler::new(
        build_remote(cfg),
        log.clone(),
        cfg.assembler_options(credentials),
    );
    Ok(FleetDriver::new(assembler, log, cfg.max_parallel))
}

fn resolve_targets(args: &TargetArgs, cfg: &Config) -> Result<Vec<String>, AppError> {
    let mut targets = args.targets.clone();
    if let Some(path) = &args.targets_file {
        let text = std::fs::read_to_string(path).map_err(|source| AppError::Read {
            path: path.display().to_string(),
            source,
        })?;
        targets.extend(parse_targets_file(&text));
    }
    if targets.is_empty() {
        targets = cfg.targets.clone();
    }
    Ok(dedupe_targets(targets))
}

fn parse_targets_file(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn emit(output: Option<&Path>, contents: &str) -> Result<(), AppError> {
    match output {
        Some(path) => {
            report::write_report(path, contents)?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{contents}"),
    }
    Ok(())
}

async fn run_collect(cfg: &Config, log: Arc<dyn ActivityLog>, args: CollectArgs) -> Result<(), AppError> {
    let targets = resolve_targets(&args.targets, cfg)?;
    let driver = build_driver(cfg, log)?;

    let snapshots = if args.stream {
        stream_to_stdout(&driver, &targets).await?
    } else {
        driver.collect(&targets).await?
    };

    // Streaming already printed every snapshot; only a file report remains.
    if args.stream && args.output.is_none() {
        return Ok(());
    }
    let rendered = report::render_snapshots(&snapshots, args.format)?;
    emit(args.output.as_deref(), &rendered)
}

async fn stream_to_stdout(driver: &FleetDriver, targets: &[String]) -> Result<Vec<HostSnapshot>, AppError> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (mut rx, handle) = driver.stream(targets, cancel_rx)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut delivered = Vec::with_capacity(targets.len());

    loop {
        tokio::select! {
            res = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match res {
                    Ok(()) => {
                        warn!("Ctrl+C received, cancelling remaining targets");
                        let _ = cancel_tx.send(true);
                    }
                    Err(err) => error!(error = %err, "failed to listen for Ctrl+C"),
                }
            }
            next = rx.recv() => match next {
                Some(snapshot) => {
                    println!("{}", serde_json::to_string(&snapshot).map_err(ReportError::from)?);
                    delivered.push(snapshot);
                }
                None => break,
            }
        }
    }

    if let Err(err) = handle.await {
        error!(error = %err, "fleet stream task failed");
    }
    Ok(delivered)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Many(Vec<HostSnapshot>),
    One(Box<HostSnapshot>),
}

fn load_snapshot(path: &Path, wanted: Option<&str>) -> Result<HostSnapshot, AppError> {
    let path_display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| AppError::Read {
        path: path_display.clone(),
        source,
    })?;
    let parsed: SnapshotFile =
        serde_json::from_str(&text).map_err(|err| AppError::SnapshotFile {
            path: path_display.clone(),
            reason: err.to_string(),
        })?;
    pick_snapshot(parsed, wanted).map_err(|reason| AppError::SnapshotFile {
        path: path_display,
        reason,
    })
}

fn pick_snapshot(file: SnapshotFile, wanted: Option<&str>) -> Result<HostSnapshot, String> {
    let many = match file {
        SnapshotFile::One(snapshot) => return Ok(*snapshot),
        SnapshotFile::Many(many) => many,
    };
    match wanted {
        Some(name) => many
            .into_iter()
            .find(|s| s.target.eq_ignore_ascii_case(name))
            .ok_or_else(|| format!("no snapshot for '{name}'")),
        None if many.len() == 1 => many
            .into_iter()
            .next()
            .ok_or_else(|| "file holds no snapshots".to_string()),
        None => Err(format!(
            "file holds {} snapshots; name the host to use",
            many.len()
        )),
    }
}

async fn run_compare(cfg: &Config, log: Arc<dyn ActivityLog>, args: CompareArgs) -> Result<(), AppError> {
    let mut reference = match &args.reference_file {
        Some(path) => Some(load_snapshot(path, args.reference.as_deref())?),
        None => None,
    };
    let mut difference = match &args.difference_file {
        Some(path) => Some(load_snapshot(path, args.difference.as_deref())?),
        None => None,
    };

    let mut live = Vec::new();
    if reference.is_none() {
        live.push(args.reference.clone().ok_or_else(|| {
            AppError::Usage("give --reference or --reference-file".to_string())
        })?);
    }
    if difference.is_none() {
        live.push(args.difference.clone().ok_or_else(|| {
            AppError::Usage("give --difference or --difference-file".to_string())
        })?);
    }

    if !live.is_empty() {
        let driver = build_driver(cfg, log)?;
        let mut collected = driver.collect(&live).await?.into_iter();
        if reference.is_none() {
            reference = collected.next();
        }
        if difference.is_none() {
            difference = collected.next();
        }
    }

    let (Some(reference), Some(difference)) = (reference, difference) else {
        return Err(AppError::Usage("both hosts are required".to_string()));
    };
    for s in [&reference, &difference] {
        if !s.reachable {
            warn!(
                target_host = %s.target,
                reason = s.failure_reason.as_deref().unwrap_or_default(),
                "host unreachable, its metrics will show as n/a"
            );
        }
    }

    let result = compare::compare(&reference, &difference);
    if args.json {
        let rendered = serde_json::to_string_pretty(&result).map_err(ReportError::from)?;
        println!("{rendered}");
    } else {
        print!("{}", report::comparison_table(&result));
    }
    Ok(())
}

async fn run_perf(mut cfg: Config, log: Arc<dyn ActivityLog>, args: PerfArgs) -> Result<(), AppError> {
    if let Some(parallel) = args.parallel {
        cfg.max_parallel = parallel;
    }
    cfg.validate()?;

    let mut opts = cfg.perf_options();
    if let Some(duration) = args.duration {
        opts.duration = duration;
    }
    if let Some(interval) = args.interval {
        opts.interval = interval;
    }
    if !args.counters.is_empty() {
        opts.counters = args.counters.clone();
    }

    let targets = resolve_targets(&args.targets, &cfg)?;
    let sampler = PerfSampler::new(
        build_remote(&cfg),
        log,
        cfg.resolve_credentials()?,
        cfg.precheck_timeout(),
        cfg.max_parallel,
    );
    let samples = sampler.sample(&targets, &opts).await?;
    let rendered = report::render_performance(&samples, args.format)?;
    emit(args.output.as_deref(), &rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn targets_file_skips_comments_and_blanks() {
        let text = "# front desk\npc01\n\n  pc02  \n#pc03\n";
        assert_eq!(parse_targets_file(text), vec!["pc01", "pc02"]);
    }

    #[test]
    fn flags_override_config_values() {
        let mut cfg = Config::default();
        let args = TuningArgs {
            transport: Some(TransportPreference::Rpc),
            lookback: Some(3),
            fast: true,
            parallel: Some(1),
            ..TuningArgs::default()
        };
        args.apply(&mut cfg);
        assert_eq!(cfg.transport, TransportPreference::Rpc);
        assert_eq!(cfg.lookback_days, 3);
        assert_eq!(cfg.max_parallel, 1);
        assert!(cfg.fast);
    }

    #[test]
    fn cli_parses_perf_durations() {
        let cli = Cli::try_parse_from([
            "fleetdiag", "perf", "-t", "pc01", "--duration", "1m", "--interval", "10s",
            "--counter", r"\Memory\Available MBytes",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Perf(args)) => {
                assert_eq!(args.duration, Some(Duration::from_secs(60)));
                assert_eq!(args.interval, Some(Duration::from_secs(10)));
                assert_eq!(args.counters.len(), 1);
            }
            other => panic!("expected perf, got {other:?}"),
        }
    }

    #[test]
    fn named_snapshot_is_picked_from_a_report() {
        let a = HostSnapshot::unreachable("pc01", 0, None, "down");
        let b = HostSnapshot::unreachable("PC02", 0, None, "down");
        let many = SnapshotFile::Many(vec![a, b.clone()]);
        assert_eq!(pick_snapshot(many, Some("pc02")).unwrap(), b);

        let many = SnapshotFile::Many(vec![b.clone(), b]);
        assert!(pick_snapshot(many, None).is_err());
    }
}
