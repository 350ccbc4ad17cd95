use super::{
    BundleRequest, Credentials, EventQuery, FaultArtifacts, HostFacts, ProtectionStatus,
    RawBundle, RawCounterSample, RemoteError, RemoteHost, VolumeStat,
};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

const PASSWORD_ENV: &str = "FLEETDIAG_REMOTE_PASSWORD";

#[derive(Debug, Clone)]
pub struct PowerShellRemote {
    probe_ports: Vec<u16>,
    transport_probe_timeout: Duration,
    command_timeout: Duration,
}

impl PowerShellRemote {
    pub fn new(
        probe_ports: Vec<u16>,
        transport_probe_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            probe_ports,
            transport_probe_timeout,
            command_timeout,
        }
    }

    async fn run(
        &self,
        script: &str,
        creds: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<String, RemoteError> {
        let wrapped = format!(
            "$ErrorActionPreference='Stop'; [Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); {}{script}",
            credential_prelude(creds)
        );
        let password = creds.map(|c| c.password.as_str());

        let output = match time::timeout(timeout, run_powershell(&wrapped, password)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(RemoteError::Timeout(timeout)),
        };

        let stdout = decode_cmd_stdout(&output.stdout);
        if !output.status.success() {
            let stderr = decode_cmd_stdout(&output.stderr);
            let message = first_error_line(&stderr).unwrap_or_else(|| {
                format!("powershell exited with {}", output.status)
            });
            return Err(RemoteError::Failed(message));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl RemoteHost for PowerShellRemote {
    async fn probe_connectivity(&self, target: &str, timeout: Duration) -> bool {
        for port in &self.probe_ports {
            let addr = format!("{target}:{port}");
            match time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_stream)) => return true,
                Ok(Err(err)) => {
                    debug!(address = %addr, error = %err, "connectivity probe refused");
                }
                Err(_elapsed) => {
                    debug!(address = %addr, "connectivity probe timeout");
                }
            }
        }
        false
    }

    async fn probe_transport(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<(), RemoteError> {
        let script = format!(
            "Test-WSMan -ComputerName {}{} | Out-Null; 'ok'",
            ps_quote(target),
            if creds.is_some() {
                " -Credential $cred -Authentication Default"
            } else {
                ""
            }
        );
        let out = self
            .run(&script, creds, self.transport_probe_timeout)
            .await?;
        if out.trim() == "ok" {
            Ok(())
        } else {
            Err(RemoteError::Parse(out.trim().to_string()))
        }
    }

    async fn execute_bundle(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        request: &BundleRequest,
    ) -> Result<RawBundle, RemoteError> {
        let script = format!(
            "Invoke-Command -ComputerName {}{} -ScriptBlock {{ {} }} -ArgumentList {},{},{},{}",
            ps_quote(target),
            credential_arg(creds),
            BUNDLE_SCRIPT,
            request.since_unix,
            ps_bool(request.security),
            ps_bool(request.crash_artifacts),
            ps_bool(request.updates),
        );
        let out = self.run(&script, creds, self.command_timeout).await?;
        parse_bundle(&out)
    }

    async fn query_event_count(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        query: &EventQuery,
        since_unix: i64,
    ) -> Result<u64, RemoteError> {
        let script = format!(
            "$since=[DateTimeOffset]::FromUnixTimeSeconds({since_unix}).LocalDateTime; \
             try {{ @(Get-WinEvent -ComputerName {}{} -FilterHashtable @{{LogName={}; Id={}; StartTime=$since}}).Count }} \
             catch {{ if ($_.FullyQualifiedErrorId -like 'NoMatchingEventsFound*') {{ 0 }} else {{ throw }} }}",
            ps_quote(target),
            credential_arg(creds),
            ps_quote(query.channel),
            query.event_id,
        );
        let out = self.run(&script, creds, self.command_timeout).await?;
        parse_count(&out)
    }

    async fn query_host_facts(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<HostFacts, RemoteError> {
        let script = format!(
            "{} $os=Get-CimInstance -CimSession $s -ClassName Win32_OperatingSystem; \
             $cs=Get-CimInstance -CimSession $s -ClassName Win32_ComputerSystem; \
             [pscustomobject]@{{ domain=$cs.Domain; os_name=$os.Caption; os_build=$os.Version; \
             last_boot_unix=([DateTimeOffset]$os.LastBootUpTime).ToUnixTimeSeconds(); \
             total_ram_gb=[math]::Round($os.TotalVisibleMemorySize/1MB,2); \
             free_ram_gb=[math]::Round($os.FreePhysicalMemory/1MB,2) }} | ConvertTo-Json -Compress",
            dcom_session(target, creds)
        );
        let out = self.run(&script, creds, self.command_timeout).await?;
        serde_json::from_str(out.trim()).map_err(|err| RemoteError::Parse(err.to_string()))
    }

    async fn query_volumes(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<Vec<VolumeStat>, RemoteError> {
        let script = format!(
            "{} Get-CimInstance -CimSession $s -ClassName Win32_LogicalDisk -Filter 'DriveType=3' | \
             ForEach-Object {{ \"$($_.DeviceID)|$([uint64]$_.Size)|$([uint64]$_.FreeSpace)\" }}",
            dcom_session(target, creds)
        );
        let out = self.run(&script, creds, self.command_timeout).await?;
        Ok(parse_volume_lines(&out))
    }

    async fn query_protection_status(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        since_unix: i64,
    ) -> Result<ProtectionStatus, RemoteError> {
        let script = format!(
            "{} $since=[DateTimeOffset]::FromUnixTimeSeconds({since_unix}).UtcDateTime; \
             $st=Get-CimInstance -CimSession $s -Namespace root/Microsoft/Windows/Defender -ClassName MSFT_MpComputerStatus; \
             $det=@(Get-CimInstance -CimSession $s -Namespace root/Microsoft/Windows/Defender -ClassName MSFT_MpThreatDetection | \
             Where-Object {{ $_.InitialDetectionTime -ge $since }}).Count; \
             $scan=$null; if ($st.QuickScanEndTime) {{ $scan=([DateTimeOffset]$st.QuickScanEndTime).ToUnixTimeSeconds() }}; \
             [pscustomobject]@{{ last_quick_scan_unix=$scan; recent_detections=$det }} | ConvertTo-Json -Compress",
            dcom_session(target, creds)
        );
        let out = self.run(&script, creds, self.command_timeout).await?;
        serde_json::from_str(out.trim()).map_err(|err| RemoteError::Parse(err.to_string()))
    }

    async fn query_fault_artifacts(
        &self,
        target: &str,
        creds: Option<&Credentials>,
    ) -> Result<FaultArtifacts, RemoteError> {
        let script = fault_artifacts_script(target, creds);
        let out = self.run(&script, creds, self.command_timeout).await?;
        serde_json::from_str(out.trim()).map_err(|err| RemoteError::Parse(err.to_string()))
    }

    async fn query_recent_updates(
        &self,
        target: &str,
        creds: Option<&Credentials>,
        since_unix: i64,
    ) -> Result<u64, RemoteError> {
        let script = format!(
            "$since=[DateTimeOffset]::FromUnixTimeSeconds({since_unix}).LocalDateTime; \
             @(Get-HotFix -ComputerName {}{} | Where-Object {{ $_.InstalledOn -and $_.InstalledOn -ge $since }}).Count",
            ps_quote(target),
            credential_arg(creds),
        );
        let out = self.run(&script, creds, self.command_timeout).await?;
        parse_count(&out)
    }

    async fn sample_counters(
        &self,
        target: &str,
        counters: &[String],
        interval: Duration,
        max_samples: u32,
        creds: Option<&Credentials>,
    ) -> Result<Vec<RawCounterSample>, RemoteError> {
        let interval_secs = interval.as_secs().max(1);
        let list = counters
            .iter()
            .map(|c| ps_quote(c))
            .collect::<Vec<_>>()
            .join(",");
        let sampler = format!(
            "Get-Counter -Counter @({list}) -SampleInterval {interval_secs} -MaxSamples {max_samples} | \
             ForEach-Object {{ $ts=([DateTimeOffset]$_.Timestamp).ToUnixTimeSeconds(); \
             $_.CounterSamples | ForEach-Object {{ \"$ts|$($_.Path)|$($_.CookedValue)\" }} }}"
        );
        let script = match creds {
            Some(_) => format!(
                "Invoke-Command -ComputerName {} -Credential $cred -ScriptBlock {{ {sampler} }}",
                ps_quote(target)
            ),
            None => sampler.replacen(
                "Get-Counter ",
                &format!("Get-Counter -ComputerName {} ", ps_quote(target)),
                1,
            ),
        };
        let budget = interval
            .saturating_mul(max_samples)
            .saturating_add(self.command_timeout);
        let out = self.run(&script, creds, budget).await?;
        Ok(parse_counter_lines(&out))
    }
}

const BUNDLE_SCRIPT: &str = r#"
param([long]$SinceUnix, [bool]$Security, [bool]$Artifacts, [bool]$Updates)
$since = [DateTimeOffset]::FromUnixTimeSeconds($SinceUnix).LocalDateTime
$f = [ordered]@{}; $e = [ordered]@{}
try {
  $os = Get-CimInstance Win32_OperatingSystem -ErrorAction Stop
  $cs = Get-CimInstance Win32_ComputerSystem -ErrorAction Stop
  $f.domain = $cs.Domain; $f.os_name = $os.Caption; $f.os_build = $os.Version
  $f.last_boot_unix = ([DateTimeOffset]$os.LastBootUpTime).ToUnixTimeSeconds()
  $f.total_ram_gb = [math]::Round($os.TotalVisibleMemorySize / 1MB, 2)
  $f.free_ram_gb = [math]::Round($os.FreePhysicalMemory / 1MB, 2)
} catch { $e.host_facts = $_.Exception.Message }
try {
  $f.volumes = @(Get-CimInstance Win32_LogicalDisk -Filter 'DriveType=3' -ErrorAction Stop | ForEach-Object {
    @{ name = $_.DeviceID; size_bytes = [uint64]$_.Size; free_bytes = [uint64]$_.FreeSpace } })
} catch { $e.volumes = $_.Exception.Message }
function Count-Events([string]$Key, [string]$Log, [int]$Id) {
  try { $f[$Key] = @(Get-WinEvent -FilterHashtable @{ LogName = $Log; Id = $Id; StartTime = $since } -ErrorAction Stop).Count }
  catch { if ($_.FullyQualifiedErrorId -like 'NoMatchingEventsFound*') { $f[$Key] = 0 } else { $e[$Key] = $_.Exception.Message } }
}
Count-Events 'app_crash' 'Application' 1000
Count-Events 'kernel_power' 'System' 41
Count-Events 'unexpected_shutdown' 'System' 6008
Count-Events 'resource_exhaustion' 'Microsoft-Windows-Resource-Exhaustion-Detector/Operational' 2004
Count-Events 'boot_degradation' 'Microsoft-Windows-Diagnostics-Performance/Operational' 100
if ($Security) {
  try {
    $st = Get-MpComputerStatus -ErrorAction Stop
    if ($st.QuickScanEndTime) { $f.last_quick_scan_unix = ([DateTimeOffset]$st.QuickScanEndTime).ToUnixTimeSeconds() }
    $f.recent_detections = @(Get-MpThreatDetection -ErrorAction SilentlyContinue | Where-Object { $_.InitialDetectionTime -ge $since }).Count
  } catch { $e.security = $_.Exception.Message }
}
if ($Artifacts) {
  try {
    $w = "$env:ProgramData\Microsoft\Windows\WER\ReportArchive"
    $f.archived_reports = if (Test-Path -LiteralPath $w) { @(Get-ChildItem -LiteralPath $w -Directory -ErrorAction Stop).Count } else { 0 }
  } catch { $e.archived_reports = $_.Exception.Message }
  try {
    $m = "$env:SystemRoot\Minidump"
    $d = if (Test-Path -LiteralPath $m) { @(Get-ChildItem -LiteralPath $m -Filter *.dmp -ErrorAction Stop).Count } else { 0 }
    if (Test-Path "$env:SystemRoot\MEMORY.DMP") { $d++ }
    $f.crash_dumps = $d
  } catch { $e.crash_dumps = $_.Exception.Message }
}
if ($Updates) {
  try { $f.recent_updates = @(Get-HotFix -ErrorAction Stop | Where-Object { $_.InstalledOn -and $_.InstalledOn -ge $since }).Count }
  catch { $e.recent_updates = $_.Exception.Message }
}
[pscustomobject]@{ fields = $f; errors = $e } | ConvertTo-Json -Compress -Depth 5
"#;

async fn run_powershell(script: &str, password: Option<&str>) -> Result<Output, RemoteError> {
    match spawn_shell("powershell", script, password).await {
        Ok(output) => Ok(output),
        Err(RemoteError::Spawn { .. }) => spawn_shell("pwsh", script, password).await,
        Err(err) => Err(err),
    }
}

async fn spawn_shell(
    program: &str,
    script: &str,
    password: Option<&str>,
) -> Result<Output, RemoteError> {
    let mut cmd = Command::new(program);
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", script])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(password) = password {
        cmd.env(PASSWORD_ENV, password);
    }
    cmd.output().await.map_err(|source| RemoteError::Spawn {
        program: program.to_string(),
        source,
    })
}

fn credential_prelude(creds: Option<&Credentials>) -> String {
    match creds {
        Some(c) => format!(
            "$cred=New-Object System.Management.Automation.PSCredential({}, (ConvertTo-SecureString $env:{PASSWORD_ENV} -AsPlainText -Force)); ",
            ps_quote(&c.username)
        ),
        None => String::new(),
    }
}

fn credential_arg(creds: Option<&Credentials>) -> &'static str {
    if creds.is_some() {
        " -Credential $cred"
    } else {
        ""
    }
}

fn dcom_session(target: &str, creds: Option<&Credentials>) -> String {
    format!(
        "$s=New-CimSession -ComputerName {}{} -SessionOption (New-CimSessionOption -Protocol Dcom);",
        ps_quote(target),
        credential_arg(creds)
    )
}

/// Counts archived fault reports and crash dumps over the admin share. An
/// unreachable share throws so the caller reports unknown; a missing
/// directory on a reachable share counts as zero.
fn fault_artifacts_script(target: &str, creds: Option<&Credentials>) -> String {
    let share = format!("\\\\{target}\\C$");
    format!(
        "{} $root={}; \
         if (-not (Test-Path -LiteralPath $root)) {{ throw \"admin share $root is not reachable\" }}; \
         $werDir=\"$root\\ProgramData\\Microsoft\\Windows\\WER\\ReportArchive\"; \
         $dmpDir=\"$root\\Windows\\Minidump\"; \
         $wer=if (Test-Path -LiteralPath $werDir) {{ @(Get-ChildItem -LiteralPath $werDir -Directory -ErrorAction Stop).Count }} else {{ 0 }}; \
         $dmp=if (Test-Path -LiteralPath $dmpDir) {{ @(Get-ChildItem -LiteralPath $dmpDir -Filter *.dmp -ErrorAction Stop).Count }} else {{ 0 }}; \
         if (Test-Path -LiteralPath \"$root\\Windows\\MEMORY.DMP\") {{ $dmp++ }}; \
         [pscustomobject]@{{ archived_reports=$wer; crash_dumps=$dmp }} | ConvertTo-Json -Compress",
        share_mount(creds, &share),
        ps_quote(&share),
    )
}

fn share_mount(creds: Option<&Credentials>, share: &str) -> String {
    match creds {
        Some(_) => format!(
            "New-PSDrive -Name fdiag -PSProvider FileSystem -Root {} -Credential $cred | Out-Null;",
            ps_quote(share)
        ),
        None => String::new(),
    }
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ps_bool(value: bool) -> &'static str {
    if value {
        "$true"
    } else {
        "$false"
    }
}

fn first_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches("Invoke-Command : ").to_string())
}

fn parse_bundle(text: &str) -> Result<RawBundle, RemoteError> {
    let json = text
        .lines()
        .map(str::trim)
        .rfind(|l| l.starts_with('{'))
        .ok_or_else(|| RemoteError::Parse("bundle produced no JSON document".to_string()))?;
    serde_json::from_str(json).map_err(|err| RemoteError::Parse(err.to_string()))
}

fn parse_count(text: &str) -> Result<u64, RemoteError> {
    let line = text
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or_default();
    parse_u64_loose(line).ok_or_else(|| RemoteError::Parse(format!("expected a count, got '{line}'")))
}

fn parse_volume_lines(text: &str) -> Vec<VolumeStat> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, '|').map(str::trim);
            let name = parts.next()?;
            let size_bytes = parse_u64_loose(parts.next()?)?;
            let free_bytes = parse_u64_loose(parts.next()?)?;
            Some(VolumeStat {
                name: name.to_string(),
                size_bytes,
                free_bytes,
            })
        })
        .collect()
}

fn parse_counter_lines(text: &str) -> Vec<RawCounterSample> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, '|').map(str::trim);
            let timestamp_unix = parts.next()?.parse::<i64>().ok()?;
            let counter_path = parts.next()?;
            let value = parse_f64_loose(parts.next()?)?;
            if counter_path.is_empty() || !value.is_finite() {
                return None;
            }
            Some(RawCounterSample {
                timestamp_unix,
                counter_path: counter_path.to_string(),
                value,
            })
        })
        .collect()
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    trimmed.replace(',', ".").parse::<f64>().ok()
}

fn parse_u64_loose(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<u64>() {
        return Some(v);
    }
    parse_f64_loose(trimmed).map(|v| if v < 0.0 { 0 } else { v as u64 })
}

fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}
