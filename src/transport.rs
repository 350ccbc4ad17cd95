use crate::activity::ActivityLog;
use crate::remote::{Credentials, RemoteHost, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    #[default]
    Auto,
    #[value(name = "winrm")]
    WinRm,
    Rpc,
}

/// Picks the remote-execution mechanism for one target. Never fails: any
/// primary-transport probe failure silently selects the RPC fallback.
pub async fn select_transport(
    remote: &dyn RemoteHost,
    log: &dyn ActivityLog,
    target: &str,
    preference: TransportPreference,
    creds: Option<&Credentials>,
    probe_timeout: Duration,
) -> Transport {
    match preference {
        TransportPreference::WinRm => Transport::WinRm,
        TransportPreference::Rpc => Transport::Rpc,
        TransportPreference::Auto => {
            match time::timeout(probe_timeout, remote.probe_transport(target, creds)).await {
                Ok(Ok(())) => {
                    log.log(Level::DEBUG, &format!("[{target}] WinRM probe succeeded"));
                    Transport::WinRm
                }
                Ok(Err(err)) => {
                    log.log(
                        Level::WARN,
                        &format!("[{target}] WinRM unavailable, falling back to RPC: {err}"),
                    );
                    Transport::Rpc
                }
                Err(_elapsed) => {
                    log.log(
                        Level::WARN,
                        &format!(
                            "[{target}] WinRM probe timed out after {}, falling back to RPC",
                            humantime::format_duration(probe_timeout)
                        ),
                    );
                    Transport::Rpc
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::NoopLog;
    use crate::remote::fake::{FakeRemote, HostScript};
    use std::sync::atomic::Ordering;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn forced_preferences_never_probe() {
        let remote = FakeRemote::new();
        let rpc = select_transport(&remote, &NoopLog, "pc01", TransportPreference::Rpc, None, TIMEOUT).await;
        let winrm =
            select_transport(&remote, &NoopLog, "pc01", TransportPreference::WinRm, None, TIMEOUT).await;
        assert_eq!(rpc, Transport::Rpc);
        assert_eq!(winrm, Transport::WinRm);
        assert_eq!(remote.transport_probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_uses_primary_when_probe_succeeds() {
        let remote = FakeRemote::new();
        let chosen =
            select_transport(&remote, &NoopLog, "pc01", TransportPreference::Auto, None, TIMEOUT).await;
        assert_eq!(chosen, Transport::WinRm);
        assert_eq!(remote.transport_probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_falls_back_on_probe_failure() {
        let remote = FakeRemote::new().with_host(
            "pc02",
            HostScript {
                winrm_error: Some("Access is denied".to_string()),
                ..HostScript::default()
            },
        );
        let chosen =
            select_transport(&remote, &NoopLog, "pc02", TransportPreference::Auto, None, TIMEOUT).await;
        assert_eq!(chosen, Transport::Rpc);
        assert_eq!(remote.transport_probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_falls_back_on_probe_timeout() {
        let remote = FakeRemote::new().with_host(
            "pc03",
            HostScript {
                probe_hangs: true,
                ..HostScript::default()
            },
        );
        let chosen = select_transport(
            &remote,
            &NoopLog,
            "pc03",
            TransportPreference::Auto,
            None,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(chosen, Transport::Rpc);
    }
}
