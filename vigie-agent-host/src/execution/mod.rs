//! Task execution for Vigie agents
//!
//! One handler per `TaskKind`, each turning the task into an i18n result
//! payload the controller renders for the requester:
//! - `selftest`, `uptime`, `traffic`: answered from the current snapshot
//! - `top`: fresh two-pass process sample
//! - `speedtest`: external `speedtest-cli --json` with a hard deadline
//! - `reboot`: acknowledged here, the reboot itself is issued by the agent
//!   loop once the acknowledgement has been flushed

use serde::Deserialize;
use std::process::{Output, Stdio};
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command as AsyncCommand;
use tracing::{info, warn};
use vigie_proto::{ResultPayload, TaskKind, WireStats};

pub const SPEEDTEST_TIMEOUT: Duration = Duration::from_secs(90);
const TOP_N: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("{0} failed: {1}")]
    Failed(String, String),
    #[error("unexpected output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Run a program with piped output and a deadline; the child is killed if
/// the deadline passes.
pub async fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<Output, ExecError> {
    let child = AsyncCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ExecError::Timeout(program.to_string(), timeout))?
        .map_err(|source| ExecError::Spawn { program: program.to_string(), source })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ExecError::Failed(program.to_string(), stderr));
    }
    Ok(output)
}

#[derive(Debug, Deserialize)]
struct SpeedtestReport {
    /// bits/s
    download: f64,
    upload: f64,
    /// ms
    ping: f64,
}

#[derive(Debug, Clone)]
pub struct TaskExecutor {
    speedtest_bin: String,
    speedtest_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(speedtest_bin: &str) -> Self {
        Self { speedtest_bin: speedtest_bin.to_string(), speedtest_timeout: SPEEDTEST_TIMEOUT }
    }

    pub async fn execute(&self, kind: TaskKind, stats: &WireStats) -> ResultPayload {
        info!("executing {kind}");
        match kind {
            TaskKind::Selftest => selftest(stats),
            TaskKind::Uptime => ResultPayload::i18n("uptime_ok")
                .with("seconds", stats.uptime)
                .with("human", format_uptime(stats.uptime)),
            TaskKind::Traffic => ResultPayload::i18n("traffic_ok")
                .with("rx_bytes", stats.net_rx)
                .with("tx_bytes", stats.net_tx),
            TaskKind::Top => top().await,
            TaskKind::Speedtest => self.speedtest().await,
            TaskKind::Reboot => ResultPayload::i18n("reboot_ok"),
        }
    }

    async fn speedtest(&self) -> ResultPayload {
        match self.run_speedtest().await {
            Ok(report) => ResultPayload::i18n("speedtest_ok")
                .with("download_mbps", round2(report.download / 1_000_000.0))
                .with("upload_mbps", round2(report.upload / 1_000_000.0))
                .with("ping_ms", round2(report.ping)),
            Err(e) => {
                warn!("speedtest failed: {e}");
                ResultPayload::i18n("speedtest_error").with("error", e.to_string())
            }
        }
    }

    async fn run_speedtest(&self) -> Result<SpeedtestReport, ExecError> {
        let output = run_with_timeout(&self.speedtest_bin, &["--json"], self.speedtest_timeout).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn selftest(stats: &WireStats) -> ResultPayload {
    let hostname = hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_default();
    ResultPayload::i18n("selftest_ok")
        .with("hostname", hostname)
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("uptime", format_uptime(stats.uptime))
        .with("cpu", round2(stats.cpu))
        .with("ram", round2(stats.ram))
        .with("disk", round2(stats.disk))
        .with("external_ip", stats.external_ip.clone().unwrap_or_default())
}

async fn top() -> ResultPayload {
    let mut sys = System::new();
    sys.refresh_processes();
    // Wait a moment for accurate CPU readings
    tokio::time::sleep(Duration::from_millis(500)).await;
    sys.refresh_processes();

    let mut procs: Vec<_> = sys.processes().values().collect();
    procs.sort_by(|a, b| b.cpu_usage().partial_cmp(&a.cpu_usage()).unwrap_or(std::cmp::Ordering::Equal));
    let by_cpu: Vec<String> =
        procs.iter().take(TOP_N).map(|p| format!("{} {} {:.1}%", p.pid(), p.name(), p.cpu_usage())).collect();
    procs.sort_by(|a, b| b.memory().cmp(&a.memory()));
    let by_ram: Vec<String> = procs
        .iter()
        .take(TOP_N)
        .map(|p| format!("{} {} {} MB", p.pid(), p.name(), p.memory() / (1024 * 1024)))
        .collect();

    ResultPayload::i18n("top_ok").with("cpu", by_cpu).with("ram", by_ram)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let minutes = secs % 3_600 / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Flush filesystem buffers and reboot the host. Needs root.
pub async fn reboot_host() -> Result<(), ExecError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(ExecError::Failed("reboot".into(), "agent is not running as root".into()));
    }
    info!("rebooting host");
    run_with_timeout("shutdown", &["-r", "now"], Duration::from_secs(10)).await?;
    Ok(())
}
