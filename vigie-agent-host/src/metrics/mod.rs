//! System metrics collection for Vigie agents
//!
//! Produces the heartbeat `stats` snapshot:
//! - CPU, RAM and root-disk usage in percent, plus raw totals
//! - Cumulative network counters (loopback excluded)
//! - Top CPU / RAM consumers as short human strings
//! - External address, fetched over HTTP and cached for an hour

use anyhow::Result;
use std::path::Path;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, Process, System};
use tracing::{debug, warn};
use vigie_proto::WireStats;

const TOP_N: usize = 3;
pub const EXTERNAL_IP_TTL: Duration = Duration::from_secs(3600);
const EXTERNAL_IP_TIMEOUT: Duration = Duration::from_secs(3);

/// Keeps `System` and `Networks` alive between cycles so CPU usage is
/// measured over the elapsed interval instead of a fresh 200ms sample.
pub struct MetricsCollector {
    sys: System,
    networks: Networks,
    external_ip: ExternalIpCache,
}

impl MetricsCollector {
    pub fn new(external_ip_url: &str) -> Result<Self> {
        let mut sys = System::new();
        sys.refresh_cpu();
        Ok(Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            external_ip: ExternalIpCache::new(external_ip_url)?,
        })
    }

    /// Collect complete system metrics
    pub async fn collect(&mut self) -> WireStats {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.sys.refresh_processes();
        self.networks.refresh();

        let ram_total = self.sys.total_memory();
        let ram_free = self.sys.available_memory();
        let (disk_total, disk_free) = root_disk();
        let (net_rx, net_tx) = self
            .networks
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .fold((0u64, 0u64), |(rx, tx), (_, data)| (rx + data.total_received(), tx + data.total_transmitted()));

        let mut procs: Vec<&Process> = self.sys.processes().values().collect();
        let process_cpu = top_by_cpu(&mut procs);
        let process_ram = top_by_memory(&mut procs);

        let stats = WireStats {
            cpu: self.sys.global_cpu_info().cpu_usage() as f64,
            ram: percent(ram_total - ram_free.min(ram_total), ram_total),
            disk: percent(disk_total - disk_free.min(disk_total), disk_total),
            ram_total,
            ram_free,
            disk_total,
            disk_free,
            net_rx,
            net_tx,
            uptime: System::uptime(),
            process_cpu,
            process_ram,
            external_ip: self.external_ip.get().await,
        };
        debug!("collected cpu={:.1} ram={:.1} disk={:.1}", stats.cpu, stats.ram, stats.disk);
        stats
    }
}

pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// (total, available) bytes of the filesystem mounted at `/`.
fn root_disk() -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first())
        .map(|d| (d.total_space(), d.available_space()))
        .unwrap_or((0, 0))
}

fn top_by_cpu(procs: &mut [&Process]) -> String {
    procs.sort_by(|a, b| b.cpu_usage().partial_cmp(&a.cpu_usage()).unwrap_or(std::cmp::Ordering::Equal));
    procs
        .iter()
        .take(TOP_N)
        .map(|p| format!("{} ({:.1}%)", p.name(), p.cpu_usage()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn top_by_memory(procs: &mut [&Process]) -> String {
    procs.sort_by(|a, b| b.memory().cmp(&a.memory()));
    procs
        .iter()
        .take(TOP_N)
        .map(|p| format!("{} ({} MB)", p.name(), p.memory() / (1024 * 1024)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// External address of the node as seen from the internet.
pub struct ExternalIpCache {
    client: reqwest::Client,
    url: String,
    cached: Option<(String, Instant)>,
}

impl ExternalIpCache {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(EXTERNAL_IP_TIMEOUT).build()?;
        Ok(Self { client, url: url.to_string(), cached: None })
    }

    fn fresh(&self, now: Instant) -> Option<&str> {
        self.cached
            .as_ref()
            .filter(|(_, at)| now.saturating_duration_since(*at) < EXTERNAL_IP_TTL)
            .map(|(ip, _)| ip.as_str())
    }

    /// Cached value while fresh; on lookup failure the stale value is kept.
    pub async fn get(&mut self) -> Option<String> {
        self.get_at(Instant::now()).await
    }

    async fn get_at(&mut self, now: Instant) -> Option<String> {
        if let Some(ip) = self.fresh(now) {
            return Some(ip.to_string());
        }
        match self.fetch().await {
            Ok(ip) => {
                self.cached = Some((ip.clone(), now));
                Some(ip)
            }
            Err(e) => {
                warn!("external address lookup failed: {e}");
                self.cached.as_ref().map(|(ip, _)| ip.clone())
            }
        }
    }

    async fn fetch(&self) -> Result<String> {
        let body = self.client.get(&self.url).send().await?.error_for_status()?.text().await?;
        let ip = body.trim();
        if ip.is_empty() || ip.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!("unexpected reply: {ip:.40}");
        }
        Ok(ip.to_string())
    }
}
