//! Boucle (a) : ressources de l'hôte du kernel (CPU, RAM, disque).

use super::threshold::{step, Transition};
use super::PENALTY;
use crate::bus::{BusEvent, EventBus, ResourceAlert};
use crate::config::SystemConfig;
use crate::registry::{AlertState, Metric};
use crate::state::{unix_now, Shared};
use std::collections::HashMap;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSample {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub top_cpu: String,
    pub top_ram: String,
}

impl HostSample {
    fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cpu => self.cpu,
            Metric::Ram => self.ram,
            Metric::Disk => self.disk,
        }
    }

    fn top_for(&self, metric: Metric) -> String {
        match metric {
            Metric::Cpu => self.top_cpu.clone(),
            Metric::Ram => self.top_ram.clone(),
            Metric::Disk => String::new(),
        }
    }
}

pub trait HostSampler: Send {
    fn sample(&mut self) -> anyhow::Result<HostSample>;
}

/// Échantillonneur réel basé sur sysinfo ; garde `System` entre deux
/// passages pour que l'usage CPU soit calculé sur la période écoulée.
pub struct SysinfoSampler {
    sys: System,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self { sys }
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> anyhow::Result<HostSample> {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.sys.refresh_processes();

        let total = self.sys.total_memory();
        let ram = if total > 0 { self.sys.used_memory() as f64 / total as f64 * 100.0 } else { 0.0 };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.list().first())
            .ok_or_else(|| anyhow::anyhow!("no disk visible"))?;
        let disk = if root.total_space() > 0 {
            (root.total_space() - root.available_space()) as f64 / root.total_space() as f64 * 100.0
        } else {
            0.0
        };

        let mut procs: Vec<_> = self.sys.processes().values().collect();
        procs.sort_by(|a, b| b.cpu_usage().partial_cmp(&a.cpu_usage()).unwrap_or(std::cmp::Ordering::Equal));
        let top_cpu = procs
            .iter()
            .take(3)
            .map(|p| format!("{} ({:.1}%)", p.name(), p.cpu_usage()))
            .collect::<Vec<_>>()
            .join(", ");
        procs.sort_by(|a, b| b.memory().cmp(&a.memory()));
        let top_ram = procs
            .iter()
            .take(3)
            .map(|p| format!("{} ({} MB)", p.name(), p.memory() / (1024 * 1024)))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(HostSample {
            cpu: self.sys.global_cpu_info().cpu_usage() as f64,
            ram,
            disk,
            top_cpu,
            top_ram,
        })
    }
}

/// Propriétaire unique des états d'alerte de la portée "hôte".
pub struct HostMonitor<S: HostSampler> {
    sampler: S,
    states: HashMap<Metric, AlertState>,
    bus: EventBus,
    config: Shared<SystemConfig>,
}

impl<S: HostSampler> HostMonitor<S> {
    pub fn new(sampler: S, bus: EventBus, config: Shared<SystemConfig>) -> Self {
        Self { sampler, states: HashMap::new(), bus, config }
    }

    pub fn check(&mut self, now: i64) -> anyhow::Result<()> {
        let sample = self.sampler.sample()?;
        let cfg = self.config.lock().clone();
        debug!("host sample cpu={:.1} ram={:.1} disk={:.1}", sample.cpu, sample.ram, sample.disk);

        for metric in Metric::ALL {
            let threshold = super::threshold_for(&cfg, metric);
            let value = sample.value(metric);
            let state = self.states.entry(metric).or_default();
            let Some(tr) = step(state, value, threshold, cfg.resource_alert_cooldown, now) else {
                continue;
            };
            let alert = || ResourceAlert {
                node_token: None,
                node_name: None,
                metric,
                value,
                threshold,
                top_processes: sample.top_for(metric),
            };
            let event = match tr {
                Transition::High => BusEvent::ResourceHigh(alert()),
                Transition::HighRepeat => BusEvent::ResourceHighRepeat(alert()),
                Transition::Normal => BusEvent::ResourceNormal { node_token: None, node_name: None, metric, value },
            };
            info!("host {} {:?} ({value:.1} / {threshold})", metric.as_str(), tr);
            self.bus.publish(&event);
        }
        Ok(())
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let pause = match self.check(unix_now()) {
                Ok(()) => Duration::from_secs(self.config.lock().resource_check_interval.max(1)),
                Err(e) => {
                    warn!("host resource check failed: {e:#}");
                    PENALTY
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("host resource loop stopped");
    }
}
