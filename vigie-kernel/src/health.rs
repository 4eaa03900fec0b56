//! Santé du kernel exposée par `GET /system/health`.

use crate::alerts::threshold::is_dead;
use crate::bus::EventBus;
use crate::config::{DeployMode, SystemConfig};
use crate::registry::NodeRegistry;
use crate::state::unix_now;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub nodes_registered: usize,
    pub nodes_online: usize,
    pub bus_subscribers: usize,
    pub bus_published: u64,
    pub bus_dropped: u64,
    pub memory_usage_mb: f32,
    pub deploy_mode: DeployMode,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    deploy_mode: DeployMode,
}

impl HealthTracker {
    pub fn new(deploy_mode: DeployMode) -> Self {
        Self { start_time: Instant::now(), deploy_mode }
    }

    pub fn get_health(&self, registry: &NodeRegistry, bus: &EventBus, config: &SystemConfig) -> KernelHealth {
        let now = unix_now();
        let nodes = registry.list_all();
        let online = nodes
            .iter()
            .filter(|n| n.last_seen > 0 && !is_dead(n.last_seen, now, config.node_offline_timeout))
            .count();

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_registered: nodes.len(),
            nodes_online: online,
            bus_subscribers: bus.subscriber_count(),
            bus_published: bus.published_count(),
            bus_dropped: bus.dropped_count(),
            memory_usage_mb: get_memory_usage_mb(),
            deploy_mode: self.deploy_mode,
        }
    }
}

/// RSS du processus depuis /proc ; 0 si indisponible.
fn get_memory_usage_mb() -> f32 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0.0;
    };
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb as f32 / 1024.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;
    use std::sync::Arc;
    use vigie_proto::WireStats;

    #[tokio::test]
    async fn test_online_counts_only_fresh_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = Arc::new(CredentialStore::from_secret([1u8; 32]));
        let registry = NodeRegistry::open(&dir.path().join("nodes.enc"), store, bus.clone()).await.unwrap();
        let fresh = registry.create("fresh").await.unwrap();
        let stale = registry.create("stale").await.unwrap();
        registry.create("never").await.unwrap();
        registry.record_heartbeat(&fresh, None, WireStats::default(), unix_now()).unwrap();
        registry.record_heartbeat(&stale, None, WireStats::default(), unix_now() - 600).unwrap();
        let _sub = bus.subscribe();

        let health = HealthTracker::new(DeployMode::Docker).get_health(&registry, &bus, &SystemConfig::default());
        assert_eq!(health.nodes_registered, 3);
        assert_eq!(health.nodes_online, 1);
        assert_eq!(health.bus_subscribers, 1);
        assert_eq!(health.deploy_mode, DeployMode::Docker);
    }
}
