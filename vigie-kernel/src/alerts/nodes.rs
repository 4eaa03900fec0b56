//! Boucle (b) : liveness des nœuds et seuils par nœud.

use super::threshold::{is_dead, step, Liveness, Transition};
use super::{threshold_for, PENALTY};
use crate::bus::{BusEvent, EventBus, ResourceAlert};
use crate::config::SystemConfig;
use crate::registry::{Metric, NodeRecord, RegistryError, SharedRegistry};
use crate::state::{unix_now, Shared};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigie_proto::token_prefix;

pub const NODE_CHECK_PERIOD: Duration = Duration::from_secs(20);

pub struct NodeMonitor {
    registry: SharedRegistry,
    bus: EventBus,
    config: Shared<SystemConfig>,
}

impl NodeMonitor {
    pub fn new(registry: SharedRegistry, bus: EventBus, config: Shared<SystemConfig>) -> Self {
        Self { registry, bus, config }
    }

    /// Un passage complet sur tous les nœuds. Retourne le nombre d'événements publiés.
    /// Un nœud supprimé pendant le passage est simplement ignoré.
    pub fn check(&self, now: i64) -> anyhow::Result<usize> {
        self.check_nodes(self.registry.list_all(), now)
    }

    fn check_nodes(&self, nodes: Vec<NodeRecord>, now: i64) -> anyhow::Result<usize> {
        let cfg = self.config.lock().clone();
        let mut published = 0;
        for node in nodes {
            match self
                .check_liveness(&node, &cfg, now)
                .and_then(|n| Ok(n + self.check_resources(&node, &cfg, now)?))
            {
                Ok(n) => published += n,
                Err(RegistryError::UnknownNode) => debug!("node {} deleted during check", token_prefix(&node.token)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(published)
    }

    fn check_liveness(&self, node: &NodeRecord, cfg: &SystemConfig, now: i64) -> Result<usize, RegistryError> {
        // décision prise sous le verrou du nœud, pas sur la copie `node`
        let Some(change) = self.registry.apply_liveness(&node.token, now, cfg.node_offline_timeout)? else {
            return Ok(0);
        };
        let event = match change.kind {
            Liveness::Down => {
                info!("node {} ({}) down since {}", change.node_name, token_prefix(&node.token), change.last_seen);
                BusEvent::NodeDown {
                    node_token: node.token.clone(),
                    node_name: change.node_name,
                    last_seen: change.last_seen,
                }
            }
            Liveness::Up => {
                info!("node {} ({}) back up", change.node_name, token_prefix(&node.token));
                BusEvent::NodeUp { node_token: node.token.clone(), node_name: change.node_name }
            }
        };
        self.bus.publish(&event);
        Ok(1)
    }

    fn check_resources(&self, node: &NodeRecord, cfg: &SystemConfig, now: i64) -> Result<usize, RegistryError> {
        // un nœud muet garde ses derniers chiffres : ne pas réévaluer des valeurs figées
        if is_dead(node.last_seen, now, cfg.node_offline_timeout) {
            return Ok(0);
        }
        let Some(stats) = node.current_stats.as_ref() else {
            return Ok(0);
        };

        let mut published = 0;
        for metric in Metric::ALL {
            let threshold = threshold_for(cfg, metric);
            let value = metric.value_of(stats);
            let mut state = node.alert_state.get(&metric).copied().unwrap_or_default();
            let Some(tr) = step(&mut state, value, threshold, cfg.resource_alert_cooldown, now) else {
                continue;
            };
            self.registry.patch_alert_state(&node.token, metric, state)?;

            let top_processes = match metric {
                Metric::Cpu => stats.process_cpu.clone(),
                Metric::Ram => stats.process_ram.clone(),
                Metric::Disk => String::new(),
            };
            let alert = || ResourceAlert {
                node_token: Some(node.token.clone()),
                node_name: Some(node.display_name.clone()),
                metric,
                value,
                threshold,
                top_processes: top_processes.clone(),
            };
            let event = match tr {
                Transition::High => BusEvent::ResourceHigh(alert()),
                Transition::HighRepeat => BusEvent::ResourceHighRepeat(alert()),
                Transition::Normal => BusEvent::ResourceNormal {
                    node_token: Some(node.token.clone()),
                    node_name: Some(node.display_name.clone()),
                    metric,
                    value,
                },
            };
            debug!("node {} {} {:?}", node.display_name, metric.as_str(), tr);
            self.bus.publish(&event);
            published += 1;
        }
        Ok(published)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let pause = match self.check(unix_now()) {
                Ok(_) => NODE_CHECK_PERIOD,
                Err(e) => {
                    warn!("node check failed: {e:#}");
                    PENALTY
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("node loop stopped");
    }
}
