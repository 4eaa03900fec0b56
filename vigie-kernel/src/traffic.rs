/**
 * TRAFFIC MONITOR - Suivi du débit réseau d'un nœud pour un utilisateur
 *
 * RÔLE :
 * Tant qu'un nœud est "surveillé par U", une tâche `traffic` est remise en
 * file toutes les TRAFFIC_INTERVAL secondes ; chaque résultat devient un
 * événement `traffic/update` adressé à U seul.
 *
 * DÉBIT : (octets_maintenant - octets_avant) * 8 / intervalle. Un compteur
 * qui recule (reboot, wrap) est traité comme une remise à zéro : débit 0.
 */

use crate::bus::BusEvent;
use crate::config::SystemConfig;
use crate::registry::{SharedRegistry, TaskRecord};
use crate::state::{unix_now, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};
use vigie_proto::{token_prefix, TaskKind, WireResult};

#[derive(Debug, Clone, Copy)]
struct Sample {
    rx: u64,
    tx: u64,
    at: Instant,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: i64,
    last: Option<Sample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub node_token: String,
    pub user_id: i64,
}

/// bits/s entre deux lectures d'un compteur cumulatif.
pub fn compute_bps(prev: u64, now: u64, interval_secs: f64) -> f64 {
    if now < prev || interval_secs <= 0.0 {
        return 0.0;
    }
    (now - prev) as f64 * 8.0 / interval_secs
}

#[derive(Default)]
pub struct TrafficMonitor {
    sessions: Mutex<HashMap<String, Session>>,
}

impl TrafficMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Démarre (ou réattribue) la surveillance d'un nœud.
    pub fn start(&self, node_token: &str, user_id: i64) {
        self.sessions
            .lock()
            .insert(node_token.to_string(), Session { user_id, last: None });
        info!("traffic monitoring of {}… started for user {user_id}", token_prefix(node_token));
    }

    pub fn stop(&self, node_token: &str) -> bool {
        self.sessions.lock().remove(node_token).is_some()
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        self.sessions
            .lock()
            .iter()
            .map(|(t, s)| SessionView { node_token: t.clone(), user_id: s.user_id })
            .collect()
    }

    /// Transforme un résultat `traffic` en mise à jour de débit.
    /// `fallback_interval` sert pour le premier écart ou un écart nul.
    pub fn observe(
        &self,
        node_token: &str,
        node_name: &str,
        result: &WireResult,
        at: Instant,
        fallback_interval: f64,
    ) -> Option<BusEvent> {
        if result.command != TaskKind::Traffic {
            return None;
        }
        let rx = result.result.param("rx_bytes")?.as_u64()?;
        let tx = result.result.param("tx_bytes")?.as_u64()?;

        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(node_token)?;
        let now = Sample { rx, tx, at };
        let (rx_bps, tx_bps) = match session.last {
            Some(prev) => {
                let elapsed = now.at.saturating_duration_since(prev.at).as_secs_f64();
                let interval = if elapsed > 0.0 { elapsed } else { fallback_interval };
                (compute_bps(prev.rx, rx, interval), compute_bps(prev.tx, tx, interval))
            }
            None => (0.0, 0.0),
        };
        session.last = Some(now);

        Some(BusEvent::TrafficUpdate {
            node_token: node_token.to_string(),
            node_name: node_name.to_string(),
            user_id: session.user_id,
            rx_bps,
            tx_bps,
            rx_total: rx,
            tx_total: tx,
        })
    }

    /// Remet en file une tâche `traffic` pour chaque session active.
    /// Les sessions de nœuds supprimés sont abandonnées.
    pub fn enqueue_due(&self, registry: &SharedRegistry) -> usize {
        let sessions: Vec<(String, i64)> =
            self.sessions.lock().iter().map(|(t, s)| (t.clone(), s.user_id)).collect();
        let mut queued = 0;
        for (token, user_id) in sessions {
            if !registry.contains(&token) {
                self.stop(&token);
                continue;
            }
            // nœud hors ligne : on n'empile pas, une seule tâche en attente suffit
            if registry.has_pending(&token, TaskKind::Traffic) {
                continue;
            }
            let task = TaskRecord { command_kind: TaskKind::Traffic, requester_id: user_id, issued_at: unix_now() };
            if registry.enqueue_task(&token, task).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    pub async fn run(
        self: Arc<Self>,
        registry: SharedRegistry,
        config: Shared<SystemConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let period = config.lock().traffic_interval.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(period)) => {}
                _ = shutdown.changed() => break,
            }
            let queued = self.enqueue_due(&registry);
            if queued > 0 {
                debug!("queued {queued} traffic tasks");
            }
        }
        debug!("traffic scheduler stopped");
    }
}
