/**
 * ALERT ENGINE - Boucles de surveillance et transitions d'alertes
 *
 * RÔLE :
 * (a) ressources de l'hôte du kernel, (b) liveness + seuils par nœud,
 * (c) collecteurs de logs (connexions, bans) avec déduplication.
 *
 * FONCTIONNEMENT :
 * - Chaque boucle est une tâche tokio indépendante arrêtée par le canal `shutdown`
 * - Une erreur de passage est loguée, la boucle dort `PENALTY` puis reprend
 * - Les transitions sont publiées sur l'EventBus, jamais envoyées directement
 */

pub mod host;
pub mod logs;
pub mod logtail;
pub mod nodes;
pub mod threshold;

use crate::config::SystemConfig;
use crate::registry::Metric;
use std::time::Duration;

pub const PENALTY: Duration = Duration::from_secs(5);

pub fn threshold_for(cfg: &SystemConfig, metric: Metric) -> f64 {
    match metric {
        Metric::Cpu => cfg.cpu_threshold,
        Metric::Ram => cfg.ram_threshold,
        Metric::Disk => cfg.disk_threshold,
    }
}
