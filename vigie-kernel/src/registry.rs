/**
 * NODE REGISTRY - Référentiel des nœuds (agents VPS) enregistrés
 *
 * RÔLE : Enregistrement, persistance chiffrée, métriques et file de tâches
 * de chaque nœud, identifié par un token de 32 caractères hexadécimaux.
 *
 * ARCHITECTURE :
 * - Map token -> `Shared<NodeRecord>` : un mutex par nœud, les heartbeats et
 *   le moteur d'alertes ne se bloquent jamais entre nœuds différents
 * - Les lecteurs ne reçoivent que des copies (`NodeRecord` cloné)
 * - Persisté : nom, dates, dernière adresse. Transitoire : historique,
 *   tâches, états d'alerte, `restarting`
 * - Écriture disque ratée => un nouvel essai, puis annulation de la mutation
 *   en mémoire et alerte sur le canal `self`
 */

use crate::alerts::threshold::{liveness_step, Liveness};
use crate::bus::{BusEvent, EventBus};
use crate::credentials::{CredentialError, CredentialStore};
use crate::state::{new_shared, unix_now, Shared};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};
use vigie_proto::{token_prefix, TaskKind, WireStats, HISTORY_CAP};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown node")]
    UnknownNode,
    #[error("display name must not be empty")]
    EmptyName,
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("registry file unreadable: {0}")]
    Credential(#[from] CredentialError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Ram,
    Disk,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Cpu, Metric::Ram, Metric::Disk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Ram => "ram",
            Metric::Disk => "disk",
        }
    }

    pub fn value_of(&self, stats: &WireStats) -> f64 {
        match self {
            Metric::Cpu => stats.cpu,
            Metric::Ram => stats.ram,
            Metric::Disk => stats.disk,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AlertState {
    pub active: bool,
    pub last_fired: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub at: i64,
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub net_rx: u64,
    pub net_tx: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub command_kind: TaskKind,
    pub requester_id: i64,
    pub issued_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub token: String,
    pub display_name: String,
    pub created_at: i64,
    /// 0 = jamais vu.
    pub last_seen: i64,
    pub observed_address: Option<String>,
    pub current_stats: Option<WireStats>,
    pub history: VecDeque<MetricPoint>,
    pub pending_tasks: VecDeque<TaskRecord>,
    pub alert_state: HashMap<Metric, AlertState>,
    pub liveness_alert_sent: bool,
    pub restarting: bool,
}

impl NodeRecord {
    fn new(token: String, display_name: String, created_at: i64) -> Self {
        Self {
            token,
            display_name,
            created_at,
            last_seen: 0,
            observed_address: None,
            current_stats: None,
            history: VecDeque::with_capacity(HISTORY_CAP),
            pending_tasks: VecDeque::new(),
            alert_state: HashMap::new(),
            liveness_alert_sent: false,
            restarting: false,
        }
    }

    fn persisted(&self) -> PersistedNode {
        PersistedNode {
            display_name: self.display_name.clone(),
            created_at: self.created_at,
            last_seen: self.last_seen,
            observed_address: self.observed_address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessChange {
    pub kind: Liveness,
    pub node_name: String,
    pub last_seen: i64,
}

/// Forme disque d'un nœud (sans historique ni tâches).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedNode {
    display_name: String,
    created_at: i64,
    last_seen: i64,
    observed_address: Option<String>,
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Shared<NodeRecord>>>,
    store: Arc<CredentialStore>,
    path: PathBuf,
    bus: EventBus,
    dirty: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
}

pub type SharedRegistry = Arc<NodeRegistry>;

impl NodeRegistry {
    /// Charge le registre chiffré s'il existe. Un fichier illisible est fatal.
    pub async fn open(path: &Path, store: Arc<CredentialStore>, bus: EventBus) -> Result<Self, RegistryError> {
        let mut nodes = HashMap::new();
        match fs::read(path).await {
            Ok(bytes) => {
                let persisted: BTreeMap<String, PersistedNode> = store.decrypt_json(&bytes)?;
                for (token, p) in persisted {
                    let mut rec = NodeRecord::new(token.clone(), p.display_name, p.created_at);
                    rec.last_seen = p.last_seen;
                    rec.observed_address = p.observed_address;
                    nodes.insert(token, new_shared(rec));
                }
                info!("loaded {} nodes from {}", nodes.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no registry file, starting fresh");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            nodes: RwLock::new(nodes),
            store,
            path: path.to_path_buf(),
            bus,
            dirty: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn record(&self, token: &str) -> Result<Shared<NodeRecord>, RegistryError> {
        self.nodes.read().get(token).cloned().ok_or(RegistryError::UnknownNode)
    }

    fn with_node<R>(&self, token: &str, f: impl FnOnce(&mut NodeRecord) -> R) -> Result<R, RegistryError> {
        let rec = self.record(token)?;
        let mut guard = rec.lock();
        Ok(f(&mut guard))
    }

    /// Crée un nœud ; le token n'est rendu qu'une fois le registre persisté.
    pub async fn create(&self, display_name: &str) -> Result<String, RegistryError> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let token = generate_token();
        let rec = NodeRecord::new(token.clone(), name.to_string(), unix_now());
        self.nodes.write().insert(token.clone(), new_shared(rec));

        if let Err(e) = self.persist_or_alert("create").await {
            self.nodes.write().remove(&token);
            return Err(e);
        }
        info!("node '{}' created ({}…)", name, token_prefix(&token));
        Ok(token)
    }

    /// Supprime un nœud ; ses tâches en attente disparaissent avec lui.
    pub async fn delete(&self, token: &str) -> Result<(), RegistryError> {
        let removed = self.nodes.write().remove(token).ok_or(RegistryError::UnknownNode)?;
        if let Err(e) = self.persist_or_alert("delete").await {
            self.nodes.write().insert(token.to_string(), removed);
            return Err(e);
        }
        let rec = removed.lock();
        if !rec.pending_tasks.is_empty() {
            info!("dropped {} pending tasks of '{}'", rec.pending_tasks.len(), rec.display_name);
        }
        info!("node '{}' deleted", rec.display_name);
        Ok(())
    }

    pub async fn rename(&self, token: &str, display_name: &str) -> Result<(), RegistryError> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let previous = self.with_node(token, |n| std::mem::replace(&mut n.display_name, name.to_string()))?;
        if let Err(e) = self.persist_or_alert("rename").await {
            let _ = self.with_node(token, |n| n.display_name = previous);
            return Err(e);
        }
        Ok(())
    }

    pub fn lookup(&self, token: &str) -> Option<NodeRecord> {
        self.record(token).ok().map(|r| r.lock().clone())
    }

    pub fn contains(&self, token: &str) -> bool {
        self.nodes.read().contains_key(token)
    }

    /// Tous les nœuds, triés par nom.
    pub fn list_all(&self) -> Vec<NodeRecord> {
        let records: Vec<Shared<NodeRecord>> = self.nodes.read().values().cloned().collect();
        let mut out: Vec<NodeRecord> = records.iter().map(|r| r.lock().clone()).collect();
        out.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.token.cmp(&b.token)));
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Applique un heartbeat authentifié. Retourne le nom du nœud.
    pub fn record_heartbeat(
        &self,
        token: &str,
        observed_address: Option<String>,
        snapshot: WireStats,
        now: i64,
    ) -> Result<String, RegistryError> {
        let name = self.with_node(token, |n| {
            n.last_seen = n.last_seen.max(now);
            if observed_address.is_some() {
                n.observed_address = observed_address;
            }
            n.history.push_back(MetricPoint {
                at: n.last_seen,
                cpu: snapshot.cpu,
                ram: snapshot.ram,
                disk: snapshot.disk,
                net_rx: snapshot.net_rx,
                net_tx: snapshot.net_tx,
            });
            while n.history.len() > HISTORY_CAP {
                n.history.pop_front();
            }
            n.current_stats = Some(snapshot);
            n.restarting = false;
            n.display_name.clone()
        })?;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(name)
    }

    pub fn enqueue_task(&self, token: &str, task: TaskRecord) -> Result<(), RegistryError> {
        self.with_node(token, |n| {
            if task.command_kind == TaskKind::Reboot {
                n.restarting = true;
            }
            n.pending_tasks.push_back(task);
        })
    }

    /// Vide atomiquement la file : chaque tâche n'est rendue qu'une fois.
    pub fn drain_tasks(&self, token: &str) -> Result<Vec<TaskRecord>, RegistryError> {
        self.with_node(token, |n| n.pending_tasks.drain(..).collect())
    }

    pub fn has_pending(&self, token: &str, kind: TaskKind) -> bool {
        self.with_node(token, |n| n.pending_tasks.iter().any(|t| t.command_kind == kind))
            .unwrap_or(false)
    }

    pub fn patch_alert_state(&self, token: &str, metric: Metric, state: AlertState) -> Result<(), RegistryError> {
        self.with_node(token, |n| {
            n.alert_state.insert(metric, state);
        })
    }

    /// Le nœud va redémarrer : pas d'alerte `node_down` jusqu'au prochain
    /// heartbeat qui ne porte pas l'accusé de reboot.
    pub fn mark_restarting(&self, token: &str) -> Result<(), RegistryError> {
        self.with_node(token, |n| n.restarting = true)
    }

    /// Décide et applique la transition de liveness sous le verrou du nœud :
    /// un heartbeat concurrent ne peut pas s'intercaler entre lecture et écriture.
    pub fn apply_liveness(
        &self,
        token: &str,
        now: i64,
        offline_timeout: i64,
    ) -> Result<Option<LivenessChange>, RegistryError> {
        self.with_node(token, |n| {
            let kind = liveness_step(n.last_seen, now, offline_timeout, n.restarting, n.liveness_alert_sent)?;
            n.liveness_alert_sent = kind == Liveness::Down;
            Some(LivenessChange { kind, node_name: n.display_name.clone(), last_seen: n.last_seen })
        })
    }

    /// Écrit le registre si des heartbeats ont modifié `last_seen`.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        if self.dirty.swap(false, Ordering::Relaxed) {
            if let Err(e) = self.persist_or_alert("flush").await {
                self.dirty.store(true, Ordering::Relaxed);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn persist_or_alert(&self, op: &str) -> Result<(), RegistryError> {
        let first = match self.persist().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!("registry write failed during {op} ({first}), retrying once");
        match self.persist().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("registry write failed twice during {op}: {e}");
                self.bus.publish(&BusEvent::SelfAlert {
                    message: format!("registry persistence failed during {op}: {e}"),
                });
                Err(RegistryError::Persistence(e.to_string()))
            }
        }
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let snapshot: BTreeMap<String, PersistedNode> = {
            let nodes = self.nodes.read();
            nodes.iter().map(|(t, r)| (t.clone(), r.lock().persisted())).collect()
        };
        let bytes = self.store.encrypt_json(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn generate_token() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigie_proto::is_token_shaped;

    fn stats(cpu: f64) -> WireStats {
        WireStats { cpu, ram: 34.0, disk: 56.0, ..Default::default() }
    }

    async fn registry_in(dir: &Path) -> NodeRegistry {
        let store = Arc::new(CredentialStore::from_secret([3u8; 32]));
        NodeRegistry::open(&dir.join("nodes.enc"), store, EventBus::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_lookup_list() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let b = reg.create("beta").await.unwrap();
        let a = reg.create("alpha").await.unwrap();
        assert!(is_token_shaped(&a));
        assert_ne!(a, b);

        let names: Vec<_> = reg.list_all().into_iter().map(|n| n.display_name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        let rec = reg.lookup(&a).unwrap();
        assert_eq!(rec.last_seen, 0);
        assert!(reg.lookup("ffffffffffffffffffffffffffffffff").is_none());
        assert!(matches!(reg.create("   ").await, Err(RegistryError::EmptyName)));
    }

    #[tokio::test]
    async fn test_persisted_encrypted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let reg = registry_in(dir.path()).await;
            let t = reg.create("alpha").await.unwrap();
            reg.record_heartbeat(&t, Some("198.51.100.7".into()), stats(5.0), 1_700_000_000).unwrap();
            reg.enqueue_task(&t, TaskRecord { command_kind: TaskKind::Uptime, requester_id: 1, issued_at: 0 }).unwrap();
            reg.flush().await.unwrap();
            t
        };

        let raw = std::fs::read(dir.path().join("nodes.enc")).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("alpha"));
        assert!(!String::from_utf8_lossy(&raw).contains(&token));

        let reg = registry_in(dir.path()).await;
        let rec = reg.lookup(&token).unwrap();
        assert_eq!(rec.display_name, "alpha");
        assert_eq!(rec.last_seen, 1_700_000_000);
        assert_eq!(rec.observed_address.as_deref(), Some("198.51.100.7"));
        assert!(rec.history.is_empty());
        assert!(rec.pending_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_secret_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        registry_in(dir.path()).await.create("alpha").await.unwrap();
        let other = Arc::new(CredentialStore::from_secret([4u8; 32]));
        let res = NodeRegistry::open(&dir.path().join("nodes.enc"), other, EventBus::new()).await;
        assert!(matches!(res, Err(RegistryError::Credential(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_and_history_cap() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let t = reg.create("alpha").await.unwrap();
        reg.enqueue_task(&t, TaskRecord { command_kind: TaskKind::Reboot, requester_id: 1, issued_at: 0 }).unwrap();
        assert!(reg.lookup(&t).unwrap().restarting);

        let mut previous = 0;
        for i in 0..150i64 {
            // horloge qui recule parfois : last_seen ne doit jamais reculer
            let now = 1_000 + if i % 7 == 0 { i - 5 } else { i };
            reg.record_heartbeat(&t, None, stats(i as f64), now).unwrap();
            let rec = reg.lookup(&t).unwrap();
            assert!(rec.last_seen >= previous);
            assert!(rec.history.len() <= HISTORY_CAP);
            previous = rec.last_seen;
        }
        let rec = reg.lookup(&t).unwrap();
        assert_eq!(rec.history.len(), HISTORY_CAP);
        assert_eq!(rec.history.back().unwrap().cpu, 149.0);
        assert_eq!(rec.history.front().unwrap().cpu, 90.0);
        assert_eq!(rec.current_stats.unwrap().cpu, 149.0);
        assert!(!rec.restarting);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let res = reg.record_heartbeat("00000000000000000000000000000000", None, stats(1.0), 1);
        assert!(matches!(res, Err(RegistryError::UnknownNode)));
        assert!(matches!(reg.drain_tasks("nope"), Err(RegistryError::UnknownNode)));
    }

    #[tokio::test]
    async fn test_drain_is_fifo_and_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let t = reg.create("alpha").await.unwrap();
        for (i, kind) in [TaskKind::Uptime, TaskKind::Top, TaskKind::Speedtest].into_iter().enumerate() {
            reg.enqueue_task(&t, TaskRecord { command_kind: kind, requester_id: i as i64, issued_at: 0 }).unwrap();
        }
        let first = reg.drain_tasks(&t).unwrap();
        let kinds: Vec<_> = first.iter().map(|t| t.command_kind).collect();
        assert_eq!(kinds, vec![TaskKind::Uptime, TaskKind::Top, TaskKind::Speedtest]);
        assert!(reg.drain_tasks(&t).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cancels_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let t = reg.create("alpha").await.unwrap();
        reg.enqueue_task(&t, TaskRecord { command_kind: TaskKind::Top, requester_id: 1, issued_at: 0 }).unwrap();
        reg.delete(&t).await.unwrap();
        assert!(reg.lookup(&t).is_none());
        assert!(matches!(reg.drain_tasks(&t), Err(RegistryError::UnknownNode)));
        assert!(matches!(reg.delete(&t).await, Err(RegistryError::UnknownNode)));
    }

    #[tokio::test]
    async fn test_persistence_failure_reverts_and_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");

        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let store = Arc::new(CredentialStore::from_secret([3u8; 32]));
        let reg = NodeRegistry::open(&blocker.join("nodes.enc"), store, bus).await.unwrap();
        // le dossier parent devient un fichier : toute écriture échoue
        std::fs::write(&blocker, b"not a directory").unwrap();

        assert!(matches!(reg.create("alpha").await, Err(RegistryError::Persistence(_))));
        assert_eq!(reg.len(), 0);
        match sub.recv_event().await.unwrap() {
            BusEvent::SelfAlert { message } => assert!(message.contains("create")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_alert_state_patch() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let t = reg.create("alpha").await.unwrap();
        reg.patch_alert_state(&t, Metric::Ram, AlertState { active: true, last_fired: 9 }).unwrap();
        let rec = reg.lookup(&t).unwrap();
        assert_eq!(rec.alert_state[&Metric::Ram], AlertState { active: true, last_fired: 9 });
    }

    #[tokio::test]
    async fn test_liveness_decided_on_current_record() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path()).await;
        let t = reg.create("alpha").await.unwrap();
        reg.record_heartbeat(&t, None, stats(1.0), 1_000).unwrap();
        // copie prise avant qu'un heartbeat n'arrive
        let stale = reg.list_all().remove(0);
        reg.record_heartbeat(&t, None, stats(1.0), 1_030).unwrap();

        assert_eq!(stale.last_seen, 1_000);
        assert_eq!(reg.apply_liveness(&t, 1_030, 20).unwrap(), None);
        assert!(!reg.lookup(&t).unwrap().liveness_alert_sent);

        let down = reg.apply_liveness(&t, 1_050, 20).unwrap().unwrap();
        assert_eq!(down, LivenessChange { kind: Liveness::Down, node_name: "alpha".into(), last_seen: 1_030 });
        assert!(reg.lookup(&t).unwrap().liveness_alert_sent);
        assert_eq!(reg.apply_liveness(&t, 1_060, 20).unwrap(), None);

        reg.record_heartbeat(&t, None, stats(1.0), 1_070).unwrap();
        assert_eq!(reg.apply_liveness(&t, 1_071, 20).unwrap().map(|c| c.kind), Some(Liveness::Up));
        assert!(!reg.lookup(&t).unwrap().liveness_alert_sent);
        assert!(matches!(reg.apply_liveness("nope", 1_071, 20), Err(RegistryError::UnknownNode)));
    }

    #[tokio::test]
    async fn test_flush_failure_retries_then_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");

        let bus = EventBus::new();
        let store = Arc::new(CredentialStore::from_secret([3u8; 32]));
        let reg = NodeRegistry::open(&data.join("nodes.enc"), store, bus.clone()).await.unwrap();
        let t = reg.create("alpha").await.unwrap();
        reg.record_heartbeat(&t, None, stats(1.0), 1_000).unwrap();

        let mut sub = bus.subscribe();
        std::fs::remove_dir_all(&data).unwrap();
        std::fs::write(&data, b"not a directory").unwrap();

        assert!(matches!(reg.flush().await, Err(RegistryError::Persistence(_))));
        match sub.recv_event().await.unwrap() {
            BusEvent::SelfAlert { message } => assert!(message.contains("flush")),
            other => panic!("unexpected event {other:?}"),
        }

        // toujours sale : le prochain flush réessaie une fois le disque réparé
        std::fs::remove_file(&data).unwrap();
        reg.flush().await.unwrap();
        let reloaded = registry_in(&data).await;
        assert_eq!(reloaded.lookup(&t).unwrap().last_seen, 1_000);
    }
}
