/**
 * ALERT ROUTER - Du bus vers les messages chat
 *
 * RÔLE :
 * Abonné du bus qui décide, pour chaque événement, quels destinataires
 * chat le reçoivent, puis délègue l'envoi à un `Notifier`.
 *
 * ROUTAGE :
 * - Canal d'alerte : chaque abonné (+ l'opérateur) selon ses préférences ;
 *   pour un événement de nœud, `node/<token>/<canal>` l'emporte sur `<canal>`
 * - `command_result` : au demandeur seul (sauf `traffic`, rendu via `traffic/update`)
 * - `traffic/update` : à l'utilisateur qui suit le nœud, message édité en place
 * - `self/alert` : à l'opérateur
 * - `node_stats` : jamais (SSE uniquement)
 *
 * Un message non délivré est logué puis abandonné : ni file, ni nouvel essai.
 */

use crate::bus::{BusEvent, Channel, EventBus};
use crate::credentials::{CredentialError, CredentialStore};
use crate::state::format_epoch;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigie_proto::{is_token_shaped, TaskKind};

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BOT_API: &str = "https://api.telegram.org";

// ---------- abonnements ----------

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("invalid subscription key: {0}")]
    InvalidKey(String),
    #[error("subscription file unreadable: {0}")]
    Credential(#[from] CredentialError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Préférences d'un abonné : `<canal>` ou `node/<token>/<canal>` -> activé.
pub type Preferences = BTreeMap<String, bool>;

/// Clé acceptée : un canal connu, ou un override par nœud.
pub fn is_valid_key(key: &str) -> bool {
    if Channel::parse(key).is_some() {
        return true;
    }
    let mut parts = key.splitn(3, '/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some("node"), Some(token), Some(channel)) if is_token_shaped(token) && Channel::parse(channel).is_some()
    )
}

pub struct AlertSubscriptions {
    subscribers: RwLock<BTreeMap<i64, Preferences>>,
    store: Arc<CredentialStore>,
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl AlertSubscriptions {
    pub async fn open(path: &Path, store: Arc<CredentialStore>) -> Result<Self, SubscriptionError> {
        let subscribers = match fs::read(path).await {
            Ok(bytes) => store.decrypt_json(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            subscribers: RwLock::new(subscribers),
            store,
            path: path.to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, subscriber: i64) -> Option<Preferences> {
        self.subscribers.read().get(&subscriber).cloned()
    }

    pub fn subscriber_ids(&self) -> Vec<i64> {
        self.subscribers.read().keys().copied().collect()
    }

    /// Remplace toutes les préférences d'un abonné, puis persiste.
    pub async fn replace(&self, subscriber: i64, prefs: Preferences) -> Result<(), SubscriptionError> {
        if let Some(bad) = prefs.keys().find(|k| !is_valid_key(k)) {
            return Err(SubscriptionError::InvalidKey(bad.clone()));
        }
        self.subscribers.write().insert(subscriber, prefs);
        self.persist().await
    }

    pub async fn set(&self, subscriber: i64, key: &str, enabled: bool) -> Result<(), SubscriptionError> {
        if !is_valid_key(key) {
            return Err(SubscriptionError::InvalidKey(key.to_string()));
        }
        self.subscribers.write().entry(subscriber).or_default().insert(key.to_string(), enabled);
        self.persist().await
    }

    /// Override par nœud d'abord, puis drapeau global ; un canal absent est activé.
    pub fn wants(&self, subscriber: i64, channel: Channel, node_token: Option<&str>) -> bool {
        let subscribers = self.subscribers.read();
        let Some(prefs) = subscribers.get(&subscriber) else {
            return true;
        };
        if let Some(token) = node_token {
            let key = format!("node/{token}/{}", channel.as_str());
            if let Some(enabled) = prefs.get(&key) {
                return *enabled;
            }
        }
        prefs.get(channel.as_str()).copied().unwrap_or(true)
    }

    async fn persist(&self) -> Result<(), SubscriptionError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.subscribers.read().clone();
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

/// Destinataires chat d'un événement.
pub fn recipients(event: &BusEvent, subs: &AlertSubscriptions, admin_id: Option<i64>) -> Vec<i64> {
    match event {
        BusEvent::CommandResult { command_kind: TaskKind::Traffic, .. } => Vec::new(),
        BusEvent::CommandResult { requester_id, .. } => vec![*requester_id],
        BusEvent::TrafficUpdate { user_id, .. } => vec![*user_id],
        BusEvent::SelfAlert { .. } => admin_id.into_iter().collect(),
        BusEvent::NodeStats { .. } => Vec::new(),
        _ => {
            let Some(channel) = event.channel() else {
                return Vec::new();
            };
            let mut ids = subs.subscriber_ids();
            if let Some(admin) = admin_id {
                if !ids.contains(&admin) {
                    ids.push(admin);
                }
            }
            ids.into_iter().filter(|id| subs.wants(*id, channel, event.node_token())).collect()
        }
    }
}

// ---------- rendu ----------

fn scope_label(name: Option<&str>) -> &str {
    name.unwrap_or("controller")
}

/// Texte chat d'un événement.
pub fn render(event: &BusEvent) -> String {
    match event {
        BusEvent::CommandResult { node_name, command_kind, payload, .. } => {
            let mut text = format!("[{node_name}] {command_kind}: {}", payload.key());
            let vigie_proto::ResultPayload::I18n { params, .. } = payload;
            for (k, v) in params {
                match v {
                    serde_json::Value::String(s) => text.push_str(&format!("\n  {k}: {s}")),
                    other => text.push_str(&format!("\n  {k}: {other}")),
                }
            }
            text
        }
        BusEvent::Login { node_name, user, ip, method, timestamp, node_time_str, tz_label, .. } => {
            let when = match (node_time_str, tz_label) {
                (Some(t), Some(tz)) => format!("{t} {tz}"),
                _ => format_epoch(*timestamp),
            };
            let how = method.map(|m| format!(" ({m:?})").to_lowercase()).unwrap_or_default();
            format!("[{}] SSH login: {user} from {ip}{how} at {when}", scope_label(node_name.as_deref()))
        }
        BusEvent::Ban { node_name, jail, ip, .. } => {
            format!("[{}] fail2ban [{jail}] banned {ip}", scope_label(node_name.as_deref()))
        }
        BusEvent::ResourceHigh(a) | BusEvent::ResourceHighRepeat(a) => {
            let repeat = if matches!(event, BusEvent::ResourceHighRepeat(_)) { " (still)" } else { "" };
            let mut text = format!(
                "[{}] {} high{repeat}: {:.1}% >= {:.1}%",
                scope_label(a.node_name.as_deref()),
                a.metric.as_str(),
                a.value,
                a.threshold
            );
            if !a.top_processes.is_empty() {
                text.push_str(&format!("\n  top: {}", a.top_processes));
            }
            text
        }
        BusEvent::ResourceNormal { node_name, metric, value, .. } => {
            format!("[{}] {} back to normal: {value:.1}%", scope_label(node_name.as_deref()), metric.as_str())
        }
        BusEvent::NodeDown { node_name, last_seen, .. } => {
            format!("[{node_name}] node down, last seen {}", format_epoch(*last_seen))
        }
        BusEvent::NodeUp { node_name, .. } => format!("[{node_name}] node back up"),
        BusEvent::NodeStats { node_name, stats, .. } => {
            format!("[{node_name}] cpu {:.1}% ram {:.1}% disk {:.1}%", stats.cpu, stats.ram, stats.disk)
        }
        BusEvent::TrafficUpdate { node_name, rx_bps, tx_bps, rx_total, tx_total, .. } => format!(
            "[{node_name}] traffic\n  down {}  up {}\n  total rx {} MB  tx {} MB",
            human_bps(*rx_bps),
            human_bps(*tx_bps),
            rx_total / (1024 * 1024),
            tx_total / (1024 * 1024)
        ),
        BusEvent::SelfAlert { message } => format!("[vigie] {message}"),
    }
}

fn human_bps(bps: f64) -> String {
    if bps >= 1_000_000.0 {
        format!("{:.2} Mbit/s", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.1} kbit/s", bps / 1_000.0)
    } else {
        format!("{bps:.0} bit/s")
    }
}

// ---------- notifiers ----------

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API rejected the message: {0}")]
    Rejected(String),
}

/// Livraison des messages chat.
pub trait Notifier: Send + Sync + 'static {
    /// Envoie un message, retourne son identifiant s'il est éditable.
    fn send(&self, chat_id: i64, text: &str) -> impl Future<Output = Result<Option<i64>, NotifyError>> + Send;

    fn edit(&self, chat_id: i64, message_id: i64, text: &str) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Sans token de bot : les alertes ne vont que dans les logs.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<Option<i64>, NotifyError> {
        info!(chat_id, "alert: {text}");
        Ok(None)
    }

    async fn edit(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), NotifyError> {
        debug!(chat_id, message_id, "update: {text}");
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<BotMessage>,
}

#[derive(serde::Deserialize)]
struct BotMessage {
    message_id: i64,
}

pub struct BotApiNotifier {
    client: reqwest::Client,
    base: String,
}

impl BotApiNotifier {
    pub fn new(bot_token: &str) -> Result<Self, NotifyError> {
        Self::with_base_url(DEFAULT_BOT_API, bot_token)
    }

    pub fn with_base_url(api: &str, bot_token: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self { client, base: format!("{}/bot{bot_token}", api.trim_end_matches('/')) })
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<BotReply, NotifyError> {
        let reply: BotReply = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if !reply.ok {
            return Err(NotifyError::Rejected(reply.description.unwrap_or_default()));
        }
        Ok(reply)
    }
}

impl Notifier for BotApiNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<Option<i64>, NotifyError> {
        let reply = self.call("sendMessage", serde_json::json!({ "chat_id": chat_id, "text": text })).await?;
        Ok(reply.result.map(|m| m.message_id))
    }

    async fn edit(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), NotifyError> {
        self.call(
            "editMessageText",
            serde_json::json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }
}

// ---------- boucle ----------

pub struct AlertRouter<N: Notifier> {
    notifier: N,
    subscriptions: Arc<AlertSubscriptions>,
    admin_id: Option<i64>,
    /// (utilisateur, token) -> message de trafic édité en place
    traffic_messages: HashMap<(i64, String), i64>,
}

impl<N: Notifier> AlertRouter<N> {
    pub fn new(notifier: N, subscriptions: Arc<AlertSubscriptions>, admin_id: Option<i64>) -> Self {
        Self { notifier, subscriptions, admin_id, traffic_messages: HashMap::new() }
    }

    pub async fn dispatch(&mut self, event: &BusEvent) -> usize {
        let targets = recipients(event, &self.subscriptions, self.admin_id);
        if targets.is_empty() {
            return 0;
        }
        let text = render(event);
        let mut delivered = 0;
        for chat_id in targets {
            let outcome = match event {
                BusEvent::TrafficUpdate { node_token, .. } => self.deliver_traffic(chat_id, node_token, &text).await,
                _ => self.notifier.send(chat_id, &text).await.map(|_| ()),
            };
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => warn!(chat_id, "{} not delivered: {e}", event.name()),
            }
        }
        delivered
    }

    async fn deliver_traffic(&mut self, chat_id: i64, node_token: &str, text: &str) -> Result<(), NotifyError> {
        let key = (chat_id, node_token.to_string());
        if let Some(message_id) = self.traffic_messages.get(&key) {
            return self.notifier.edit(chat_id, *message_id, text).await;
        }
        if let Some(message_id) = self.notifier.send(chat_id, text).await? {
            self.traffic_messages.insert(key, message_id);
        }
        Ok(())
    }

    pub async fn run(mut self, bus: EventBus, mut shutdown: watch::Receiver<bool>) {
        let mut sub = bus.subscribe();
        loop {
            tokio::select! {
                event = sub.recv_event() => match event {
                    Some(event) => {
                        if let BusEvent::CommandResult { command_kind: TaskKind::Traffic, .. } = &event {
                            continue;
                        }
                        self.dispatch(&event).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("alert router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ResourceAlert;
    use crate::registry::Metric;
    use parking_lot::Mutex;

    const ALPHA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BETA: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[derive(Default, Clone)]
    struct Recording {
        sent: Arc<Mutex<Vec<(i64, String)>>>,
        edited: Arc<Mutex<Vec<(i64, i64, String)>>>,
    }

    impl Notifier for Recording {
        async fn send(&self, chat_id: i64, text: &str) -> Result<Option<i64>, NotifyError> {
            let mut sent = self.sent.lock();
            sent.push((chat_id, text.to_string()));
            Ok(Some(sent.len() as i64))
        }

        async fn edit(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), NotifyError> {
            self.edited.lock().push((chat_id, message_id, text.to_string()));
            Ok(())
        }
    }

    async fn subs_in(dir: &Path) -> AlertSubscriptions {
        let store = Arc::new(CredentialStore::from_secret([8u8; 32]));
        AlertSubscriptions::open(&dir.join("alert_subscriptions.enc"), store).await.unwrap()
    }

    fn cpu_high(token: &str, name: &str) -> BusEvent {
        BusEvent::ResourceHigh(ResourceAlert {
            node_token: Some(token.into()),
            node_name: Some(name.into()),
            metric: Metric::Cpu,
            value: 97.0,
            threshold: 90.0,
            top_processes: "ffmpeg (88.0%)".into(),
        })
    }

    #[tokio::test]
    async fn test_node_override_beats_global() {
        let dir = tempfile::tempdir().unwrap();
        let subs = subs_in(dir.path()).await;
        let a = 1001;
        subs.set(a, "resources", true).await.unwrap();
        subs.set(a, &format!("node/{BETA}/resources"), false).await.unwrap();

        assert!(recipients(&cpu_high(BETA, "beta"), &subs, None).is_empty());
        assert_eq!(recipients(&cpu_high(ALPHA, "alpha"), &subs, None), vec![a]);
    }

    #[tokio::test]
    async fn test_override_can_enable_under_disabled_global() {
        let dir = tempfile::tempdir().unwrap();
        let subs = subs_in(dir.path()).await;
        subs.set(7, "downtime", false).await.unwrap();
        subs.set(7, &format!("node/{ALPHA}/downtime"), true).await.unwrap();
        assert!(subs.wants(7, Channel::Downtime, Some(ALPHA)));
        assert!(!subs.wants(7, Channel::Downtime, Some(BETA)));
        assert!(!subs.wants(7, Channel::Downtime, None));
        // canal jamais configuré : activé
        assert!(subs.wants(7, Channel::Bans, None));
    }

    #[tokio::test]
    async fn test_subscriptions_persist_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let subs = subs_in(dir.path()).await;
            subs.set(42, "logins", false).await.unwrap();
        }
        let raw = std::fs::read(dir.path().join("alert_subscriptions.enc")).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("logins"));
        let subs = subs_in(dir.path()).await;
        assert_eq!(subs.get(42).unwrap().get("logins"), Some(&false));
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let subs = subs_in(dir.path()).await;
        assert!(matches!(subs.set(1, "weather", true).await, Err(SubscriptionError::InvalidKey(_))));
        assert!(subs.set(1, "node/short/logins", true).await.is_err());
        let mut prefs = Preferences::new();
        prefs.insert(format!("node/{ALPHA}/bans"), false);
        prefs.insert("nope".into(), true);
        assert!(subs.replace(1, prefs).await.is_err());
        assert!(subs.get(1).is_none());
    }

    #[tokio::test]
    async fn test_addressed_events() {
        let dir = tempfile::tempdir().unwrap();
        let subs = subs_in(dir.path()).await;
        let result = BusEvent::CommandResult {
            node_token: ALPHA.into(),
            node_name: "alpha".into(),
            requester_id: 7,
            command_kind: TaskKind::Speedtest,
            payload: vigie_proto::ResultPayload::i18n("speedtest_ok").with("download", 93.4),
        };
        assert_eq!(recipients(&result, &subs, Some(1)), vec![7]);
        assert!(recipients(&BusEvent::SelfAlert { message: "disk".into() }, &subs, None).is_empty());
        assert_eq!(recipients(&BusEvent::SelfAlert { message: "disk".into() }, &subs, Some(1)), vec![1]);
        // l'opérateur reçoit les alertes même sans préférences enregistrées
        assert_eq!(recipients(&cpu_high(ALPHA, "alpha"), &subs, Some(1)), vec![1]);
        assert!(render(&result).contains("speedtest_ok"));
        assert!(render(&result).contains("download: 93.4"));
    }

    #[tokio::test]
    async fn test_traffic_message_edited_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let subs = Arc::new(subs_in(dir.path()).await);
        let notifier = Recording::default();
        let mut router = AlertRouter::new(notifier.clone(), subs, None);
        let update = |rx: f64| BusEvent::TrafficUpdate {
            node_token: ALPHA.into(),
            node_name: "alpha".into(),
            user_id: 9,
            rx_bps: rx,
            tx_bps: 0.0,
            rx_total: 0,
            tx_total: 0,
        };
        assert_eq!(router.dispatch(&update(2_000_000.0)).await, 1);
        assert_eq!(router.dispatch(&update(1_500.0)).await, 1);
        assert_eq!(notifier.sent.lock().len(), 1);
        let edited = notifier.edited.lock().clone();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].0, 9);
        assert!(edited[0].2.contains("1.5 kbit/s"));
    }

    #[tokio::test]
    async fn test_router_loop_fans_out_from_bus() {
        let dir = tempfile::tempdir().unwrap();
        let subs = Arc::new(subs_in(dir.path()).await);
        subs.set(5, "resources", true).await.unwrap();
        subs.set(6, "resources", false).await.unwrap();
        let notifier = Recording::default();
        let bus = EventBus::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(AlertRouter::new(notifier.clone(), subs, None).run(bus.clone(), rx));

        while bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(&cpu_high(ALPHA, "alpha"));
        for _ in 0..100 {
            if !notifier.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let sent = notifier.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 5);
        assert!(sent[0].1.contains("cpu high"));
        assert!(sent[0].1.contains("ffmpeg"));
    }
}
