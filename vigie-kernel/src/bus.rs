/**
 * EVENT BUS - Diffusion in-process des événements du kernel
 *
 * RÔLE :
 * Remplace le broker MQTT : heartbeat, moteur d'alertes et collecteurs de
 * logs publient ; le routeur chat et chaque client SSE s'abonnent.
 *
 * FONCTIONNEMENT :
 * - Chaque abonné possède une file bornée (256 par défaut)
 * - L'événement est sérialisé une fois en JSON, puis partagé (`Arc<str>`)
 * - File pleine => l'événement est perdu pour CET abonné seulement, compteur +1
 * - L'ordre de publication est conservé par abonné
 */

use crate::registry::Metric;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};
use uuid::Uuid;
use vigie_proto::{LoginMethod, ResultPayload, TaskKind, WireStats};

pub const DEFAULT_CAPACITY: usize = 256;

/// Catégories d'alertes auxquelles un abonné peut s'inscrire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Resources,
    Logins,
    Bans,
    Downtime,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Resources, Channel::Logins, Channel::Bans, Channel::Downtime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Resources => "resources",
            Channel::Logins => "logins",
            Channel::Bans => "bans",
            Channel::Downtime => "downtime",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Channel::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlert {
    /// `None` = l'hôte du kernel lui-même.
    pub node_token: Option<String>,
    pub node_name: Option<String>,
    pub metric: Metric,
    pub value: f64,
    pub threshold: f64,
    pub top_processes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum BusEvent {
    #[serde(rename = "command_result")]
    CommandResult {
        node_token: String,
        node_name: String,
        requester_id: i64,
        command_kind: TaskKind,
        payload: ResultPayload,
    },
    #[serde(rename = "logins")]
    Login {
        node_token: Option<String>,
        node_name: Option<String>,
        user: String,
        ip: String,
        method: Option<LoginMethod>,
        timestamp: i64,
        node_time_str: Option<String>,
        tz_label: Option<String>,
    },
    #[serde(rename = "bans")]
    Ban {
        node_token: Option<String>,
        node_name: Option<String>,
        jail: String,
        ip: String,
        timestamp: i64,
    },
    #[serde(rename = "resources/high")]
    ResourceHigh(ResourceAlert),
    #[serde(rename = "resources/high_repeat")]
    ResourceHighRepeat(ResourceAlert),
    #[serde(rename = "resources/normal")]
    ResourceNormal {
        node_token: Option<String>,
        node_name: Option<String>,
        metric: Metric,
        value: f64,
    },
    #[serde(rename = "downtime/node_down")]
    NodeDown {
        node_token: String,
        node_name: String,
        last_seen: i64,
    },
    #[serde(rename = "downtime/node_up")]
    NodeUp { node_token: String, node_name: String },
    #[serde(rename = "node_stats")]
    NodeStats {
        node_token: String,
        node_name: String,
        last_seen: i64,
        stats: WireStats,
    },
    #[serde(rename = "traffic/update")]
    TrafficUpdate {
        node_token: String,
        node_name: String,
        user_id: i64,
        rx_bps: f64,
        tx_bps: f64,
        rx_total: u64,
        tx_total: u64,
    },
    #[serde(rename = "self/alert")]
    SelfAlert { message: String },
}

impl BusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::CommandResult { .. } => "command_result",
            BusEvent::Login { .. } => "logins",
            BusEvent::Ban { .. } => "bans",
            BusEvent::ResourceHigh(_) => "resources/high",
            BusEvent::ResourceHighRepeat(_) => "resources/high_repeat",
            BusEvent::ResourceNormal { .. } => "resources/normal",
            BusEvent::NodeDown { .. } => "downtime/node_down",
            BusEvent::NodeUp { .. } => "downtime/node_up",
            BusEvent::NodeStats { .. } => "node_stats",
            BusEvent::TrafficUpdate { .. } => "traffic/update",
            BusEvent::SelfAlert { .. } => "self/alert",
        }
    }

    /// Canal d'alerte, `None` pour les événements adressés (résultats, trafic, self).
    pub fn channel(&self) -> Option<Channel> {
        match self {
            BusEvent::Login { .. } => Some(Channel::Logins),
            BusEvent::Ban { .. } => Some(Channel::Bans),
            BusEvent::ResourceHigh(_) | BusEvent::ResourceHighRepeat(_) | BusEvent::ResourceNormal { .. } => {
                Some(Channel::Resources)
            }
            BusEvent::NodeDown { .. } | BusEvent::NodeUp { .. } => Some(Channel::Downtime),
            BusEvent::CommandResult { .. }
            | BusEvent::NodeStats { .. }
            | BusEvent::TrafficUpdate { .. }
            | BusEvent::SelfAlert { .. } => None,
        }
    }

    /// Token du nœud concerné, `None` pour l'hôte du kernel.
    pub fn node_token(&self) -> Option<&str> {
        match self {
            BusEvent::CommandResult { node_token, .. }
            | BusEvent::NodeDown { node_token, .. }
            | BusEvent::NodeUp { node_token, .. }
            | BusEvent::NodeStats { node_token, .. }
            | BusEvent::TrafficUpdate { node_token, .. } => Some(node_token),
            BusEvent::Login { node_token, .. }
            | BusEvent::Ban { node_token, .. }
            | BusEvent::ResourceNormal { node_token, .. } => node_token.as_deref(),
            BusEvent::ResourceHigh(a) | BusEvent::ResourceHighRepeat(a) => a.node_token.as_deref(),
            BusEvent::SelfAlert { .. } => None,
        }
    }
}

struct BusInner {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Arc<str>>>>,
    dropped: AtomicU64,
    published: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                dropped: AtomicU64::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        self.inner.subscribers.lock().insert(id, tx);
        debug!("bus subscriber {id} attached");
        Subscription { id, rx, bus: Arc::downgrade(&self.inner) }
    }

    /// Détache explicitement un abonné (équivaut à le dropper).
    pub fn unsubscribe(&self, sub: Subscription) {
        drop(sub);
    }

    /// Publie vers tous les abonnés vivants. Retourne le nombre de files servies.
    pub fn publish(&self, event: &BusEvent) -> usize {
        let text: Arc<str> = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                error!("cannot serialize {} event: {e}", event.name());
                return 0;
            }
        };
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut subs = self.inner.subscribers.lock();
        subs.retain(|id, tx| match tx.try_send(text.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("bus queue full for {id}, dropped {}", event.name());
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

/// Poignée d'abonné ; le drop libère la file côté bus.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Arc<str>>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Prochain événement sérialisé, `None` si le bus a disparu.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }

    /// Comme `recv`, mais désérialise. Les entrées illisibles sont sautées.
    pub async fn recv_event(&mut self) -> Option<BusEvent> {
        loop {
            let raw = self.rx.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(ev) => return Some(ev),
                Err(e) => error!("unreadable bus event skipped: {e}"),
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn self_alert(n: usize) -> BusEvent {
        BusEvent::SelfAlert { message: format!("m{n}") }
    }

    #[test]
    fn test_wire_form() {
        let ev = BusEvent::NodeUp { node_token: "t".into(), node_name: "alpha".into() };
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(v, json!({"event": "downtime/node_up", "data": {"node_token": "t", "node_name": "alpha"}}));
        assert_eq!(v["event"], ev.name());
    }

    #[test]
    fn test_resource_event_names() {
        let alert = ResourceAlert {
            node_token: None,
            node_name: None,
            metric: Metric::Cpu,
            value: 91.0,
            threshold: 90.0,
            top_processes: String::new(),
        };
        let high = serde_json::to_value(BusEvent::ResourceHigh(alert.clone())).unwrap();
        assert_eq!(high["event"], "resources/high");
        assert_eq!(high["data"]["metric"], "cpu");
        let repeat = serde_json::to_value(BusEvent::ResourceHighRepeat(alert)).unwrap();
        assert_eq!(repeat["event"], "resources/high_repeat");
    }

    #[tokio::test]
    async fn test_publish_order_per_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for n in 0..10 {
            assert_eq!(bus.publish(&self_alert(n)), 2);
        }
        for n in 0..10 {
            assert_eq!(a.recv_event().await.unwrap(), self_alert(n));
            assert_eq!(b.recv_event().await.unwrap(), self_alert(n));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_slow_subscriber() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_with_capacity(2);
        let mut fast = bus.subscribe();

        for n in 0..5 {
            bus.publish(&self_alert(n));
            assert_eq!(fast.recv_event().await.unwrap(), self_alert(n));
        }
        assert_eq!(bus.dropped_count(), 3);
        assert_eq!(slow.recv_event().await.unwrap(), self_alert(0));
        assert_eq!(slow.recv_event().await.unwrap(), self_alert(1));
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe_and_drop_reclaim() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.unsubscribe(a);
        assert_eq!(bus.subscriber_count(), 1);
        drop(b);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(&self_alert(0)), 0);
    }

    #[test]
    fn test_channel_and_scope() {
        let down = BusEvent::NodeDown { node_token: "tok".into(), node_name: "beta".into(), last_seen: 5 };
        assert_eq!(down.channel(), Some(Channel::Downtime));
        assert_eq!(down.node_token(), Some("tok"));
        assert_eq!(self_alert(0).channel(), None);
        assert_eq!(Channel::parse("bans"), Some(Channel::Bans));
        assert_eq!(Channel::parse("self"), None);
    }
}
