//! Boucle (c) : relais des connexions et bans vers le bus, avec déduplication.

use crate::bus::{BusEvent, Channel, EventBus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;
use vigie_proto::authlog::AuthAccept;
use vigie_proto::BanEvent;

pub const DEDUP_WINDOW: Duration = Duration::from_secs(10);
pub const DEDUP_CAPACITY: usize = 100;

/// Événement issu d'un collecteur de logs, avant passage sur le bus.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLogEvent {
    Login {
        node_token: Option<String>,
        node_name: Option<String>,
        accept: AuthAccept,
        timestamp: i64,
    },
    Ban {
        node_token: Option<String>,
        node_name: Option<String>,
        ban: BanEvent,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DedupKey {
    channel: Channel,
    scope: Option<String>,
    who: String,
    ip: String,
}

impl ParsedLogEvent {
    fn key(&self) -> DedupKey {
        match self {
            ParsedLogEvent::Login { node_token, accept, .. } => DedupKey {
                channel: Channel::Logins,
                scope: node_token.clone(),
                who: accept.user.clone(),
                ip: accept.ip.clone(),
            },
            ParsedLogEvent::Ban { node_token, ban, .. } => DedupKey {
                channel: Channel::Bans,
                scope: node_token.clone(),
                who: ban.jail.clone(),
                ip: ban.ip.clone(),
            },
        }
    }

    fn into_bus_event(self) -> BusEvent {
        match self {
            ParsedLogEvent::Login { node_token, node_name, accept, timestamp } => BusEvent::Login {
                node_token,
                node_name,
                user: accept.user,
                ip: accept.ip,
                method: Some(accept.method),
                timestamp,
                node_time_str: None,
                tz_label: None,
            },
            ParsedLogEvent::Ban { node_token, node_name, ban, timestamp } => BusEvent::Ban {
                node_token,
                node_name,
                jail: ban.jail,
                ip: ban.ip,
                timestamp,
            },
        }
    }
}

pub struct LogForwarder {
    bus: EventBus,
    recent: Mutex<VecDeque<(DedupKey, Instant)>>,
}

impl LogForwarder {
    pub fn new(bus: EventBus) -> Self {
        Self { bus, recent: Mutex::new(VecDeque::with_capacity(DEDUP_CAPACITY)) }
    }

    /// Publie l'événement sauf doublon récent. Retourne `true` si publié.
    pub fn forward(&self, event: ParsedLogEvent, at: Instant) -> bool {
        let key = event.key();
        {
            let mut recent = self.recent.lock();
            recent.retain(|(_, seen)| at.saturating_duration_since(*seen) < DEDUP_WINDOW);
            if recent.iter().any(|(k, _)| *k == key) {
                debug!("duplicate {} event from {} suppressed", key.channel.as_str(), key.ip);
                return false;
            }
            if recent.len() >= DEDUP_CAPACITY {
                recent.pop_front();
            }
            recent.push_back((key, at));
        }
        self.bus.publish(&event.into_bus_event());
        true
    }
}
