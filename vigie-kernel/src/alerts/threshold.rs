//! Machines à états des alertes : seuil unique + cooldown, et liveness.
//!
//! ```text
//!   inactive ──v≥T──▶ active ──(cooldown écoulé, v≥T)──▶ active (repeat)
//!      ▲                 │
//!      └──────v<T────────┘
//! ```

use crate::registry::AlertState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    High,
    HighRepeat,
    Normal,
}

/// Avance l'état d'un couple (portée, métrique) pour un échantillon.
pub fn step(state: &mut AlertState, value: f64, threshold: f64, cooldown: i64, now: i64) -> Option<Transition> {
    if value >= threshold {
        if !state.active {
            state.active = true;
            state.last_fired = now;
            Some(Transition::High)
        } else if now - state.last_fired > cooldown {
            state.last_fired = now;
            Some(Transition::HighRepeat)
        } else {
            None
        }
    } else if state.active {
        *state = AlertState::default();
        Some(Transition::Normal)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Down,
    Up,
}

/// Un nœud jamais vu (`last_seen == 0`) n'est jamais "mort".
pub fn is_dead(last_seen: i64, now: i64, offline_timeout: i64) -> bool {
    last_seen > 0 && now - last_seen >= offline_timeout
}

pub fn liveness_step(
    last_seen: i64,
    now: i64,
    offline_timeout: i64,
    restarting: bool,
    alert_sent: bool,
) -> Option<Liveness> {
    let dead = is_dead(last_seen, now, offline_timeout);
    if dead && !alert_sent && !restarting {
        Some(Liveness::Down)
    } else if !dead && alert_sent {
        Some(Liveness::Up)
    } else {
        None
    }
}
