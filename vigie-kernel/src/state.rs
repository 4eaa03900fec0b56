/**
 * ÉTAT PARTAGÉ - Primitives communes à tous les modules du kernel
 *
 * RÔLE : `Shared<T>` est le verrou par enregistrement (un nœud = un mutex),
 * `unix_now()` l'horloge unique du kernel en secondes epoch.
 */

use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Secondes depuis l'epoch (UTC).
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Formate un timestamp epoch en RFC3339 pour l'API, "" si hors plage.
pub fn format_epoch(secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_default()
}
