/**
 * API REST VIGIE - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Point d'entrée des nœuds (`POST /heartbeat`), du flux temps réel
 * (`GET /events`) et de l'administration (nœuds, tâches, trafic,
 * abonnements aux alertes, seuils).
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf sur /health et /heartbeat
 *   (le heartbeat s'authentifie par signature HMAC)
 * - `/events` accepte aussi `?key=` : EventSource ne peut pas poser de header
 * - Sans VIGIE_API_KEY, toute route protégée répond 401
 */

use crate::bus::EventBus;
use crate::config::SystemConfig;
use crate::health::{HealthTracker, KernelHealth};
use crate::registry::{MetricPoint, NodeRecord, RegistryError, SharedRegistry, TaskRecord};
use crate::router::{AlertSubscriptions, Preferences, SubscriptionError};
use crate::state::{format_epoch, unix_now, Shared};
use crate::traffic::{SessionView, TrafficMonitor};
use crate::{heartbeat, sse};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use vigie_proto::{token_prefix, TaskKind, WireStats};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub bus: EventBus,
    pub config: Shared<SystemConfig>,
    pub config_path: PathBuf,
    pub subscriptions: Arc<AlertSubscriptions>,
    pub traffic: Arc<TrafficMonitor>,
    pub health: HealthTracker,
    pub api_key: Option<ApiKey>,
    pub shutdown: watch::Receiver<bool>,
}

/// Clé API conservée sous forme d'empreinte SHA-256 salée par la clé web :
/// la comparaison porte sur des empreintes, jamais sur la clé en clair.
#[derive(Clone)]
pub struct ApiKey {
    web_key: [u8; 32],
    digest: [u8; 32],
}

impl ApiKey {
    pub fn new(key: &str, web_key: [u8; 32]) -> Self {
        Self { web_key, digest: fingerprint(&web_key, key) }
    }

    pub fn matches(&self, provided: &str) -> bool {
        fingerprint(&self.web_key, provided) == self.digest
    }
}

fn fingerprint(web_key: &[u8; 32], key: &str) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(web_key);
    h.update(key.as_bytes());
    h.finalize().into()
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/heartbeat", post(heartbeat::heartbeat))
        .route("/events", get(sse::events))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(list_nodes).post(create_node))
        .route("/nodes/{token}", get(get_node).patch(rename_node).delete(delete_node))
        .route("/nodes/{token}/tasks", post(enqueue_task))
        .route("/nodes/{token}/traffic", post(start_traffic).delete(stop_traffic))
        .route("/traffic", get(list_traffic))
        .route("/subscriptions/{subscriber_id}", get(get_subscriptions).put(put_subscriptions))
        .route("/config", get(get_config).put(put_config))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// `?key=` décodé (percent-encoding compris).
fn query_key(req: &Request) -> Option<String> {
    Query::<KeyQuery>::try_from_uri(req.uri()).ok()?.0.key
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // santé et heartbeat toujours accessibles
    if path == "/health" || path == "/heartbeat" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_ref() else {
        warn!("VIGIE_API_KEY not set, {path} denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let header = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let provided = match header {
        Some(h) => Some(h.to_string()),
        None if path == "/events" => query_key(&req),
        None => None,
    };
    if !provided.is_some_and(|key| expected.matches(&key)) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::UnknownNode => StatusCode::NOT_FOUND,
        RegistryError::EmptyName => StatusCode::BAD_REQUEST,
        _ => {
            warn!("registry operation failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ---------- vues ----------

#[derive(Serialize)]
struct NodeView {
    token: String,
    display_name: String,
    created_at: String,
    last_seen: Option<String>,
    online: bool,
    observed_address: Option<String>,
    current_stats: Option<WireStats>,
    pending_tasks: usize,
    restarting: bool,
}

#[derive(Serialize)]
struct NodeDetail {
    #[serde(flatten)]
    node: NodeView,
    history: Vec<MetricPoint>,
}

fn to_view(n: &NodeRecord, offline_timeout: i64) -> NodeView {
    let now = unix_now();
    NodeView {
        token: n.token.clone(),
        display_name: n.display_name.clone(),
        created_at: format_epoch(n.created_at),
        last_seen: (n.last_seen > 0).then(|| format_epoch(n.last_seen)),
        online: n.last_seen > 0 && now - n.last_seen < offline_timeout,
        observed_address: n.observed_address.clone(),
        current_stats: n.current_stats.clone(),
        pending_tasks: n.pending_tasks.len(),
        restarting: n.restarting,
    }
}

// ---------- handlers ----------

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let cfg = app.config.lock().clone();
    Json(app.health.get_health(&app.registry, &app.bus, &cfg))
}

// GET /nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<NodeView>> {
    let timeout = app.config.lock().node_offline_timeout;
    Json(app.registry.list_all().iter().map(|n| to_view(n, timeout)).collect())
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

// POST /nodes
async fn create_node(
    State(app): State<AppState>,
    Json(body): Json<NameBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    let token = app.registry.create(&body.name).await.map_err(|e| registry_status(&e))?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "token": token }))))
}

// GET /nodes/{token}
async fn get_node(State(app): State<AppState>, Path(token): Path<String>) -> Result<Json<NodeDetail>, StatusCode> {
    let node = app.registry.lookup(&token).ok_or(StatusCode::NOT_FOUND)?;
    let timeout = app.config.lock().node_offline_timeout;
    Ok(Json(NodeDetail { node: to_view(&node, timeout), history: node.history.iter().cloned().collect() }))
}

// PATCH /nodes/{token}
async fn rename_node(
    State(app): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<NameBody>,
) -> Result<StatusCode, StatusCode> {
    app.registry.rename(&token, &body.name).await.map_err(|e| registry_status(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

// DELETE /nodes/{token}
async fn delete_node(State(app): State<AppState>, Path(token): Path<String>) -> Result<StatusCode, StatusCode> {
    app.registry.delete(&token).await.map_err(|e| registry_status(&e))?;
    app.traffic.stop(&token);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TaskBody {
    command: TaskKind,
    user_id: i64,
}

// POST /nodes/{token}/tasks
async fn enqueue_task(
    State(app): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<TaskBody>,
) -> Result<StatusCode, StatusCode> {
    let task = TaskRecord { command_kind: body.command, requester_id: body.user_id, issued_at: unix_now() };
    app.registry.enqueue_task(&token, task).map_err(|e| registry_status(&e))?;
    info!("{} queued for {} by {}", body.command, token_prefix(&token), body.user_id);
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct TrafficBody {
    user_id: i64,
}

// POST /nodes/{token}/traffic
async fn start_traffic(
    State(app): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<TrafficBody>,
) -> Result<StatusCode, StatusCode> {
    if !app.registry.contains(&token) {
        return Err(StatusCode::NOT_FOUND);
    }
    app.traffic.start(&token, body.user_id);
    Ok(StatusCode::ACCEPTED)
}

// DELETE /nodes/{token}/traffic
async fn stop_traffic(State(app): State<AppState>, Path(token): Path<String>) -> StatusCode {
    if app.traffic.stop(&token) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// GET /traffic
async fn list_traffic(State(app): State<AppState>) -> Json<Vec<SessionView>> {
    Json(app.traffic.sessions())
}

// GET /subscriptions/{subscriber_id}
async fn get_subscriptions(State(app): State<AppState>, Path(subscriber_id): Path<i64>) -> Json<Preferences> {
    Json(app.subscriptions.get(subscriber_id).unwrap_or_default())
}

// PUT /subscriptions/{subscriber_id}
async fn put_subscriptions(
    State(app): State<AppState>,
    Path(subscriber_id): Path<i64>,
    Json(prefs): Json<Preferences>,
) -> Response {
    match app.subscriptions.replace(subscriber_id, prefs).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ SubscriptionError::InvalidKey(_)) => {
            (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            warn!("subscriptions not saved: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// GET /config
async fn get_config(State(app): State<AppState>) -> Json<SystemConfig> {
    Json(app.config.lock().clone())
}

// PUT /config : mise à jour partielle, les clés absentes gardent leur valeur
async fn put_config(
    State(app): State<AppState>,
    Json(patch): Json<serde_json::Map<String, serde_json::Value>>,
) -> Response {
    let merged = app.config.lock().merged(&patch);
    let cfg = match merged {
        Ok(cfg) => cfg,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))).into_response();
        }
    };
    if let Err(e) = cfg.save(&app.config_path).await {
        warn!("system config not saved: {e}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    *app.config.lock() = cfg.clone();
    info!("system config updated");
    Json(cfg).into_response()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::config::DeployMode;
    use crate::credentials::CredentialStore;
    use crate::registry::NodeRegistry;
    use crate::state::new_shared;

    pub const TEST_KEY: &str = "test-key";

    pub async fn test_app() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = Arc::new(CredentialStore::from_secret([4u8; 32]));
        let registry = Arc::new(
            NodeRegistry::open(&dir.path().join("nodes.enc"), store.clone(), bus.clone()).await.unwrap(),
        );
        let web_key = store.derive_web_key();
        let subscriptions =
            Arc::new(AlertSubscriptions::open(&dir.path().join("alert_subscriptions.enc"), store).await.unwrap());
        let app = AppState {
            registry,
            bus,
            config: new_shared(SystemConfig::default()),
            config_path: dir.path().join("system_config.json"),
            subscriptions,
            traffic: Arc::new(TrafficMonitor::new()),
            health: HealthTracker::new(DeployMode::Systemd),
            api_key: Some(ApiKey::new(TEST_KEY, web_key)),
            shutdown: watch::channel(false).1,
        };
        (app, dir)
    }
}
