/**
 * HEARTBEAT ENDPOINT - `POST /heartbeat`, point d'entrée unique des nœuds
 *
 * FONCTIONNEMENT (dans cet ordre) :
 * 1. JSON illisible                         -> 400
 * 2. token inconnu                          -> 401 (sans dire pourquoi)
 * 3. X-Signature != HMAC(corps brut, token) -> 401 (comparaison temps constant)
 * 4. |timestamp - maintenant| > 300 s       -> 400 (rejeu / horloge)
 * 5. registre mis à jour, `restarting` levé, sauf si le heartbeat porte
 *    l'accusé d'un reboot : le nœud va s'éteindre
 * 6. chaque résultat -> `command_result` sur le bus (+ débit si trafic suivi)
 * 7. chaque login SSH -> `logins` sur le bus
 * 8. la file de tâches est vidée dans la réponse (au plus une fois) ;
 *    un reboot livré garde `restarting` jusqu'au heartbeat d'après reboot
 */

use crate::bus::BusEvent;
use crate::http::AppState;
use crate::state::unix_now;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;
use vigie_proto::{
    verify_body, HeartbeatRequest, HeartbeatResponse, TaskKind, WireTask, MAX_CLOCK_SKEW_SECS, SIGNATURE_HEADER,
};

/// Un heartbeat dépasse rarement quelques Ko ; au-delà c'est suspect.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("malformed heartbeat")]
    Malformed,
    #[error("unknown node")]
    UnknownNode,
    #[error("bad signature")]
    BadSignature,
    #[error("timestamp outside accepted window")]
    Replay,
}

impl IntoResponse for HeartbeatError {
    fn into_response(self) -> Response {
        match self {
            HeartbeatError::Malformed | HeartbeatError::Replay => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "status": "error", "error": self.to_string() })),
            )
                .into_response(),
            // 401 nu : ne pas révéler si le token existe ou si la signature a échoué
            HeartbeatError::UnknownNode | HeartbeatError::BadSignature => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
}

pub async fn heartbeat(State(app): State<AppState>, request: Request) -> Response {
    let observed = observed_address(request.headers(), request.extensions().get::<ConnectInfo<SocketAddr>>());
    let signature = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return HeartbeatError::Malformed.into_response(),
    };

    match process(&app, &body, signature.as_deref(), observed, unix_now(), Instant::now()) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            debug!("heartbeat rejected: {e}");
            e.into_response()
        }
    }
}

/// Cœur du traitement, sans HTTP : testable avec une horloge fixe.
pub fn process(
    app: &AppState,
    body: &[u8],
    signature: Option<&str>,
    observed: Option<String>,
    now: i64,
    at: Instant,
) -> Result<HeartbeatResponse, HeartbeatError> {
    let req = HeartbeatRequest::parse(body).map_err(|_| HeartbeatError::Malformed)?;

    if !app.registry.contains(&req.token) {
        return Err(HeartbeatError::UnknownNode);
    }
    match signature {
        Some(sig) if verify_body(&req.token, body, sig) => {}
        _ => return Err(HeartbeatError::BadSignature),
    }
    if req.timestamp.abs_diff(now) > MAX_CLOCK_SKEW_SECS as u64 {
        return Err(HeartbeatError::Replay);
    }

    let node_name = app
        .registry
        .record_heartbeat(&req.token, observed, req.stats.clone(), now)
        // supprimé entre la vérification et l'écriture
        .map_err(|_| HeartbeatError::UnknownNode)?;
    if req.results.iter().any(|r| r.command == TaskKind::Reboot) {
        app.registry.mark_restarting(&req.token).map_err(|_| HeartbeatError::UnknownNode)?;
    }
    let last_seen = app.registry.lookup(&req.token).map(|n| n.last_seen).unwrap_or(now);

    app.bus.publish(&BusEvent::NodeStats {
        node_token: req.token.clone(),
        node_name: node_name.clone(),
        last_seen,
        stats: req.stats,
    });

    let fallback_interval = app.config.lock().traffic_interval as f64;
    for result in req.results {
        if let Some(update) = app.traffic.observe(&req.token, &node_name, &result, at, fallback_interval) {
            app.bus.publish(&update);
        }
        app.bus.publish(&BusEvent::CommandResult {
            node_token: req.token.clone(),
            node_name: node_name.clone(),
            requester_id: result.user_id,
            command_kind: result.command,
            payload: result.result,
        });
    }

    for login in req.ssh_logins {
        app.bus.publish(&BusEvent::Login {
            node_token: Some(req.token.clone()),
            node_name: Some(node_name.clone()),
            user: login.user,
            ip: login.ip,
            method: Some(login.method),
            timestamp: login.timestamp,
            node_time_str: Some(login.node_time_str),
            tz_label: Some(login.tz_label),
        });
    }

    let tasks: Vec<WireTask> = app
        .registry
        .drain_tasks(&req.token)
        .map_err(|_| HeartbeatError::UnknownNode)?
        .into_iter()
        .map(|t| WireTask { command: t.command_kind, user_id: t.requester_id })
        .collect();
    if tasks.iter().any(|t| t.command == TaskKind::Reboot) {
        app.registry.mark_restarting(&req.token).map_err(|_| HeartbeatError::UnknownNode)?;
    }

    Ok(HeartbeatResponse::ok(tasks))
}

/// Adresse du nœud : proxy (X-Forwarded-For / X-Real-IP) puis socket.
fn observed_address(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
}
