/**
 * VIGIE KERNEL - Point d'entrée du contrôleur de surveillance VPS
 *
 * RÔLE : Orchestration de tous les modules : secret d'installation, registre
 * des nœuds, bus d'événements, moteur d'alertes, routeur chat, API HTTP + SSE.
 *
 * CYCLE DE VIE :
 * 1. .env + logs, lecture de l'environnement
 * 2. secret d'installation : échec => arrêt immédiat (jamais de mode en clair)
 * 3. chargement registre / abonnements / config système
 * 4. lancement des boucles (hôte, nœuds, trafic, tails, routeur, flush)
 * 5. serveur HTTP jusqu'à SIGINT/SIGTERM, puis arrêt des boucles et flush final
 */

mod alerts;
mod bus;
mod config;
mod credentials;
mod health;
mod heartbeat;
mod http;
mod registry;
mod router;
mod sse;
mod state;
mod traffic;

use crate::alerts::host::{HostMonitor, SysinfoSampler};
use crate::alerts::logs::LogForwarder;
use crate::alerts::logtail::{LogTail, TailKind};
use crate::alerts::nodes::NodeMonitor;
use crate::bus::EventBus;
use crate::config::{KernelEnv, SystemConfig};
use crate::credentials::CredentialStore;
use crate::health::HealthTracker;
use crate::http::{ApiKey, AppState};
use crate::registry::{NodeRegistry, SharedRegistry};
use crate::router::{AlertRouter, AlertSubscriptions, BotApiNotifier, TracingNotifier};
use crate::state::new_shared;
use crate::traffic::TrafficMonitor;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const FLUSH_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigie_kernel=info")))
        .init();

    let env = KernelEnv::from_env().context("reading environment")?;
    info!("data dir {}, deploy mode {:?}", env.data_dir.display(), env.deploy_mode);

    let store = Arc::new(
        CredentialStore::open(&env.secret_path())
            .with_context(|| format!("install secret {}", env.secret_path().display()))?,
    );

    let bus = EventBus::new();
    let registry: SharedRegistry = Arc::new(
        NodeRegistry::open(&env.registry_path(), store.clone(), bus.clone())
            .await
            .context("loading node registry")?,
    );
    info!("{} nodes registered", registry.len());
    let subscriptions = Arc::new(
        AlertSubscriptions::open(&env.subscriptions_path(), store.clone())
            .await
            .context("loading alert subscriptions")?,
    );
    let config = new_shared(SystemConfig::load(&env.system_config_path()).await);
    let traffic = Arc::new(TrafficMonitor::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // moteur d'alertes
    tasks.push(tokio::spawn(
        HostMonitor::new(SysinfoSampler::new(), bus.clone(), config.clone()).run(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        NodeMonitor::new(registry.clone(), bus.clone(), config.clone()).run(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(traffic.clone().run(registry.clone(), config.clone(), shutdown_rx.clone())));

    let forwarder = Arc::new(LogForwarder::new(bus.clone()));
    for (kind, path) in [(TailKind::Auth, env.auth_log.clone()), (TailKind::Ban, env.ban_log.clone())] {
        if let Some(path) = path {
            tasks.push(tokio::spawn(LogTail::new(kind, path, forwarder.clone()).run(shutdown_rx.clone())));
        }
    }

    // routeur chat
    match env.bot_token.as_deref() {
        Some(token) => {
            let notifier = BotApiNotifier::new(token).context("building chat client")?;
            let router = AlertRouter::new(notifier, subscriptions.clone(), env.admin_id);
            tasks.push(tokio::spawn(router.run(bus.clone(), shutdown_rx.clone())));
        }
        None => {
            warn!("VIGIE_BOT_TOKEN not set, alerts are only logged");
            let router = AlertRouter::new(TracingNotifier, subscriptions.clone(), env.admin_id);
            tasks.push(tokio::spawn(router.run(bus.clone(), shutdown_rx.clone())));
        }
    }

    tasks.push(tokio::spawn(flush_loop(registry.clone(), shutdown_rx.clone())));

    let app_state = AppState {
        registry: registry.clone(),
        bus: bus.clone(),
        config,
        config_path: env.system_config_path(),
        subscriptions,
        traffic,
        health: HealthTracker::new(env.deploy_mode),
        api_key: env.api_key.as_deref().map(|key| ApiKey::new(key, store.derive_web_key())),
        shutdown: shutdown_rx.clone(),
    };
    if app_state.api_key.is_none() {
        warn!("VIGIE_API_KEY not set, admin API and /events are closed");
    }
    let app = http::build_router(app_state);

    let addr = format!("{}:{}", env.web_host, env.web_port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("http server")?;

    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {e}");
        }
    }
    if let Err(e) = registry.flush().await {
        error!("final registry flush failed: {e}");
    }
    info!("kernel stopped");
    Ok(())
}

async fn flush_loop(registry: SharedRegistry, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(FLUSH_PERIOD) => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = registry.flush().await {
            warn!("registry flush failed: {e}");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
