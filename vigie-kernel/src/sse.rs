/**
 * SSE GATEWAY - `GET /events`, flux temps réel pour les dashboards
 *
 * FONCTIONNEMENT :
 * - Un abonnement au bus par connexion, file bornée (événements perdus si
 *   le client lit trop lentement, jamais de blocage du publieur)
 * - Une ligne `data: {"event":..,"data":..}` par événement
 * - Commentaire `: keep-alive` après 10 s de silence
 * - Déconnexion du client => le flux est libéré => désabonnement
 * - Arrêt du kernel => le flux se termine, sinon l'arrêt gracieux attendrait
 * - Rien n'est bufferisé entre deux connexions : le client relit `/nodes`
 */

use crate::bus::Subscription;
use crate::http::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub const KEEP_ALIVE: Duration = Duration::from_secs(10);

pub async fn events(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = app.bus.subscribe();
    debug!("sse client connected ({})", sub.id());
    Sse::new(event_stream(sub, app.shutdown.clone()))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("keep-alive"))
}

fn event_stream(
    sub: Subscription,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((sub, shutdown), |(mut sub, mut shutdown)| async move {
        let raw = tokio::select! {
            raw = sub.recv() => raw?,
            _ = stopped(&mut shutdown) => return None,
        };
        Some((Ok(Event::default().data(&*raw)), (sub, shutdown)))
    })
}

/// Attend le signal d'arrêt ; un émetteur disparu n'arrête jamais le flux.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
