//! Chat relay server.
//!
//! Accepts WebSocket connections on a single endpoint and relays every chat
//! message and typing signal to all connected clients.

use std::future::Future;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod hub;
pub mod registry;
pub mod state;
pub mod ws;

use state::AppState;

/// Build the router. There is no path-based routing: every request is
/// treated as a WebSocket upgrade.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(ws::ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every live connection.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let hub = state.hub.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = hub.shutdown().await;
            tracing::info!("Shutting down, closed {} connection(s)", closed);
        })
        .await
        .context("server stopped unexpectedly")
}
