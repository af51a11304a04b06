//! HTTP front door.
//!
//! `GET /ws` upgrades to a WebSocket and runs one gateway session over it.
//! `GET /healthz` reports liveness and session counters. Every other path is
//! served from the web root, so `/` returns the browser client.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::proxy::{Gateway, WebSocketStream};

/// Shared handler state.
#[derive(Clone)]
struct AppState {
    gateway: Gateway,
    /// Root token; each session runs under a child of it.
    shutdown: CancellationToken,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Always "ok" while the server is accepting requests.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Sessions currently running.
    pub sessions_active: u64,
    /// Sessions started since boot.
    pub sessions_accepted: u64,
}

/// Build the router.
pub fn create_router(
    gateway: Gateway,
    shutdown: CancellationToken,
    web_root: impl AsRef<Path>,
) -> Router {
    Router::new()
        .route("/ws", get(connect_session))
        .route("/healthz", get(healthz))
        .fallback_service(ServeDir::new(web_root))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { gateway, shutdown })
}

async fn connect_session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let cancel = state.shutdown.child_token();
        // Failures are logged inside the session span.
        let _ = state
            .gateway
            .serve(WebSocketStream::new(socket), peer, cancel)
            .await;
    })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.gateway.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "webrdp-gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions_active: stats.sessions_active.load(Ordering::Relaxed),
        sessions_accepted: stats.sessions_accepted.load(Ordering::Relaxed),
    })
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        info!("HTTP server shutting down");
    })
    .await
}

/// Bind and run the gateway described by `config` until `shutdown` fires.
pub async fn run(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let gateway =
        Gateway::new(config.session_config()).context("Failed to build TLS client config")?;
    let app = create_router(gateway, shutdown.clone(), &config.web_root);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(
        addr = %listener.local_addr()?,
        web_root = %config.web_root.display(),
        "Listening for connections"
    );

    serve(listener, app, shutdown)
        .await
        .context("HTTP server error")
}
