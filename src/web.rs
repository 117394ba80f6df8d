//! HTTP surface exposing `HealthRegistry` and `PersistenceStore` (spec
//! §4.8, §6): `/health`, `/ready`, `/metrics`, `/stats`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::health::HealthRegistry;
use crate::persistence::PersistenceStore;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthRegistry>,
    pub persistence: Arc<PersistenceStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .with_state(state)
}

/// `200` with a JSON snapshot if any DTU has had a recent successful
/// query, `503` with the same body otherwise.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let snapshot = state.health.snapshot(now);
    let status = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    if state.health.is_healthy(now) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

/// Handler exceptions must not crash the server (spec §4.8); a render
/// failure becomes a `500` with the error text rather than a panic.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.health.render_prometheus() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.persistence.statistics().await;
    Json(stats)
}

/// Binds `{host, port}` and serves until the listener is dropped. The
/// Supervisor spawns this on its own task and aborts it on shutdown.
pub async fn serve(host: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
