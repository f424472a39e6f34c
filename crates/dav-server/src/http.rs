// SPDX-License-Identifier: AGPL-3.0-only
//! HTTP server for health checks, gate status and Prometheus metrics.

use crate::metrics::metrics;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tracing::{error, info};
use usg_dav_gate::{ConnectionRegistry, MemoryDefender};

/// Readiness and gate handles shared between the health server and main.
#[derive(Clone)]
pub struct ServerState {
    /// Whether the WebDAV listener accepts connections.
    ready: Arc<AtomicBool>,
    /// Cleared once shutdown starts.
    alive: Arc<AtomicBool>,
    registry: Option<Arc<ConnectionRegistry>>,
    defender: Option<Arc<MemoryDefender>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
            registry: None,
            defender: None,
        }
    }

    /// Expose the gate's connection table and ban list on `/status`.
    pub fn with_gate(
        mut self,
        registry: Arc<ConnectionRegistry>,
        defender: Arc<MemoryDefender>,
    ) -> Self {
        self.registry = Some(registry);
        self.defender = Some(defender);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    active_connections: usize,
    banned_hosts: Vec<IpAddr>,
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// 200 once the listener is up; 503 "draining" during shutdown.
async fn ready_handler(State(state): State<ServerState>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, Json(HealthResponse { status: "ready" })).into_response()
    } else if state.is_alive() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "draining" }),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready",
            }),
        )
            .into_response()
    }
}

async fn live_handler(State(state): State<ServerState>) -> Response {
    if state.is_alive() {
        (StatusCode::OK, Json(HealthResponse { status: "alive" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "dead" }),
        )
            .into_response()
    }
}

async fn status_handler(State(state): State<ServerState>) -> Response {
    let Some(registry) = &state.registry else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let banned_hosts = state
        .defender
        .as_ref()
        .map(|d| d.banned_hosts())
        .unwrap_or_default();
    Json(StatusResponse {
        active_connections: registry.len(),
        banned_hosts,
    })
    .into_response()
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics().encode(),
    )
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Start the HTTP server for health checks and metrics.
pub async fn serve_http(addr: SocketAddr, state: ServerState) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening for health checks and metrics");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    Ok(())
}
