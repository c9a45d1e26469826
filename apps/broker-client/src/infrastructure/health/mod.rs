//! Health and Introspection Endpoint
//!
//! Small HTTP surface over a running [`BrokerClient`].
//!
//! # Endpoints
//!
//! - `GET /health` - session status, state sizes and dispatch counters as JSON
//! - `GET /healthz` - liveness probe
//! - `GET /readyz` - readiness probe, ready only while the broker session is up
//! - `GET /state` - consistent snapshot of orders, positions and market data
//! - `GET /metrics` - Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    BrokerClient, ConnectionHealth, DispatchCounters, StateCounts, StateSnapshot,
};
use crate::domain::connection::ConnectionStatus;
use crate::infrastructure::metrics::get_metrics_handle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// =============================================================================
// Response Types
// =============================================================================

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Derived from the session status.
    pub status: HealthStatus,
    /// Client version.
    pub version: String,
    /// Seconds since the endpoint state was created.
    pub uptime_secs: u64,
    /// When the response was built.
    pub current_time: DateTime<Utc>,
    /// Broker session.
    pub connection: ConnectionHealth,
    /// Sizes of the shared state.
    pub state: StateCounts,
    /// Inbound message counters.
    pub dispatch: DispatchCounters,
    /// Broker errors currently retained.
    pub recent_errors: usize,
}

/// Coarse health derived from the session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Session established.
    Healthy,
    /// Session being (re)established.
    Degraded,
    /// No session.
    Unhealthy,
}

impl From<ConnectionStatus> for HealthStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connected => Self::Healthy,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => Self::Degraded,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed => Self::Unhealthy,
        }
    }
}

impl HealthStatus {
    const fn http_status(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// What the handlers read from.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    client: BrokerClient,
}

impl HealthServerState {
    /// Wrap a client for the handlers.
    #[must_use]
    pub fn new(version: String, client: BrokerClient) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            client,
        }
    }

    fn report(&self) -> HealthResponse {
        let connection = self.client.connection().health();
        HealthResponse {
            status: HealthStatus::from(connection.status),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection,
            state: self.client.state().counts(),
            dispatch: self.client.dispatch_counters(),
            recent_errors: self.client.state().recent_errors().len(),
        }
    }
}

/// HTTP server for the endpoints above.
#[derive(Debug)]
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a server bound to `0.0.0.0:port` once run.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::Bind` if the port is unavailable and
    /// `HealthServerError::Serve` if the accept loop fails.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HealthServerError::Bind {
                port: self.port,
                source,
            })?;
        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(live))
        .route("/readyz", get(ready))
        .route("/state", get(snapshot))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<Arc<HealthServerState>>) -> Response {
    let report = state.report();
    (report.status.http_status(), Json(report)).into_response()
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<HealthServerState>>) -> (StatusCode, &'static str) {
    if state.client.connection().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn snapshot(State(state): State<Arc<HealthServerState>>) -> Json<StateSnapshot> {
    Json(state.client.state().snapshot())
}

async fn prometheus() -> Response {
    match get_metrics_handle() {
        Some(handle) => (
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server failures.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listener could not be bound.
    #[error("failed to bind health port {port}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The accept loop failed.
    #[error("health server failed")]
    Serve(#[source] std::io::Error),
}

// =============================================================================
// Tests
// =============================================================================
