//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint reporting the ticker connection and exposing Prometheus
//! metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of the ticker connection
//! - `GET /healthz` - Liveness check (simple OK)
//! - `GET /readyz` - Readiness check (socket open)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::kite::client::{ClientStatus, TickerClient};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Ticker connection.
    pub ticker: TickerInfo,
    /// Broadcast receivers.
    pub consumers: ConsumerInfo,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Socket open and receiving.
    Healthy,
    /// Socket down but recovering.
    Degraded,
    /// Socket down with no recovery scheduled.
    Unhealthy,
}

/// Ticker connection status.
#[derive(Debug, Clone, Serialize)]
pub struct TickerInfo {
    /// Connection state name.
    pub state: &'static str,
    /// Whether the socket is open.
    pub connected: bool,
    /// Reconnect attempts in the current cycle.
    pub reconnect_attempts: u32,
    /// Whether the reconnect budget ran out.
    pub reconnect_exhausted: bool,
    /// Time of the last inbound frame.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Milliseconds since the last inbound frame.
    pub last_message_age_ms: Option<u64>,
    /// Desired subscription count.
    pub subscriptions: usize,
}

impl From<&ClientStatus> for TickerInfo {
    fn from(status: &ClientStatus) -> Self {
        Self {
            state: status.state.as_str(),
            connected: status.state.is_open(),
            reconnect_attempts: status.reconnect_attempts,
            reconnect_exhausted: status.reconnect_exhausted,
            last_message_at: status.last_message_at,
            last_message_age_ms: status
                .last_message_age
                .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
            subscriptions: status.subscriptions,
        }
    }
}

/// Downstream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    /// Tick channel receivers.
    pub tick_receivers: usize,
    /// Event channel receivers.
    pub event_receivers: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    client: TickerClient,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, client: TickerClient) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            client,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Routes served by the health server.
    #[must_use]
    pub fn router(state: Arc<HealthServerState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Self::router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.client.connection_state().is_open() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let ticker = TickerInfo::from(&state.client.status());
    let stats = state.client.publisher().stats();

    HealthResponse {
        status: determine_health_status(&ticker),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        ticker,
        consumers: ConsumerInfo {
            tick_receivers: stats.tick_receivers,
            event_receivers: stats.event_receivers,
        },
    }
}

const fn determine_health_status(ticker: &TickerInfo) -> HealthStatus {
    if ticker.connected {
        HealthStatus::Healthy
    } else if ticker.reconnect_exhausted {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::session::ConnectionState;

    fn status(state: ConnectionState, exhausted: bool) -> ClientStatus {
        ClientStatus {
            state,
            reconnect_attempts: if exhausted { 10 } else { 0 },
            reconnect_exhausted: exhausted,
            last_message_at: None,
            last_message_age: Some(Duration::from_millis(1500)),
            subscriptions: 2,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn ticker_info_from_status() {
        let info = TickerInfo::from(&status(ConnectionState::Open, false));
        assert_eq!(info.state, "open");
        assert!(info.connected);
        assert_eq!(info.last_message_age_ms, Some(1500));
        assert_eq!(info.subscriptions, 2);
    }

    #[test]
    fn status_follows_connection() {
        let open = TickerInfo::from(&status(ConnectionState::Open, false));
        let retrying = TickerInfo::from(&status(ConnectionState::Disconnected, false));
        let exhausted = TickerInfo::from(&status(ConnectionState::Disconnected, true));

        assert_eq!(determine_health_status(&open), HealthStatus::Healthy);
        assert_eq!(determine_health_status(&retrying), HealthStatus::Degraded);
        assert_eq!(determine_health_status(&exhausted), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn health_endpoint_reports_disconnected_client() {
        let client = TickerClient::builder().build();
        let state = Arc::new(HealthServerState::new("test".to_string(), client));
        let response = build_health_response(&state);

        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.ticker.state, "disconnected");
        assert_eq!(response.version, "test");

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["ticker"]["connected"], false);
    }
}
