//! HTTP Surface
//!
//! Health checks, Prometheus metrics and a small JSON API for placing and
//! managing requests.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with queue, restriction and session stats
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (gateway accepting requests)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /requests` - Build and place a request
//! - `GET /requests/{id}` - Status and rows of a request
//! - `DELETE /requests/{id}` - Cancel a request
//! - `POST /requests/{id}/reset` - Reset a request and place it again
//!
//! The API tracks at most `max_tracked` handles. When full, finished
//! handles are forgotten to make room; if every tracked handle is still
//! active, placement is refused with `503`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{Gateway, GatewayError, GatewayStats, HandleSummary, RequestHandle};
use crate::domain::request::{Instrument, Priority, RequestId, RequestParams, Row};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Handles known to the API.
    pub tracked_requests: usize,
    /// Queue, restriction and session statistics.
    pub gateway: GatewayStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Running with every pooled session connected.
    Healthy,
    /// Running with at least one session down.
    Degraded,
    /// Shut down.
    Unhealthy,
}

/// Body of `POST /requests`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaceRequest {
    /// Target instrument.
    pub instrument: Instrument,
    /// Queue priority; lower runs first.
    #[serde(default)]
    pub priority: Priority,
    /// Kind and parameters.
    pub request: RequestParams,
}

/// Request status with its rows.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    /// Handle summary.
    #[serde(flatten)]
    pub summary: HandleSummary,
    /// Queue priority.
    pub priority: Priority,
    /// Result rows, merged across leaves.
    pub rows: Vec<Row>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

// =============================================================================
// Server State
// =============================================================================

struct Tracked {
    handle: Arc<RequestHandle>,
    priority: Priority,
}

/// Shared state for the HTTP server.
pub struct AppState {
    version: String,
    started_at: Instant,
    gateway: Arc<Gateway>,
    handles: RwLock<HashMap<RequestId, Tracked>>,
    max_tracked: usize,
}

impl AppState {
    /// Create server state over `gateway`.
    #[must_use]
    pub fn new(version: String, gateway: Arc<Gateway>, max_tracked: usize) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            gateway,
            handles: RwLock::new(HashMap::new()),
            max_tracked: max_tracked.max(1),
        }
    }

    /// Make room for one more handle, forgetting finished ones if full.
    fn admit(&self) -> Result<(), ApiError> {
        let mut handles = self.handles.write();
        if handles.len() < self.max_tracked {
            return Ok(());
        }
        let before = handles.len();
        handles.retain(|_, t| t.handle.is_active());
        tracing::debug!(evicted = before - handles.len(), remaining = handles.len(), "Forgot finished handles");
        if handles.len() < self.max_tracked {
            Ok(())
        } else {
            Err(ApiError::Full(self.max_tracked))
        }
    }

    fn track(&self, handle: &Arc<RequestHandle>, priority: Priority) {
        self.handles.write().insert(
            handle.id(),
            Tracked {
                handle: Arc::clone(handle),
                priority,
            },
        );
    }

    fn tracked(&self, id: RequestId) -> Result<(Arc<RequestHandle>, Priority), ApiError> {
        self.handles
            .read()
            .get(&id)
            .map(|t| (Arc::clone(&t.handle), t.priority))
            .ok_or(ApiError::NotFound(id))
    }
}

// =============================================================================
// Errors
// =============================================================================

enum ApiError {
    NotFound(RequestId),
    Full(usize),
    Gateway(GatewayError),
    Internal(String),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::NotFound(id) => (StatusCode::NOT_FOUND, format!("unknown request {id}")),
            Self::Full(limit) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{limit} requests already active"),
            ),
            Self::Gateway(err) => {
                let status = match err {
                    GatewayError::Validation(_) | GatewayError::Split(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    GatewayError::Lifecycle(_) => StatusCode::CONFLICT,
                    GatewayError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
                    GatewayError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Build the router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/requests", post(place_handler))
        .route("/requests/{id}", get(get_handler).delete(cancel_handler))
        .route("/requests/{id}/reset", post(reset_handler))
        .with_state(state)
}

/// Health, metrics and request API server.
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
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

async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.gateway.is_running() {
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
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn place_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlaceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.admit()?;
    let handle = Arc::new(state.gateway.request(body.instrument, body.request)?);
    let priority = body.priority;

    // Placement waits for queue room when a capacity is configured.
    let placing = Arc::clone(&handle);
    tokio::task::spawn_blocking(move || placing.place(priority))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    state.track(&handle, priority);
    tracing::info!(handle_id = %handle.id(), kind = handle.params().kind().as_str(), priority, "Request placed over HTTP");
    Ok((StatusCode::CREATED, Json(view(&handle, priority))))
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let (handle, priority) = state.tracked(id)?;
    Ok(Json(view(&handle, priority)))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let (handle, priority) = state.tracked(id)?;
    handle.cancel()?;
    Ok(Json(view(&handle, priority)))
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let (handle, priority) = state.tracked(id)?;
    handle.reset()?;
    let placing = Arc::clone(&handle);
    tokio::task::spawn_blocking(move || placing.place(priority))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(view(&handle, priority)))
}

fn view(handle: &RequestHandle, priority: Priority) -> RequestView {
    RequestView {
        summary: handle.summary(),
        priority,
        rows: handle.data(),
    }
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let gateway = state.gateway.stats();
    let status = determine_health_status(state.gateway.is_running(), &gateway);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        tracked_requests: state.handles.read().len(),
        gateway,
    }
}

fn determine_health_status(running: bool, stats: &GatewayStats) -> HealthStatus {
    if !running {
        return HealthStatus::Unhealthy;
    }
    if stats.sessions.iter().all(|s| s.connected) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Tests
// =============================================================================
