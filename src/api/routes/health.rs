//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (broker link and consumers are up)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Kubernetes readiness probe.
/// 503 while the broker link is down, a consumer has stopped receiving, or
/// the gateway is shutting down.
pub async fn readiness(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    if !state.broker.is_connected() {
        return Err(ApiError::ServiceUnavailable("broker disconnected".into()));
    }
    if state.manager.is_shutting_down() {
        return Err(ApiError::ServiceUnavailable("shutting down".into()));
    }
    let stalled = state.stalled_consumers();
    if !stalled.is_empty() {
        return Err(ApiError::ServiceUnavailable(format!(
            "consumers stalled: {}",
            stalled.join(", ")
        )));
    }
    Ok(StatusCode::OK)
}

/// GET /health
///
/// Full health status with component details.
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker_ok = state.broker.is_connected();
    let stalled_consumers = state.stalled_consumers();
    let healthy = broker_ok && stalled_consumers.is_empty();

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        broker: if broker_ok { "connected" } else { "disconnected" }.to_string(),
        stalled_consumers,
        websocket_sessions: state.ws_session_count().await,
        dropped_messages: state.manager.dropped_messages(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
