//! Gateway HTTP API
//!
//! HTTP layer for the ride-hailing gateway, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /ws` - Any authenticated user
//! - `GET /ws/passengers` - Passengers only
//! - `GET /ws/drivers` - Drivers only
//!
//! Upgrades require `Authorization: Bearer <token>`.
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe (503 while the broker is down)
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use ridehail::api::{serve, ApiConfig, AppState};
//! use ridehail::broker::MemoryBroker;
//! use ridehail::websocket::{Manager, StaticTokenAuthenticator, WsConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Arc::new(Manager::new(WsConfig::default()));
//!     let broker = Arc::new(MemoryBroker::new());
//!     let auth = Arc::new(StaticTokenAuthenticator::default());
//!     let config = ApiConfig::default();
//!
//!     let state = AppState::new(manager, broker, auth, config.clone());
//!     serve(state, &config, ridehail::shutdown::shutdown_signal()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{middleware, routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::websocket::{require_identity, serve_upgrade, AuthState, Role};

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let auth = AuthState::new(Arc::clone(&state.authenticator));

    let ws_routes = Router::new()
        .route(
            "/",
            get(serve_upgrade)
                .route_layer(middleware::from_fn_with_state(auth.clone(), require_identity)),
        )
        .route(
            "/passengers",
            get(serve_upgrade).route_layer(middleware::from_fn_with_state(
                auth.clone().require_role(Role::Passenger),
                require_identity,
            )),
        )
        .route(
            "/drivers",
            get(serve_upgrade).route_layer(middleware::from_fn_with_state(
                auth.require_role(Role::Driver),
                require_identity,
            )),
        );

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/ws", ws_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on {}", addr);
    serve_listener(state, listener, shutdown).await
}

/// Serve the API on an already bound listener
pub async fn serve_listener<F>(
    state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Gateway HTTP server shut down gracefully");
    Ok(())
}
