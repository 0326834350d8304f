//! WebSocket Handler
//!
//! Upgrade entry point. The caller's identity is resolved by
//! [`require_identity`](super::auth::require_identity) before this handler
//! runs; the handler only performs the upgrade and hands the socket to the
//! [`Manager`](super::Manager).

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{IntoResponse, Response},
    Extension,
};
use std::sync::Arc;

use super::auth::Identity;
use crate::api::{ApiError, AppState};

/// WebSocket upgrade handler
///
/// Rejects with 401 when no verified identity is attached to the request.
pub async fn serve_upgrade(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<Identity>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(Extension(identity)) = identity else {
        return ApiError::Unauthorized.into_response();
    };

    if state.manager.is_shutting_down() {
        return ApiError::ServiceUnavailable("shutting down".into()).into_response();
    }

    let manager = Arc::clone(&state.manager);
    let max_frame = manager.config().max_frame_bytes;

    ws.max_frame_size(max_frame)
        .max_message_size(max_frame)
        .on_upgrade(move |socket| async move {
            let user_id = identity.user_id;
            if let Err(e) = manager.attach(identity, socket).await {
                tracing::warn!(session_id = %user_id, error = %e, "Rejected WebSocket session");
            }
        })
}
