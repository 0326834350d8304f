//! WebSocket Gateway
//!
//! Keeps passengers and drivers connected over WebSocket and routes traffic
//! between their sockets and the rest of the application.
//!
//! ## Architecture
//!
//! - **Manager**: registry of live sessions plus the shared inbound and
//!   outbound channels
//! - **Session**: one upgraded socket served by a read pump, a write pump and
//!   an inbound forwarder; closed exactly once
//! - **Auth**: bearer-token middleware resolving the caller's identity before
//!   the upgrade
//! - **Handler**: the axum upgrade entry point
//!
//! ## Keep-alive
//!
//! The server pings every `0.9 × pong_wait`. A client that does not answer
//! with a pong within `pong_wait` is disconnected. Inbound frames above
//! `max_frame_bytes` close the session.
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:8081/ws/passengers');
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log('Ride status:', msg.new_status);
//! };
//! ```

pub mod auth;
mod handler;
mod manager;
mod messages;
#[cfg(test)]
pub(crate) mod mock;
mod session;

pub use auth::{
    require_identity, AuthError, AuthState, Authenticator, Identity, Role,
    StaticTokenAuthenticator,
};
pub use handler::serve_upgrade;
pub use manager::{Manager, WsError};
pub use messages::{Inbound, Outbound, SessionId, WsConfig};
pub use session::Session;
