//! Data Transfer Objects
//!
//! Response types for the API endpoints.

use serde::{Deserialize, Serialize};

/// Full health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy or degraded
    pub status: String,
    /// Broker link: connected or disconnected
    pub broker: String,
    /// Consumers whose delivery stream has ended
    pub stalled_consumers: Vec<String>,
    /// Live WebSocket sessions
    pub websocket_sessions: usize,
    /// Outbound messages dropped on full session buffers
    pub dropped_messages: u64,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
