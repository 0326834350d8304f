//! WebSocket Routing Types
//!
//! Envelopes exchanged between sessions and the application over the
//! manager's shared channels, and the session settings.

use std::time::Duration;
use uuid::Uuid;

/// Session identifier; the authenticated user's id
pub type SessionId = Uuid;

/// A frame read from a client, tagged with the session that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

/// A payload the application wants delivered to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

impl Outbound {
    pub fn new(session_id: SessionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            session_id,
            payload: payload.into(),
        }
    }

    /// Serialize `message` as the JSON payload for `session_id`
    pub fn json<T: serde::Serialize>(
        session_id: SessionId,
        message: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(session_id, serde_json::to_vec(message)?))
    }
}

/// Session keep-alive and buffering settings
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Time allowed between pongs before the client is dropped
    pub pong_wait: Duration,
    /// Deadline for a single frame write
    pub write_wait: Duration,
    /// Largest accepted inbound frame
    pub max_frame_bytes: usize,
    /// Capacity of each session's inbound and outbound buffers
    pub session_buffer: usize,
    /// Capacity of the shared inbound and outbound channels
    pub routing_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(10),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 512,
            session_buffer: 256,
            routing_buffer: 1024,
        }
    }
}

impl WsConfig {
    /// Ping period, 9/10 of `pong_wait`
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}
