//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::broker::Broker;
use crate::mq::ConsumerGroup;
use crate::websocket::{Authenticator, Manager};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Registry of live WebSocket sessions
    pub manager: Arc<Manager>,
    /// Broker link, probed by the readiness endpoint
    pub broker: Arc<dyn Broker>,
    /// Resolves bearer tokens on upgrade
    pub authenticator: Arc<dyn Authenticator>,
    /// Consumers checked by the readiness endpoint
    pub consumers: Option<Arc<ConsumerGroup>>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        manager: Arc<Manager>,
        broker: Arc<dyn Broker>,
        authenticator: Arc<dyn Authenticator>,
        config: ApiConfig,
    ) -> Self {
        Self {
            manager,
            broker,
            authenticator,
            consumers: None,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Report `consumers` in readiness and health
    pub fn with_consumers(mut self, consumers: Arc<ConsumerGroup>) -> Self {
        self.consumers = Some(consumers);
        self
    }

    /// Names of consumers no longer receiving deliveries
    pub fn stalled_consumers(&self) -> Vec<String> {
        self.consumers
            .as_ref()
            .map(|group| group.stalled())
            .unwrap_or_default()
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get WebSocket session count
    pub async fn ws_session_count(&self) -> usize {
        self.manager.session_count().await
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
