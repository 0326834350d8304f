//! # Ridehail
//!
//! Resilient communication core for a ride-hailing backend.
//!
//! ## Features
//!
//! - **Self-healing broker link**: AMQP connection with exponential-backoff
//!   reconnection; publishers wait for readiness instead of failing
//! - **Retrying consumers**: worker pools per queue, retry by republish with
//!   a growing delay, dead-lettering once retries run out
//! - **WebSocket gateway**: authenticated sessions with keep-alive, bounded
//!   per-session buffers and exactly-once teardown
//!
//! ## Modules
//!
//! - [`broker`]: Broker trait, AMQP connection, in-memory broker, topology
//! - [`mq`]: Publishers, consumers and event payloads
//! - [`websocket`]: Session manager, upgrade handler and authentication
//! - [`api`]: HTTP router with WebSocket and health endpoints
//! - [`relay`]: Ride status to passengers, driver locations to the fanout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ridehail::broker::{topology, Broker, MemoryBroker};
//! use ridehail::mq::{handler_fn, ConsumerConfig, MessageConsumer, RideEventPublisher};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
//!     topology::declare_topology(broker.as_ref()).await?;
//!
//!     // Consume ride requests with retry and dead-lettering
//!     let consumer = MessageConsumer::new(
//!         Arc::clone(&broker),
//!         ConsumerConfig::new(topology::RIDE_REQUESTS, "matcher").max_retries(3),
//!         Arc::new(handler_fn(|_ctx, message| async move {
//!             println!("ride request {}", message.message_id);
//!             Ok(())
//!         })),
//!     )?;
//!     let ctx = CancellationToken::new();
//!     consumer.start(&ctx).await?;
//!
//!     // Publish a ride request
//!     let rides = RideEventPublisher::new(Arc::clone(&broker));
//!     rides
//!         .publish_ride_request(&ctx, "ECONOMY", &serde_json::json!({"ride_id": "r-1"}))
//!         .await?;
//!
//!     consumer.stop(std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod logging;
pub mod mq;
pub mod relay;
pub mod shutdown;
pub mod websocket;

// Re-export top-level types for convenience
pub use broker::{
    Broker, BrokerConfig, BrokerConnection, BrokerError, BrokerResult, Delivery, Envelope,
    MemoryBroker, ReconnectPolicy,
};

pub use mq::{
    ConsumerConfig, ConsumerError, ConsumerGroup, DriverEventPublisher, LocationEventPublisher,
    Message, MessageConsumer, MessageHandler, MessagePublisher, PublishError,
    RideEventPublisher,
};

pub use websocket::{Identity, Inbound, Manager, Outbound, Role, WsConfig, WsError};

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig};

pub use relay::{LocationRelay, RelayError, RideStatusForwarder};

pub use shutdown::GracefulShutdown;
