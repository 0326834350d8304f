//! Broker Access
//!
//! Low-level primitives over an AMQP-compatible message broker.
//!
//! ## Architecture
//!
//! - **Broker**: the trait every higher layer (publisher, consumer, topology)
//!   talks to
//! - **BrokerConnection**: the production implementation. Owns one physical
//!   connection and channel, watches for connection loss and reconnects with
//!   exponential backoff
//! - **MemoryBroker**: an in-process implementation with exchanges, bindings,
//!   queues and dead-lettering, used by tests and local runs
//! - **Topology**: the exchanges, queues and bindings declared at deployment
//!
//! Raw connection and channel handles never leave `BrokerConnection`.

mod connection;
mod envelope;
mod error;
mod memory;
mod reconnect;
pub mod topology;

pub use connection::{BrokerConfig, BrokerConnection};
pub use envelope::{
    DeliveryMode, Delivery, Envelope, EnvelopeBuilder, HeaderValue, Headers, JSON_CONTENT_TYPE,
    RETRY_COUNT_HEADER,
};
pub use error::{BrokerError, BrokerResult};
pub use memory::{
    routing_key_matches, DeliveryOutcome, MemoryBroker, PublishRecord, DEFAULT_RECORD_LIMIT,
};
pub use reconnect::{ReconnectOutcome, ReconnectPolicy, Reconnector};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Stream of deliveries for one consumer subscription
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Exchange routing types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Exchange that receives messages rejected without requeue
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Durable queue without dead-lettering
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }

    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Low-level broker primitives
///
/// Topology operations are idempotent and fail with
/// [`BrokerError::Declaration`] on conflicts. `publish` waits for the
/// connection to be ready and returns [`BrokerError::NotReady`] if `cancel`
/// fires first.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn publish(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BrokerResult<()>;

    /// Limit unacknowledged deliveries on the channel
    async fn set_qos(&self, prefetch_count: u16) -> BrokerResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;
}
