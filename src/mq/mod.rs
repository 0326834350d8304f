//! Publish/Consume
//!
//! Business-facing messaging on top of [`crate::broker::Broker`]:
//!
//! - **Publishers** serialise payloads into persistent JSON envelopes and
//!   format routing keys for the ride, driver and location exchanges
//! - **Consumers** run a worker pool per queue with retry-by-republish and
//!   dead-lettering once retries are exhausted
//! - **Events** are the JSON payloads exchanged between services

mod consumer;
mod error;
pub mod events;
mod publisher;

pub use consumer::{
    handler_fn, retry_delay, Consumer, ConsumerConfig, ConsumerGroup, HandlerFn, Message,
    MessageConsumer, MessageHandler,
};
pub use error::{ConsumerError, ConsumerResult};
pub use publisher::{
    DriverEventPublisher, LocationEventPublisher, MessagePublisher, PublishError, PublishResult,
    RideEventPublisher,
};
