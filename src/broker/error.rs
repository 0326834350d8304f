//! Broker error types
//!
//! Defines all errors that can occur while talking to the message broker.

use thiserror::Error;

/// Errors that can occur in the broker layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable or connection handshake failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel-level failure (publish, consume, ack, qos)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Topology declaration conflicted with existing state
    #[error("Declaration of {entity} failed: {reason}")]
    Declaration { entity: String, reason: String },

    /// Exchange or queue does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller gave up waiting for the connection to become ready
    #[error("Connection not ready")]
    NotReady,

    /// Operation attempted after `close`
    #[error("Connection closed")]
    Closed,

    /// Ack/nack/reject for a tag the channel does not know
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
}

impl BrokerError {
    pub fn declaration(entity: impl Into<String>, reason: impl ToString) -> Self {
        BrokerError::Declaration {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is a transport condition that reconnection can fix
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Channel(_) | BrokerError::NotReady
        )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Channel(err.to_string())
    }
}

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
