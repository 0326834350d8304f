//! Consumer error types

use std::time::Duration;
use thiserror::Error;

use crate::broker::BrokerError;

/// Errors from consumer and consumer-group lifecycle calls
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consumer config: {0}")]
    InvalidConfig(String),

    /// `start` called on a consumer that is running or was stopped
    #[error("Consumer for queue {0} already started")]
    AlreadyStarted(String),

    #[error("Failed to set QoS for queue {queue}: {source}")]
    Qos {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to start consuming from queue {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// Workers did not finish within the stop timeout; they keep running
    #[error("Consumer for queue {queue} did not stop within {waited:?}")]
    StopTimeout { queue: String, waited: Duration },

    #[error("{failed} of {total} consumers failed to start")]
    GroupStart { failed: usize, total: usize },

    #[error("{failed} of {total} consumers failed to stop")]
    GroupStop { failed: usize, total: usize },
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;
