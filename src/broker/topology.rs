//! Deployment topology
//!
//! The exchanges, queues and bindings every service expects to exist.
//! Declared once by `ridehail init-topology`; declaring again is a no-op.

use super::{Broker, BrokerResult, ExchangeKind, QueueSpec};

pub const RIDE_TOPIC: &str = "ride_topic";
pub const DRIVER_TOPIC: &str = "driver_topic";
pub const LOCATION_FANOUT: &str = "location_fanout";
pub const DEAD_LETTER_EXCHANGE: &str = "dlx";

pub const RIDE_REQUESTS: &str = "ride_requests";
pub const RIDE_STATUS: &str = "ride_status";
pub const DRIVER_MATCHING: &str = "driver_matching";
pub const DRIVER_RESPONSES: &str = "driver_responses";
pub const DRIVER_STATUS: &str = "driver_status";
pub const LOCATION_UPDATES_RIDE: &str = "location_updates_ride";
pub const LOCATION_UPDATES_ADMIN: &str = "location_updates_admin";
pub const DEAD_LETTERS: &str = "dead_letters";

/// (name, kind); all durable
pub const EXCHANGES: &[(&str, ExchangeKind)] = &[
    (RIDE_TOPIC, ExchangeKind::Topic),
    (DRIVER_TOPIC, ExchangeKind::Topic),
    (LOCATION_FANOUT, ExchangeKind::Fanout),
    (DEAD_LETTER_EXCHANGE, ExchangeKind::Topic),
];

/// Durable work queues that dead-letter to [`DEAD_LETTER_EXCHANGE`]
pub const WORK_QUEUES: &[&str] = &[
    RIDE_REQUESTS,
    RIDE_STATUS,
    DRIVER_MATCHING,
    DRIVER_RESPONSES,
    DRIVER_STATUS,
    LOCATION_UPDATES_RIDE,
    LOCATION_UPDATES_ADMIN,
];

/// (queue, exchange, routing key)
pub const BINDINGS: &[(&str, &str, &str)] = &[
    (RIDE_REQUESTS, RIDE_TOPIC, "ride.request.*"),
    (RIDE_STATUS, RIDE_TOPIC, "ride.status.*"),
    (DRIVER_MATCHING, RIDE_TOPIC, "ride.request.*"),
    (DRIVER_RESPONSES, DRIVER_TOPIC, "driver.response.*"),
    (DRIVER_STATUS, DRIVER_TOPIC, "driver.status.*"),
    (LOCATION_UPDATES_RIDE, LOCATION_FANOUT, ""),
    (LOCATION_UPDATES_ADMIN, LOCATION_FANOUT, ""),
    (DEAD_LETTERS, DEAD_LETTER_EXCHANGE, "#"),
];

/// Declare every exchange, queue and binding.
///
/// Stops at the first failure; the error names the entity.
pub async fn declare_topology(broker: &dyn Broker) -> BrokerResult<()> {
    tracing::info!("Creating exchanges...");
    for (name, kind) in EXCHANGES {
        broker.declare_exchange(name, *kind, true).await?;
        tracing::info!(name = %name, kind = %kind, "Created exchange");
    }

    tracing::info!("Creating queues...");
    for name in WORK_QUEUES {
        broker
            .declare_queue(&QueueSpec::durable(*name).dead_letter_to(DEAD_LETTER_EXCHANGE))
            .await?;
        tracing::info!(name = %name, "Created queue");
    }
    broker.declare_queue(&QueueSpec::durable(DEAD_LETTERS)).await?;
    tracing::info!(name = %DEAD_LETTERS, "Created queue");

    tracing::info!("Creating queue bindings...");
    for (queue, exchange, key) in BINDINGS {
        broker.bind(queue, exchange, key).await?;
        tracing::info!(queue = %queue, exchange = %exchange, key = %key, "Created binding");
    }

    Ok(())
}
