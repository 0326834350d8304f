//! Publishers
//!
//! [`MessagePublisher`] serialises a payload, wraps it in a persistent JSON
//! envelope and hands it to the broker. The ride, driver and location
//! publishers only format routing keys on top of it. Nothing here retries.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::broker::topology::{DRIVER_TOPIC, LOCATION_FANOUT, RIDE_TOPIC};
use crate::broker::{Broker, BrokerError, DeliveryMode, Envelope};

use super::events::{Metadata, RideStatusMessage};

/// Errors returned by publish calls
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to marshal message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish message: {0}")]
    Transport(#[from] BrokerError),
}

pub type PublishResult = Result<(), PublishError>;

/// Publishes JSON payloads to any exchange
#[derive(Clone)]
pub struct MessagePublisher {
    broker: Arc<dyn Broker>,
}

impl MessagePublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish with a freshly generated correlation id
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> PublishResult {
        let envelope = Envelope::json(payload)?
            .delivery_mode(DeliveryMode::Persistent)
            .build();
        self.send(cancel, exchange, routing_key, envelope).await
    }

    /// Publish keeping the caller's correlation id
    pub async fn publish_with_correlation_id<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        correlation_id: &str,
        payload: &T,
    ) -> PublishResult {
        let envelope = Envelope::json(payload)?
            .correlation_id(correlation_id)
            .delivery_mode(DeliveryMode::Persistent)
            .build();
        self.send(cancel, exchange, routing_key, envelope).await
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> PublishResult {
        if let Err(e) = self
            .broker
            .publish(cancel, exchange, routing_key, &envelope)
            .await
        {
            tracing::error!(
                exchange = %exchange,
                routing_key = %routing_key,
                correlation_id = %envelope.correlation_id(),
                error = %e,
                "Failed to publish message"
            );
            return Err(e.into());
        }

        tracing::debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            correlation_id = %envelope.correlation_id(),
            message_id = %envelope.message_id(),
            "Message published"
        );
        Ok(())
    }
}

/// Ride events on `ride_topic`
#[derive(Clone)]
pub struct RideEventPublisher {
    publisher: MessagePublisher,
}

impl RideEventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            publisher: MessagePublisher::new(broker),
        }
    }

    /// `ride.request.{ride_type}`
    pub async fn publish_ride_request<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        ride_type: &str,
        message: &T,
    ) -> PublishResult {
        let routing_key = format!("ride.request.{}", ride_type);
        self.publisher
            .publish(cancel, RIDE_TOPIC, &routing_key, message)
            .await
    }

    /// `ride.status.{status}`
    pub async fn publish_ride_status<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        status: &str,
        message: &T,
    ) -> PublishResult {
        let routing_key = format!("ride.status.{}", status);
        self.publisher
            .publish(cancel, RIDE_TOPIC, &routing_key, message)
            .await
    }

    pub async fn publish_ride_status_with_correlation<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        status: &str,
        correlation_id: &str,
        message: &T,
    ) -> PublishResult {
        let routing_key = format!("ride.status.{}", status);
        self.publisher
            .publish_with_correlation_id(cancel, RIDE_TOPIC, &routing_key, correlation_id, message)
            .await
    }

    /// Build and publish a [`RideStatusMessage`] for `ride_id`
    pub async fn publish_ride_status_update(
        &self,
        cancel: &CancellationToken,
        ride_id: &str,
        status: &str,
        driver_id: Option<&str>,
    ) -> PublishResult {
        let message = status_update(ride_id, status, driver_id, None);
        self.publish_ride_status(cancel, status, &message).await
    }

    pub async fn publish_ride_status_update_with_correlation(
        &self,
        cancel: &CancellationToken,
        ride_id: &str,
        status: &str,
        driver_id: Option<&str>,
        correlation_id: &str,
    ) -> PublishResult {
        let message = status_update(ride_id, status, driver_id, Some(correlation_id));
        self.publish_ride_status_with_correlation(cancel, status, correlation_id, &message)
            .await
    }
}

fn status_update(
    ride_id: &str,
    status: &str,
    driver_id: Option<&str>,
    correlation_id: Option<&str>,
) -> RideStatusMessage {
    RideStatusMessage {
        updated_at: Utc::now(),
        metadata: Metadata::new(),
        ride_id: ride_id.to_string(),
        ride_number: String::new(),
        passenger_id: String::new(),
        driver_id: driver_id.map(str::to_string),
        old_status: String::new(),
        new_status: status.to_string(),
        correlation_id: correlation_id.map(str::to_string),
    }
}

/// Driver events on `driver_topic`
#[derive(Clone)]
pub struct DriverEventPublisher {
    publisher: MessagePublisher,
}

impl DriverEventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            publisher: MessagePublisher::new(broker),
        }
    }

    /// `driver.response.{ride_id}`
    pub async fn publish_driver_response<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        ride_id: &str,
        message: &T,
    ) -> PublishResult {
        let routing_key = format!("driver.response.{}", ride_id);
        self.publisher
            .publish(cancel, DRIVER_TOPIC, &routing_key, message)
            .await
    }

    /// `driver.status.{driver_id}`
    pub async fn publish_driver_status<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        driver_id: &str,
        message: &T,
    ) -> PublishResult {
        let routing_key = format!("driver.status.{}", driver_id);
        self.publisher
            .publish(cancel, DRIVER_TOPIC, &routing_key, message)
            .await
    }

    pub async fn publish_driver_status_with_correlation<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        driver_id: &str,
        correlation_id: &str,
        message: &T,
    ) -> PublishResult {
        let routing_key = format!("driver.status.{}", driver_id);
        self.publisher
            .publish_with_correlation_id(cancel, DRIVER_TOPIC, &routing_key, correlation_id, message)
            .await
    }
}

/// Location updates on `location_fanout` (empty routing key)
#[derive(Clone)]
pub struct LocationEventPublisher {
    publisher: MessagePublisher,
}

impl LocationEventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            publisher: MessagePublisher::new(broker),
        }
    }

    pub async fn publish_location_update<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        message: &T,
    ) -> PublishResult {
        self.publisher
            .publish(cancel, LOCATION_FANOUT, "", message)
            .await
    }

    pub async fn publish_location_update_with_correlation<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        correlation_id: &str,
        message: &T,
    ) -> PublishResult {
        self.publisher
            .publish_with_correlation_id(cancel, LOCATION_FANOUT, "", correlation_id, message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::topology::{declare_topology, DRIVER_STATUS, LOCATION_UPDATES_ADMIN};
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use std::collections::HashMap;

    async fn broker() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        declare_topology(broker.as_ref()).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_builds_persistent_json_envelope() {
        let broker = broker().await;
        let publisher = MessagePublisher::new(broker.clone());

        publisher
            .publish(&CancellationToken::new(), RIDE_TOPIC, "ride.request.economy", &json!({"ride_id": "r-1"}))
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        let envelope = &published[0].envelope;
        assert_eq!(envelope.content_type(), "application/json");
        assert!(envelope.is_persistent());
        assert!(!envelope.correlation_id().is_empty());
        assert_eq!(envelope.retry_count(), 0);
        assert_eq!(envelope.body(), br#"{"ride_id":"r-1"}"#);
    }

    #[tokio::test]
    async fn test_correlation_id_is_preserved() {
        let broker = broker().await;
        let drivers = DriverEventPublisher::new(broker.clone());

        drivers
            .publish_driver_status_with_correlation(
                &CancellationToken::new(),
                "d-9",
                "corr-123",
                &json!({"driver_id": "d-9"}),
            )
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published[0].routing_key, "driver.status.d-9");
        assert_eq!(published[0].envelope.correlation_id(), "corr-123");
        assert_eq!(broker.queue_depth(DRIVER_STATUS).await, 1);
    }

    #[tokio::test]
    async fn test_routing_key_formats() {
        let broker = broker().await;
        let cancel = CancellationToken::new();
        let body = json!({});

        let rides = RideEventPublisher::new(broker.clone());
        rides.publish_ride_request(&cancel, "premium", &body).await.unwrap();
        rides
            .publish_ride_status_update(&cancel, "r-1", "MATCHED", Some("d-1"))
            .await
            .unwrap();
        DriverEventPublisher::new(broker.clone())
            .publish_driver_response(&cancel, "r-1", &body)
            .await
            .unwrap();
        LocationEventPublisher::new(broker.clone())
            .publish_location_update(&cancel, &body)
            .await
            .unwrap();

        let keys: Vec<(String, String)> = broker
            .published()
            .await
            .into_iter()
            .map(|r| (r.exchange, r.routing_key))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("ride_topic".to_string(), "ride.request.premium".to_string()),
                ("ride_topic".to_string(), "ride.status.MATCHED".to_string()),
                ("driver_topic".to_string(), "driver.response.r-1".to_string()),
                ("location_fanout".to_string(), String::new()),
            ]
        );
        assert_eq!(broker.queue_depth(LOCATION_UPDATES_ADMIN).await, 1);
    }

    #[tokio::test]
    async fn test_status_update_payload() {
        let broker = broker().await;
        RideEventPublisher::new(broker.clone())
            .publish_ride_status_update_with_correlation(
                &CancellationToken::new(),
                "r-5",
                "COMPLETED",
                None,
                "corr-5",
            )
            .await
            .unwrap();

        let published = broker.published().await;
        let msg: RideStatusMessage = serde_json::from_slice(published[0].envelope.body()).unwrap();
        assert_eq!(msg.ride_id, "r-5");
        assert_eq!(msg.new_status, "COMPLETED");
        assert_eq!(msg.driver_id, None);
        assert_eq!(msg.correlation_id.as_deref(), Some("corr-5"));
        assert_eq!(published[0].envelope.correlation_id(), "corr-5");
    }

    #[tokio::test]
    async fn test_serialization_error_is_surfaced() {
        let broker = broker().await;
        let publisher = MessagePublisher::new(broker.clone());

        // non-string map keys cannot be JSON object keys
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let err = publisher
            .publish(&CancellationToken::new(), RIDE_TOPIC, "ride.status.x", &bad)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Serialization(_)));
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let broker = broker().await;
        broker.fail_next_publishes(1).await;

        let err = MessagePublisher::new(broker.clone())
            .publish(&CancellationToken::new(), RIDE_TOPIC, "ride.status.x", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Transport(BrokerError::Channel(_))));
    }
}
