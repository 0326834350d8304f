//! Gateway Relay
//!
//! Glue between the broker and connected clients:
//!
//! - **Ride status**: `ride_status` deliveries are pushed to the passenger's
//!   session as JSON text frames
//! - **Driver locations**: frames from driver sessions become
//!   [`LocationUpdateMessage`]s on the location fanout

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::Broker;
use crate::mq::events::{EntityType, LocationCoordinates, LocationUpdateMessage, RideStatusMessage};
use crate::mq::{
    ConsumerConfig, ConsumerResult, LocationEventPublisher, Message, MessageConsumer,
    MessageHandler, PublishError,
};
use crate::websocket::{Inbound, Manager, Outbound, Role};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("invalid passenger id {0:?}")]
    PassengerId(String),

    #[error("outbound channel closed")]
    OutboundClosed,

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Pushes ride status events to the passenger's session
pub struct RideStatusForwarder {
    outbound: mpsc::Sender<Outbound>,
}

impl RideStatusForwarder {
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self { outbound }
    }

    async fn forward(&self, message: &Message) -> Result<(), RelayError> {
        let status: RideStatusMessage = message.parse_json()?;
        let passenger = Uuid::parse_str(&status.passenger_id)
            .map_err(|_| RelayError::PassengerId(status.passenger_id.clone()))?;

        self.outbound
            .send(Outbound::new(passenger, message.body.clone()))
            .await
            .map_err(|_| RelayError::OutboundClosed)?;

        tracing::debug!(
            ride_id = %status.ride_id,
            passenger_id = %passenger,
            status = %status.new_status,
            "Forwarded ride status"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RideStatusForwarder {
    async fn handle(&self, _ctx: &CancellationToken, message: &Message) -> anyhow::Result<()> {
        self.forward(message).await?;
        Ok(())
    }
}

/// Consumer that feeds `config.queue` into a [`RideStatusForwarder`]
pub fn ride_status_consumer(
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    manager: &Manager,
) -> ConsumerResult<MessageConsumer> {
    let forwarder = RideStatusForwarder::new(manager.outbound());
    MessageConsumer::new(broker, config, Arc::new(forwarder))
}

/// Location report sent by a driver client
#[derive(Debug, Deserialize)]
struct DriverLocationFrame {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    ride_id: Option<String>,
    #[serde(default)]
    accuracy_meters: Option<f64>,
    #[serde(default)]
    speed_kmh: Option<f64>,
    #[serde(default)]
    heading_degrees: Option<f64>,
}

/// Publishes driver location frames to the location fanout
pub struct LocationRelay {
    manager: Arc<Manager>,
    publisher: LocationEventPublisher,
}

impl LocationRelay {
    pub fn new(manager: Arc<Manager>, broker: Arc<dyn Broker>) -> Self {
        Self {
            manager,
            publisher: LocationEventPublisher::new(broker),
        }
    }

    /// Relay inbound frames until the channel ends or `cancel` fires
    pub async fn run(self, mut inbound: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if let Err(e) = self.relay(&cancel, frame).await {
                tracing::warn!(error = %e, "Dropped inbound frame");
            }
        }
        tracing::debug!("Location relay stopped");
    }

    async fn relay(&self, cancel: &CancellationToken, frame: Inbound) -> Result<(), RelayError> {
        let Inbound {
            session_id,
            payload,
        } = frame;

        match self.manager.session(&session_id).await {
            Some(session) if session.role() == Role::Driver => {}
            _ => {
                tracing::debug!(session_id = %session_id, "Ignoring frame from non-driver session");
                return Ok(());
            }
        }

        let report: DriverLocationFrame = serde_json::from_slice(&payload)?;
        let update = LocationUpdateMessage {
            timestamp: Utc::now(),
            entity_id: session_id.to_string(),
            entity_type: EntityType::Driver,
            ride_id: report.ride_id,
            location: LocationCoordinates {
                latitude: report.latitude,
                longitude: report.longitude,
            },
            accuracy: report.accuracy_meters,
            speed: report.speed_kmh,
            heading: report.heading_degrees,
        };

        self.publisher.publish_location_update(cancel, &update).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::topology::{declare_topology, LOCATION_UPDATES_ADMIN, RIDE_STATUS, RIDE_TOPIC};
    use crate::broker::{Envelope, MemoryBroker};
    use crate::mq::RideEventPublisher;
    use crate::websocket::mock::socket_pair;
    use crate::websocket::{Identity, WsConfig};
    use axum::extract::ws::Message as WsMessage;
    use std::time::Duration;

    async fn broker() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        declare_topology(broker.as_ref()).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_ride_status_reaches_passenger() {
        let broker = broker().await;
        let manager = Arc::new(Manager::new(WsConfig::default()));
        manager.start_router().await;

        let passenger = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Passenger,
        };
        let (socket, mut client) = socket_pair(false);
        manager.attach(passenger.clone(), socket).await.unwrap();

        let consumer = ride_status_consumer(
            Arc::clone(&broker) as Arc<dyn Broker>,
            ConsumerConfig::new(RIDE_STATUS, "gateway"),
            &manager,
        )
        .unwrap();
        let ctx = CancellationToken::new();
        consumer.start(&ctx).await.unwrap();

        let status = RideStatusMessage {
            updated_at: Utc::now(),
            metadata: Default::default(),
            ride_id: "ride-1".into(),
            ride_number: "RIDE-001".into(),
            passenger_id: passenger.user_id.to_string(),
            driver_id: Some("driver-1".into()),
            old_status: "REQUESTED".into(),
            new_status: "MATCHED".into(),
            correlation_id: None,
        };
        RideEventPublisher::new(Arc::clone(&broker) as Arc<dyn Broker>)
            .publish_ride_status(&ctx, "MATCHED", &status)
            .await
            .unwrap();

        match client.from_server.recv().await {
            Some(WsMessage::Text(text)) => {
                let received: RideStatusMessage = serde_json::from_str(&text).unwrap();
                assert_eq!(received, status);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        consumer.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_passenger_id_is_an_error() {
        let (outbound, _rx) = mpsc::channel(1);
        let forwarder = RideStatusForwarder::new(outbound);
        let body = serde_json::json!({
            "updated_at": Utc::now(),
            "ride_id": "ride-1",
            "passenger_id": "not-a-uuid",
            "new_status": "MATCHED",
        });
        let envelope = Envelope::json(&body).unwrap().build();
        let message = Message {
            correlation_id: envelope.correlation_id().to_string(),
            message_id: envelope.message_id().to_string(),
            timestamp: envelope.timestamp(),
            routing_key: "ride.status.MATCHED".into(),
            headers: envelope.headers().clone(),
            body: envelope.body().to_vec(),
            retry_count: 0,
            redelivered: false,
            delivery_tag: 1,
        };

        let err = forwarder.forward(&message).await.unwrap_err();
        assert!(matches!(err, RelayError::PassengerId(id) if id == "not-a-uuid"));
    }

    #[tokio::test]
    async fn test_driver_frames_are_published() {
        let broker = broker().await;
        let manager = Arc::new(Manager::new(WsConfig::default()));
        let inbound = manager.take_inbound().await.unwrap();

        let driver = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Driver,
        };
        let passenger = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Passenger,
        };
        let (driver_socket, driver_client) = socket_pair(false);
        let (passenger_socket, passenger_client) = socket_pair(false);
        manager.attach(driver.clone(), driver_socket).await.unwrap();
        manager.attach(passenger, passenger_socket).await.unwrap();

        let cancel = CancellationToken::new();
        let relay = LocationRelay::new(Arc::clone(&manager), Arc::clone(&broker) as Arc<dyn Broker>);
        let task = tokio::spawn(relay.run(inbound, cancel.clone()));

        passenger_client
            .to_server
            .send(Ok(WsMessage::Text(r#"{"latitude":1.0,"longitude":2.0}"#.into())))
            .unwrap();
        driver_client
            .to_server
            .send(Ok(WsMessage::Text("not json".into())))
            .unwrap();
        driver_client
            .to_server
            .send(Ok(WsMessage::Text(
                r#"{"latitude":43.238,"longitude":76.889,"ride_id":"ride-1","speed_kmh":40.0}"#.into(),
            )))
            .unwrap();

        while broker.queue_depth(LOCATION_UPDATES_ADMIN).await == 0 {
            tokio::task::yield_now().await;
        }
        let delivered = broker.drain_queue(LOCATION_UPDATES_ADMIN).await;
        assert_eq!(delivered.len(), 1);

        let update: LocationUpdateMessage = serde_json::from_slice(delivered[0].body()).unwrap();
        assert_eq!(update.entity_id, driver.user_id.to_string());
        assert_eq!(update.entity_type, EntityType::Driver);
        assert_eq!(update.ride_id.as_deref(), Some("ride-1"));
        assert_eq!(update.speed, Some(40.0));

        let published = broker.published().await;
        assert!(published.iter().all(|record| record.exchange != RIDE_TOPIC));

        cancel.cancel();
        task.await.unwrap();
    }
}
