//! Event payloads
//!
//! JSON bodies carried on the ride, driver and location exchanges.
//! Optional fields are omitted from the JSON when unset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form event metadata
pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub rating: f64,
}

/// Published on `ride.request.{vehicle_type}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequestMessage {
    pub requested_at: DateTime<Utc>,
    pub ride_id: String,
    pub ride_number: String,
    pub passenger_id: String,
    pub vehicle_type: String,
    pub pickup_location: LocationCoordinates,
    pub destination_location: LocationCoordinates,
    pub max_distance_km: f64,
    pub timeout_seconds: u32,
    pub correlation_id: String,
    pub estimated_fare: f64,
}

/// Published on `ride.status.{status}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideStatusMessage {
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub ride_id: String,
    #[serde(default)]
    pub ride_number: String,
    #[serde(default)]
    pub passenger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub old_status: String,
    pub new_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Published on `driver.response.{ride_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponseMessage {
    pub responded_at: DateTime<Utc>,
    pub ride_id: String,
    pub driver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_arrival_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_arrival: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_location: Option<LocationCoordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_info: Option<DriverInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub accepted: bool,
}

/// Published on `driver.status.{driver_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStatusMessage {
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub driver_id: String,
    pub old_status: String,
    pub new_status: String,
}

/// Whose position a location update describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Driver,
    Passenger,
}

/// Published on the location fanout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdateMessage {
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<String>,
    pub location: LocationCoordinates,
    #[serde(
        rename = "accuracy_meters",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub accuracy: Option<f64>,
    #[serde(rename = "speed_kmh", default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(
        rename = "heading_degrees",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub heading: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideMatchedMessage {
    pub estimated_arrival: DateTime<Utc>,
    pub matched_at: DateTime<Utc>,
    pub ride_id: String,
    pub ride_number: String,
    pub passenger_id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub vehicle_type: String,
    pub vehicle_make: String,
    pub vehicle_model: String,
    pub vehicle_color: String,
    pub vehicle_plate: String,
    pub driver_rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_location: Option<LocationCoordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideCompletedMessage {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub ride_id: String,
    pub ride_number: String,
    pub passenger_id: String,
    pub driver_id: String,
    #[serde(rename = "duration_minutes")]
    pub duration: u32,
    #[serde(rename = "distance_km")]
    pub distance: f64,
    pub estimated_fare: f64,
    pub final_fare: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideCancelledMessage {
    pub cancelled_at: DateTime<Utc>,
    pub ride_id: String,
    pub ride_number: String,
    pub passenger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    pub cancelled_by: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_fee: Option<f64>,
}
