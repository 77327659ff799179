//! API models for the dispatch HTTP endpoints

use common::{DriverId, Location, PassengerId, VehicleType};
use serde::{Deserialize, Serialize};

use crate::dispatcher::RideRequest;
use crate::domain::{CancelledBy, MatchingRequest};
use crate::engine::RetryOutcome;
use crate::error::Result;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// Coordinates as sent by clients; the geo-cell is derived server side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInput {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
}

impl LocationInput {
    pub fn into_location(self) -> Result<Location> {
        Ok(Location::from_coordinates(self.latitude, self.longitude, self.address)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRideRequest {
    pub passenger_id: PassengerId,
    pub pickup: LocationInput,
    pub dropoff: LocationInput,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    #[serde(default)]
    pub payment_method_id: Option<String>,
}

impl CreateRideRequest {
    pub fn into_ride_request(self) -> Result<RideRequest> {
        Ok(RideRequest {
            passenger_id: self.passenger_id,
            pickup: self.pickup.into_location()?,
            dropoff: self.dropoff.into_location()?,
            vehicle_type: self.vehicle_type,
            payment_method_id: self.payment_method_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRideRequest {
    pub reason: String,
    #[serde(default = "default_cancelled_by")]
    pub cancelled_by: CancelledBy,
}

fn default_cancelled_by() -> CancelledBy {
    CancelledBy::Passenger
}

/// Body of every driver action on a ride or an offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverActionRequest {
    pub driver_id: DriverId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRideRequest {
    pub driver_id: DriverId,
    pub distance_meters: f64,
    pub duration_seconds: u64,
    pub total_fare: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRequest {
    pub rating: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub requeued: bool,
    pub reason: Option<String>,
    pub matching_request: Option<MatchingRequest>,
}

impl From<RetryOutcome> for RetryResponse {
    fn from(outcome: RetryOutcome) -> Self {
        match outcome {
            RetryOutcome::Requeued(request) => Self {
                requeued: true,
                reason: None,
                matching_request: Some(request),
            },
            RetryOutcome::Refused { reason } => Self {
                requeued: false,
                reason: Some(reason),
                matching_request: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
