//! Outbound domain events
//!
//! Every event is keyed by ride id so consumers see one ride's events in order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{DriverId, Location, PassengerId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    CancelledBy, DriverCall, DriverCallStatus, MatchingRequest, Ride, RideStateTransition,
    RideStatus,
};

pub mod topics {
    pub const RIDE_REQUESTED: &str = "ride-requested";
    pub const RIDE_MATCHED: &str = "ride-matched";
    pub const RIDE_STATUS_CHANGED: &str = "ride-status-changed";
    pub const RIDE_CANCELLED: &str = "ride-cancelled";
    pub const RIDE_COMPLETED: &str = "ride-completed";
    pub const DRIVER_CALL_REQUEST: &str = "driver-call-request";
    pub const DRIVER_CALL_STATUS_CHANGED: &str = "driver-call-status-changed";
    pub const MATCHING_REQUEST_CREATED: &str = "matching-request-created";
    pub const MATCHING_SUCCESS: &str = "matching-success";
    pub const MATCHING_FAILED: &str = "matching-failed";
    pub const MATCHING_REQUEST_EXPIRED: &str = "matching-request-expired";

    pub const ALL: [&str; 11] = [
        RIDE_REQUESTED,
        RIDE_MATCHED,
        RIDE_STATUS_CHANGED,
        RIDE_CANCELLED,
        RIDE_COMPLETED,
        DRIVER_CALL_REQUEST,
        DRIVER_CALL_STATUS_CHANGED,
        MATCHING_REQUEST_CREATED,
        MATCHING_SUCCESS,
        MATCHING_FAILED,
        MATCHING_REQUEST_EXPIRED,
    ];

    /// Dead-letter topic mirroring `topic`
    pub fn dead_letter(topic: &str) -> String {
        format!("{}-dlq", topic)
    }

    pub fn is_known(topic: &str) -> bool {
        ALL.contains(&topic)
    }
}

/// One entry of a `driver-call-request` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferedCall {
    pub call_id: Uuid,
    pub driver_id: DriverId,
    pub sequence_number: u32,
    pub expires_at: DateTime<Utc>,
    pub estimated_arrival_seconds: Option<u32>,
    pub estimated_fare: Option<f64>,
}

impl From<&DriverCall> for OfferedCall {
    fn from(call: &DriverCall) -> Self {
        Self {
            call_id: call.id,
            driver_id: call.driver_id,
            sequence_number: call.sequence_number,
            expires_at: call.expires_at,
            estimated_arrival_seconds: call.estimated_arrival_seconds,
            estimated_fare: call.estimated_fare,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    RideRequested {
        ride_id: Uuid,
        passenger_id: PassengerId,
        pickup: Location,
        dropoff: Location,
        pickup_cell: String,
        requested_at: DateTime<Utc>,
        estimated_fare: f64,
        surge_multiplier: f64,
    },

    RideMatched {
        ride_id: Uuid,
        passenger_id: PassengerId,
        driver_id: DriverId,
        matched_at: DateTime<Utc>,
        estimated_arrival_seconds: Option<u32>,
        driver_location: Option<Location>,
    },

    RideStatusChanged {
        ride_id: Uuid,
        passenger_id: PassengerId,
        driver_id: Option<DriverId>,
        previous_status: Option<RideStatus>,
        new_status: RideStatus,
        changed_at: DateTime<Utc>,
        metadata: BTreeMap<String, String>,
    },

    RideCancelled {
        ride_id: Uuid,
        passenger_id: PassengerId,
        driver_id: Option<DriverId>,
        reason: String,
        cancelled_by: CancelledBy,
        cancelled_at: DateTime<Utc>,
    },

    RideCompleted {
        ride_id: Uuid,
        passenger_id: PassengerId,
        driver_id: Option<DriverId>,
        distance_meters: f64,
        duration_seconds: u64,
        total_fare: f64,
        currency: String,
        completed_at: DateTime<Utc>,
    },

    DriverCallRequest {
        ride_id: Uuid,
        calls: Vec<OfferedCall>,
    },

    DriverCallStatusChanged {
        ride_id: Uuid,
        call_id: Uuid,
        driver_id: DriverId,
        status: DriverCallStatus,
        changed_at: DateTime<Utc>,
    },

    MatchingRequestCreated {
        request_id: Uuid,
        ride_id: Uuid,
        pickup_cell: String,
        dropoff_cell: String,
        surge_multiplier: f64,
        retry_count: u32,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },

    MatchingSuccess {
        request_id: Uuid,
        ride_id: Uuid,
        batch_id: Uuid,
        pickup_cell: String,
        top_driver_id: DriverId,
        top_score: f64,
        candidates_offered: usize,
        processed_at: DateTime<Utc>,
    },

    MatchingFailed {
        request_id: Uuid,
        ride_id: Uuid,
        batch_id: Option<Uuid>,
        pickup_cell: String,
        reason: String,
        retry_count: u32,
        failed_at: DateTime<Utc>,
    },

    MatchingRequestExpired {
        request_id: Option<Uuid>,
        ride_id: Uuid,
        pickup_cell: String,
        retry_count: u32,
        expired_at: DateTime<Utc>,
    },
}

impl DispatchEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DispatchEvent::RideRequested { .. } => topics::RIDE_REQUESTED,
            DispatchEvent::RideMatched { .. } => topics::RIDE_MATCHED,
            DispatchEvent::RideStatusChanged { .. } => topics::RIDE_STATUS_CHANGED,
            DispatchEvent::RideCancelled { .. } => topics::RIDE_CANCELLED,
            DispatchEvent::RideCompleted { .. } => topics::RIDE_COMPLETED,
            DispatchEvent::DriverCallRequest { .. } => topics::DRIVER_CALL_REQUEST,
            DispatchEvent::DriverCallStatusChanged { .. } => topics::DRIVER_CALL_STATUS_CHANGED,
            DispatchEvent::MatchingRequestCreated { .. } => topics::MATCHING_REQUEST_CREATED,
            DispatchEvent::MatchingSuccess { .. } => topics::MATCHING_SUCCESS,
            DispatchEvent::MatchingFailed { .. } => topics::MATCHING_FAILED,
            DispatchEvent::MatchingRequestExpired { .. } => topics::MATCHING_REQUEST_EXPIRED,
        }
    }

    /// Partition key
    pub fn ride_id(&self) -> Uuid {
        match self {
            DispatchEvent::RideRequested { ride_id, .. }
            | DispatchEvent::RideMatched { ride_id, .. }
            | DispatchEvent::RideStatusChanged { ride_id, .. }
            | DispatchEvent::RideCancelled { ride_id, .. }
            | DispatchEvent::RideCompleted { ride_id, .. }
            | DispatchEvent::DriverCallRequest { ride_id, .. }
            | DispatchEvent::DriverCallStatusChanged { ride_id, .. }
            | DispatchEvent::MatchingRequestCreated { ride_id, .. }
            | DispatchEvent::MatchingSuccess { ride_id, .. }
            | DispatchEvent::MatchingFailed { ride_id, .. }
            | DispatchEvent::MatchingRequestExpired { ride_id, .. } => *ride_id,
        }
    }

    pub fn ride_requested(ride: &Ride) -> Self {
        DispatchEvent::RideRequested {
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            pickup: ride.pickup.clone(),
            dropoff: ride.dropoff.clone(),
            pickup_cell: ride.pickup.geo_cell().to_string(),
            requested_at: ride.requested_at,
            estimated_fare: ride.fare.estimated(),
            surge_multiplier: ride.fare.surge_multiplier(),
        }
    }

    pub fn status_changed(ride: &Ride, transition: &RideStateTransition) -> Self {
        DispatchEvent::RideStatusChanged {
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            driver_id: ride.driver_id,
            previous_status: transition.from_status,
            new_status: transition.to_status,
            changed_at: transition.occurred_at,
            metadata: transition.metadata.clone(),
        }
    }

    /// One `ride-status-changed` per audit record appended after the first `seen` records
    pub fn transitions_since(ride: &Ride, seen: usize) -> Vec<Self> {
        ride.transitions
            .iter()
            .skip(seen)
            .map(|t| Self::status_changed(ride, t))
            .collect()
    }

    pub fn ride_matched(ride: &Ride, driver_id: DriverId, call: &DriverCall) -> Self {
        DispatchEvent::RideMatched {
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            driver_id,
            matched_at: ride.matched_at.unwrap_or(call.offered_at),
            estimated_arrival_seconds: call.estimated_arrival_seconds,
            driver_location: Some(call.driver_location.clone()),
        }
    }

    pub fn ride_cancelled(ride: &Ride, reason: &str, cancelled_by: CancelledBy, at: DateTime<Utc>) -> Self {
        DispatchEvent::RideCancelled {
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            driver_id: ride.driver_id,
            reason: reason.to_string(),
            cancelled_by,
            cancelled_at: at,
        }
    }

    pub fn ride_completed(ride: &Ride, distance_meters: f64, duration_seconds: u64, total_fare: f64, at: DateTime<Utc>) -> Self {
        DispatchEvent::RideCompleted {
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            driver_id: ride.driver_id,
            distance_meters,
            duration_seconds,
            total_fare,
            currency: ride.fare.currency().to_string(),
            completed_at: at,
        }
    }

    pub fn driver_call_request(ride_id: Uuid, calls: &[DriverCall]) -> Self {
        DispatchEvent::DriverCallRequest {
            ride_id,
            calls: calls.iter().map(OfferedCall::from).collect(),
        }
    }

    pub fn call_status_changed(call: &DriverCall) -> Self {
        DispatchEvent::DriverCallStatusChanged {
            ride_id: call.ride_id,
            call_id: call.id,
            driver_id: call.driver_id,
            status: call.status,
            changed_at: call.responded_at.unwrap_or(call.offered_at),
        }
    }

    pub fn request_created(request: &MatchingRequest) -> Self {
        DispatchEvent::MatchingRequestCreated {
            request_id: request.id,
            ride_id: request.ride_id,
            pickup_cell: request.pickup_cell.clone(),
            dropoff_cell: request.dropoff_cell.clone(),
            surge_multiplier: request.surge_multiplier,
            retry_count: request.retry_count,
            requested_at: request.requested_at,
            expires_at: request.expires_at,
        }
    }

    pub fn matching_failed(request: &MatchingRequest, batch_id: Option<Uuid>, reason: &str, now: DateTime<Utc>) -> Self {
        DispatchEvent::MatchingFailed {
            request_id: request.id,
            ride_id: request.ride_id,
            batch_id,
            pickup_cell: request.pickup_cell.clone(),
            reason: reason.to_string(),
            retry_count: request.retry_count,
            failed_at: now,
        }
    }

    pub fn matching_success(
        request: &MatchingRequest,
        batch_id: Uuid,
        top_driver_id: DriverId,
        top_score: f64,
        candidates_offered: usize,
        now: DateTime<Utc>,
    ) -> Self {
        DispatchEvent::MatchingSuccess {
            request_id: request.id,
            ride_id: request.ride_id,
            batch_id,
            pickup_cell: request.pickup_cell.clone(),
            top_driver_id,
            top_score,
            candidates_offered,
            processed_at: now,
        }
    }

    pub fn request_expired(ride: &Ride, request: Option<&MatchingRequest>, now: DateTime<Utc>) -> Self {
        DispatchEvent::MatchingRequestExpired {
            request_id: request.map(|r| r.id),
            ride_id: ride.id,
            pickup_cell: ride.pickup.geo_cell().to_string(),
            retry_count: request.map_or(0, |r| r.retry_count),
            expired_at: now,
        }
    }
}

/// Wire form of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    /// Delivery attempt; 0 for the first publish
    #[serde(default)]
    pub attempt: u32,
}

impl EventEnvelope {
    pub fn from_event(event: &DispatchEvent, now: DateTime<Utc>) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            topic: event.topic().to_string(),
            key: event.ride_id().to_string(),
            payload: serde_json::to_value(event)?,
            occurred_at: now,
            attempt: 0,
        })
    }

    #[cfg(test)]
    pub fn decode(&self) -> serde_json::Result<DispatchEvent> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_envelope_is_keyed_by_ride() {
        let ride = testing::ride(testing::t0());
        let event = DispatchEvent::ride_requested(&ride);
        let envelope = EventEnvelope::from_event(&event, testing::t0()).unwrap();

        assert_eq!(envelope.topic, topics::RIDE_REQUESTED);
        assert_eq!(envelope.key, ride.id.to_string());
        assert_eq!(envelope.payload["type"], "ride_requested");
        let decoded = envelope.decode().unwrap();
        assert_eq!(decoded.topic(), topics::RIDE_REQUESTED);
        assert_eq!(decoded.ride_id(), ride.id);
    }

    #[test]
    fn test_dead_letter_topic() {
        assert_eq!(topics::dead_letter(topics::RIDE_MATCHED), "ride-matched-dlq");
        assert!(topics::is_known("matching-failed"));
        assert!(!topics::is_known("ride-matched-dlq"));
    }
}
