//! Ride aggregate and its audit trail

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{DriverId, Fare, Location, PassengerId, VehicleType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::state_machine;

/// Ride lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Matched,
    DriverAssigned,
    EnRouteToPickup,
    ArrivedAtPickup,
    OnTrip,
    Completed,
    Cancelled,
    Failed,
}

impl RideStatus {
    pub const ALL: [RideStatus; 9] = [
        RideStatus::Requested,
        RideStatus::Matched,
        RideStatus::DriverAssigned,
        RideStatus::EnRouteToPickup,
        RideStatus::ArrivedAtPickup,
        RideStatus::OnTrip,
        RideStatus::Completed,
        RideStatus::Cancelled,
        RideStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Matched => "MATCHED",
            RideStatus::DriverAssigned => "DRIVER_ASSIGNED",
            RideStatus::EnRouteToPickup => "EN_ROUTE_TO_PICKUP",
            RideStatus::ArrivedAtPickup => "ARRIVED_AT_PICKUP",
            RideStatus::OnTrip => "ON_TRIP",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
            RideStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        RideStatus::ALL.into_iter().find(|st| st.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RideStatus::Completed | RideStatus::Cancelled | RideStatus::Failed
        )
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who cancelled a ride
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelledBy {
    Passenger,
    Driver,
    System,
    Admin,
}

impl CancelledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelledBy::Passenger => "PASSENGER",
            CancelledBy::Driver => "DRIVER",
            CancelledBy::System => "SYSTEM",
            CancelledBy::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PASSENGER" => Some(CancelledBy::Passenger),
            "DRIVER" => Some(CancelledBy::Driver),
            "SYSTEM" => Some(CancelledBy::System),
            "ADMIN" => Some(CancelledBy::Admin),
            _ => None,
        }
    }
}

/// Event that caused a ride transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideTrigger {
    RideRequested,
    DriverMatched,
    DriverAssigned,
    DriverEnRoute,
    DriverArrived,
    TripStarted,
    TripCompleted,
    RideCancelled,
    RideFailed,
}

impl RideTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideTrigger::RideRequested => "RIDE_REQUESTED",
            RideTrigger::DriverMatched => "DRIVER_MATCHED",
            RideTrigger::DriverAssigned => "DRIVER_ASSIGNED",
            RideTrigger::DriverEnRoute => "DRIVER_EN_ROUTE",
            RideTrigger::DriverArrived => "DRIVER_ARRIVED",
            RideTrigger::TripStarted => "TRIP_STARTED",
            RideTrigger::TripCompleted => "TRIP_COMPLETED",
            RideTrigger::RideCancelled => "RIDE_CANCELLED",
            RideTrigger::RideFailed => "RIDE_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use RideTrigger::*;
        [
            RideRequested,
            DriverMatched,
            DriverAssigned,
            DriverEnRoute,
            DriverArrived,
            TripStarted,
            TripCompleted,
            RideCancelled,
            RideFailed,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

/// Immutable audit record; appended on every status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideStateTransition {
    pub id: Uuid,
    pub ride_id: Uuid,
    /// `None` only for the record created with the ride
    pub from_status: Option<RideStatus>,
    pub to_status: RideStatus,
    pub trigger: RideTrigger,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Input for creating a ride
#[derive(Debug, Clone)]
pub struct NewRide {
    pub passenger_id: PassengerId,
    pub pickup: Location,
    pub dropoff: Location,
    pub fare: Fare,
    pub vehicle_type: VehicleType,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub passenger_id: PassengerId,
    pub pickup: Location,
    pub dropoff: Location,
    pub fare: Fare,
    pub driver_id: Option<DriverId>,
    pub status: RideStatus,
    pub vehicle_type: VehicleType,
    pub payment_method_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
    pub distance_meters: Option<f64>,
    pub duration_seconds: Option<u64>,
    /// Rating given by the passenger to the driver
    pub driver_rating: Option<u8>,
    /// Rating given by the driver to the passenger
    pub passenger_rating: Option<u8>,
    /// Optimistic concurrency version, bumped by the store on every save
    pub version: i64,
    pub transitions: Vec<RideStateTransition>,
}

impl Ride {
    /// Create a ride in REQUESTED with its initial audit record
    pub fn request(new: NewRide, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        let initial = RideStateTransition {
            id: Uuid::new_v4(),
            ride_id: id,
            from_status: None,
            to_status: RideStatus::Requested,
            trigger: RideTrigger::RideRequested,
            metadata: BTreeMap::new(),
            occurred_at: now,
        };

        Self {
            id,
            passenger_id: new.passenger_id,
            pickup: new.pickup,
            dropoff: new.dropoff,
            fare: new.fare,
            driver_id: None,
            status: RideStatus::Requested,
            vehicle_type: new.vehicle_type,
            payment_method_id: new.payment_method_id,
            requested_at: now,
            matched_at: None,
            pickup_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            distance_meters: None,
            duration_seconds: None,
            driver_rating: None,
            passenger_rating: None,
            version: 0,
            transitions: vec![initial],
        }
    }

    fn transition(
        &mut self,
        to: RideStatus,
        trigger: RideTrigger,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        state_machine::ensure_transition(self.status, to)?;

        self.transitions.push(RideStateTransition {
            id: Uuid::new_v4(),
            ride_id: self.id,
            from_status: Some(self.status),
            to_status: to,
            trigger,
            metadata,
            occurred_at: now,
        });
        self.status = to;
        Ok(())
    }

    fn require_status(&self, expected: RideStatus, action: &str) -> Result<()> {
        if self.status != expected {
            return Err(DispatchError::InvalidRideState {
                ride_id: self.id,
                status: self.status,
                message: format!("{} requires {}", action, expected),
            });
        }
        Ok(())
    }

    fn require_driver(&self, driver_id: DriverId) -> Result<()> {
        match self.driver_id {
            Some(assigned) if assigned == driver_id => Ok(()),
            _ => Err(DispatchError::Validation(format!(
                "driver {} is not assigned to ride {}",
                driver_id, self.id
            ))),
        }
    }

    /// REQUESTED -> MATCHED
    pub fn mark_matched(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> Result<()> {
        if self.status != RideStatus::Requested && self.driver_id.is_some() {
            return Err(DispatchError::RideAlreadyMatched(self.id));
        }
        let metadata = BTreeMap::from([("driver_id".to_string(), driver_id.to_string())]);
        self.transition(RideStatus::Matched, RideTrigger::DriverMatched, metadata, now)?;
        self.driver_id = Some(driver_id);
        self.matched_at = Some(now);
        Ok(())
    }

    /// MATCHED -> DRIVER_ASSIGNED
    pub fn assign_driver(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> Result<()> {
        if let Some(existing) = self.driver_id {
            if existing != driver_id {
                return Err(DispatchError::RideAlreadyMatched(self.id));
            }
        }
        let metadata = BTreeMap::from([("driver_id".to_string(), driver_id.to_string())]);
        self.transition(RideStatus::DriverAssigned, RideTrigger::DriverAssigned, metadata, now)?;
        self.driver_id = Some(driver_id);
        self.matched_at.get_or_insert(now);
        Ok(())
    }

    pub fn start_en_route(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> Result<()> {
        self.require_driver(driver_id)?;
        self.transition(
            RideStatus::EnRouteToPickup,
            RideTrigger::DriverEnRoute,
            BTreeMap::new(),
            now,
        )
    }

    pub fn arrive_at_pickup(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> Result<()> {
        self.require_driver(driver_id)?;
        self.transition(
            RideStatus::ArrivedAtPickup,
            RideTrigger::DriverArrived,
            BTreeMap::new(),
            now,
        )?;
        self.pickup_at = Some(now);
        Ok(())
    }

    pub fn start_trip(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> Result<()> {
        self.require_driver(driver_id)?;
        self.transition(RideStatus::OnTrip, RideTrigger::TripStarted, BTreeMap::new(), now)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// ON_TRIP -> COMPLETED, stamping the final fare
    pub fn complete(
        &mut self,
        distance_meters: f64,
        duration_seconds: u64,
        total_fare: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require_status(RideStatus::OnTrip, "completing a ride")?;
        if !(distance_meters >= 0.0) {
            return Err(DispatchError::Validation(format!(
                "distance must be >= 0, got {}",
                distance_meters
            )));
        }
        let fare = self.fare.with_total(total_fare)?;

        let metadata = BTreeMap::from([
            ("distance_meters".to_string(), format!("{:.0}", distance_meters)),
            ("duration_seconds".to_string(), duration_seconds.to_string()),
            ("total_fare".to_string(), format!("{:.2}", total_fare)),
        ]);
        self.transition(RideStatus::Completed, RideTrigger::TripCompleted, metadata, now)?;
        self.fare = fare;
        self.distance_meters = Some(distance_meters);
        self.duration_seconds = Some(duration_seconds);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Any non-terminal status -> CANCELLED
    pub fn cancel(&mut self, reason: &str, actor: CancelledBy, now: DateTime<Utc>) -> Result<()> {
        let metadata = BTreeMap::from([
            ("reason".to_string(), reason.to_string()),
            ("cancelled_by".to_string(), actor.as_str().to_string()),
        ]);
        self.transition(RideStatus::Cancelled, RideTrigger::RideCancelled, metadata, now)?;
        self.cancelled_at = Some(now);
        self.cancellation_reason = Some(reason.to_string());
        self.cancelled_by = Some(actor);
        Ok(())
    }

    /// Any non-terminal status -> FAILED
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let metadata = BTreeMap::from([("reason".to_string(), reason.to_string())]);
        self.transition(RideStatus::Failed, RideTrigger::RideFailed, metadata, now)
    }

    /// Passenger rates the driver; only after completion
    pub fn rate_driver(&mut self, rating: u8) -> Result<()> {
        self.require_status(RideStatus::Completed, "rating")?;
        self.driver_rating = Some(validate_rating(rating)?);
        Ok(())
    }

    /// Driver rates the passenger; only after completion
    pub fn rate_passenger(&mut self, rating: u8) -> Result<()> {
        self.require_status(RideStatus::Completed, "rating")?;
        self.passenger_rating = Some(validate_rating(rating)?);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn validate_rating(rating: u8) -> Result<u8> {
    if (1..=5).contains(&rating) {
        Ok(rating)
    } else {
        Err(DispatchError::Validation(format!(
            "rating must be between 1 and 5, got {}",
            rating
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;

    #[test]
    fn test_new_ride_has_initial_transition() {
        let ride = testing::ride(testing::t0());
        assert_eq!(ride.status, RideStatus::Requested);
        assert_eq!(ride.transitions.len(), 1);
        assert_eq!(ride.transitions[0].from_status, None);
        assert_eq!(ride.transitions[0].trigger, RideTrigger::RideRequested);
    }

    #[test]
    fn test_full_lifecycle_appends_audit_trail() {
        let now = testing::t0();
        let driver = DriverId::new();
        let mut ride = testing::ride(now);

        ride.mark_matched(driver, now).unwrap();
        ride.assign_driver(driver, now).unwrap();
        ride.start_en_route(driver, now).unwrap();
        ride.arrive_at_pickup(driver, now).unwrap();
        ride.start_trip(driver, now).unwrap();
        ride.complete(4200.0, 900, 18.4, now).unwrap();

        assert_eq!(ride.status, RideStatus::Completed);
        assert_eq!(ride.fare.total_fare(), Some(18.4));
        assert_eq!(ride.transitions.len(), 7);
        let path: Vec<_> = ride.transitions.iter().map(|t| t.to_status).collect();
        assert_eq!(
            path,
            vec![
                RideStatus::Requested,
                RideStatus::Matched,
                RideStatus::DriverAssigned,
                RideStatus::EnRouteToPickup,
                RideStatus::ArrivedAtPickup,
                RideStatus::OnTrip,
                RideStatus::Completed,
            ]
        );
    }

    #[test]
    fn test_complete_requires_on_trip() {
        let mut ride = testing::ride(testing::t0());
        assert_matches!(
            ride.complete(100.0, 60, 5.0, testing::t0()),
            Err(DispatchError::InvalidRideState { .. })
        );
        assert_eq!(ride.transitions.len(), 1);
    }

    #[test]
    fn test_cancel_records_actor() {
        let now = testing::t0();
        let mut ride = testing::ride(now);
        ride.cancel("changed plans", CancelledBy::Passenger, now).unwrap();

        assert_eq!(ride.status, RideStatus::Cancelled);
        assert_eq!(ride.cancelled_by, Some(CancelledBy::Passenger));
        assert_eq!(ride.cancellation_reason.as_deref(), Some("changed plans"));

        assert_matches!(
            ride.cancel("again", CancelledBy::Admin, now),
            Err(DispatchError::InvalidRideStateTransition {
                from: RideStatus::Cancelled,
                to: RideStatus::Cancelled
            })
        );
    }

    #[test]
    fn test_only_assigned_driver_progresses() {
        let now = testing::t0();
        let driver = DriverId::new();
        let mut ride = testing::ride(now);
        ride.mark_matched(driver, now).unwrap();
        ride.assign_driver(driver, now).unwrap();

        assert_matches!(
            ride.start_en_route(DriverId::new(), now),
            Err(DispatchError::Validation(_))
        );
    }

    #[test]
    fn test_assign_other_driver_rejected() {
        let now = testing::t0();
        let mut ride = testing::ride(now);
        ride.mark_matched(DriverId::new(), now).unwrap();
        assert_matches!(
            ride.assign_driver(DriverId::new(), now),
            Err(DispatchError::RideAlreadyMatched(_))
        );
    }

    #[test]
    fn test_ratings_only_after_completion() {
        let now = testing::t0();
        let mut ride = testing::ride(now);
        assert_matches!(ride.rate_driver(5), Err(DispatchError::InvalidRideState { .. }));

        let driver = DriverId::new();
        ride.mark_matched(driver, now).unwrap();
        ride.assign_driver(driver, now).unwrap();
        ride.start_en_route(driver, now).unwrap();
        ride.arrive_at_pickup(driver, now).unwrap();
        ride.start_trip(driver, now).unwrap();
        ride.complete(1000.0, 300, 9.0, now).unwrap();

        assert_matches!(ride.rate_driver(6), Err(DispatchError::Validation(_)));
        ride.rate_driver(5).unwrap();
        ride.rate_passenger(4).unwrap();
        assert_eq!(ride.driver_rating, Some(5));
        assert_eq!(ride.passenger_rating, Some(4));
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in RideStatus::ALL {
            assert_eq!(RideStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RideStatus::parse("en_route_to_pickup"), Some(RideStatus::EnRouteToPickup));
    }
}
