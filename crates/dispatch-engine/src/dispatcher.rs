//! Dispatch service - ride intake and lifecycle
//!
//! The facade the API and binary talk to. Every ride mutation runs in a
//! [`RideTransaction`] holding the ride lock, and events go out only after
//! the commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{geo, Clock, DriverId, Location, PassengerId, VehicleType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clients::profile::{DriverInfo, PassengerInfo, ProfileClient};
use crate::clients::with_timeout;
use crate::domain::{
    CancelledBy, DriverCall, MatchingRequest, MatchingStatus, NewRide, Ride, SurgePrice,
};
use crate::driver_call::{finish, load_locked, Acceptance, DriverCallService};
use crate::engine::{MatchingEngine, RetryOutcome};
use crate::error::{DispatchError, Result};
use crate::event::DispatchEvent;
use crate::fare::FareEstimator;
use crate::metrics::EngineMetrics;
use crate::publisher::EventBus;
use crate::store::{MatchingRequestStore, RideStore, RideTransaction, StoreError};
use crate::surge::SurgePriceService;

/// A passenger asking for a ride
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub passenger_id: PassengerId,
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    pub payment_method_id: Option<String>,
}

/// A ride with its offers, latest matching request and profile context
#[derive(Debug, Clone, Serialize)]
pub struct RideDetails {
    pub ride: Ride,
    pub calls: Vec<DriverCall>,
    pub matching_request: Option<MatchingRequest>,
    pub passenger: Option<PassengerInfo>,
    pub driver: Option<DriverInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurgeQuote {
    pub geo_cell: String,
    pub multiplier: f64,
    pub current: Option<SurgePrice>,
}

pub struct DispatchService {
    rides: Arc<dyn RideStore>,
    requests: Arc<dyn MatchingRequestStore>,
    calls: Arc<DriverCallService>,
    engine: Arc<MatchingEngine>,
    surge: Arc<SurgePriceService>,
    fares: Arc<FareEstimator>,
    profiles: Arc<dyn ProfileClient>,
    bus: Arc<EventBus>,
    request_ttl: chrono::Duration,
    external_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
}

impl DispatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rides: Arc<dyn RideStore>,
        requests: Arc<dyn MatchingRequestStore>,
        calls: Arc<DriverCallService>,
        engine: Arc<MatchingEngine>,
        surge: Arc<SurgePriceService>,
        fares: Arc<FareEstimator>,
        profiles: Arc<dyn ProfileClient>,
        bus: Arc<EventBus>,
        request_ttl: chrono::Duration,
        external_timeout: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            rides,
            requests,
            calls,
            engine,
            surge,
            fares,
            profiles,
            bus,
            request_ttl,
            external_timeout,
            clock,
            metrics,
        }
    }

    /// Accept a new ride request.
    ///
    /// Flow:
    /// 1. Reject a passenger who already has an active ride
    /// 2. Price the trip with the pickup cell's current surge
    /// 3. Store the REQUESTED ride with a PENDING matching request
    /// 4. Publish `ride-requested` and `matching-request-created`
    #[instrument(skip(self, request), fields(passenger_id = %request.passenger_id))]
    pub async fn request_ride(&self, request: RideRequest) -> Result<Ride> {
        let now = self.clock.now();
        if request.pickup.distance_meters_to(&request.dropoff) < 1.0 {
            return Err(DispatchError::Validation(
                "pickup and dropoff must be different places".to_string(),
            ));
        }

        let passenger_id = request.passenger_id;
        if let Some(active) = self.rides.active_ride_for_passenger(passenger_id).await? {
            debug!(ride_id = %active.id, status = %active.status, "Passenger already has an active ride");
            return Err(DispatchError::DuplicateRideRequest(passenger_id.to_string()));
        }

        let surge = self
            .surge
            .get_current_multiplier(request.pickup.geo_cell())
            .await?;
        let fare = self
            .fares
            .estimate(&request.pickup, &request.dropoff, request.vehicle_type, surge)?;

        let ride = Ride::request(
            NewRide {
                passenger_id,
                pickup: request.pickup,
                dropoff: request.dropoff,
                fare,
                vehicle_type: request.vehicle_type,
                payment_method_id: request.payment_method_id,
            },
            now,
        );
        let matching = MatchingRequest::for_ride(&ride, now + self.request_ttl, now);

        self.rides
            .insert_ride(&ride, &matching)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => DispatchError::DuplicateRideRequest(passenger_id.to_string()),
                other => other.into(),
            })?;

        self.metrics.rides_requested.increment();
        info!(
            ride_id = %ride.id,
            pickup_cell = %matching.pickup_cell,
            estimated_fare = ride.fare.estimated(),
            surge_multiplier = surge,
            "Ride requested"
        );

        self.bus
            .publish_all(vec![
                DispatchEvent::ride_requested(&ride),
                DispatchEvent::request_created(&matching),
            ])
            .await;
        Ok(ride)
    }

    pub async fn get_ride(&self, ride_id: Uuid) -> Result<Ride> {
        self.rides
            .get_ride(ride_id)
            .await?
            .ok_or(DispatchError::RideNotFound(ride_id))
    }

    /// The ride plus everything around it. Profile lookups that fail or time
    /// out leave the profile empty.
    pub async fn get_ride_details(&self, ride_id: Uuid) -> Result<RideDetails> {
        let ride = self.get_ride(ride_id).await?;
        let calls = self.calls.calls_for_ride(ride_id).await?;
        let matching_request = self.requests.latest_request_for_ride(ride_id).await?;

        let passenger = match with_timeout(
            self.external_timeout,
            self.profiles.get_passenger_info(ride.passenger_id),
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                debug!(ride_id = %ride_id, error = %e, "Passenger profile unavailable");
                None
            }
        };
        let driver = match ride.driver_id {
            Some(driver_id) => {
                match with_timeout(self.external_timeout, self.profiles.get_driver_info(driver_id)).await {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(ride_id = %ride_id, error = %e, "Driver profile unavailable");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(RideDetails {
            ride,
            calls,
            matching_request,
            passenger,
            driver,
        })
    }

    pub async fn accept_call(&self, call_id: Uuid, driver_id: DriverId) -> Result<Acceptance> {
        self.calls.accept(call_id, driver_id).await
    }

    /// Driver declines an offer. When that was the ride's last open offer the
    /// ride goes back into the matching queue.
    pub async fn reject_call(&self, call_id: Uuid, driver_id: DriverId) -> Result<DriverCall> {
        let call = self.calls.reject(call_id, driver_id).await?;
        if let Err(e) = self.engine.redispatch_if_exhausted(call.ride_id).await {
            warn!(ride_id = %call.ride_id, error = %e, "Re-dispatch after rejection failed");
        }
        Ok(call)
    }

    /// Open offers for a driver, soonest deadline first
    pub async fn driver_offers(&self, driver_id: DriverId) -> Result<Vec<DriverCall>> {
        let mut calls = self.calls.pending_calls_for_driver(driver_id).await?;
        calls.sort_by_key(|c| c.expires_at);
        Ok(calls)
    }

    pub async fn driver_en_route(&self, ride_id: Uuid, driver_id: DriverId) -> Result<Ride> {
        self.progress(ride_id, |ride, now| ride.start_en_route(driver_id, now))
            .await
    }

    pub async fn driver_arrived(&self, ride_id: Uuid, driver_id: DriverId) -> Result<Ride> {
        self.progress(ride_id, |ride, now| ride.arrive_at_pickup(driver_id, now))
            .await
    }

    pub async fn start_trip(&self, ride_id: Uuid, driver_id: DriverId) -> Result<Ride> {
        self.progress(ride_id, |ride, now| ride.start_trip(driver_id, now))
            .await
    }

    #[instrument(skip(self), fields(ride_id = %ride_id))]
    pub async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: DriverId,
        distance_meters: f64,
        duration_seconds: u64,
        total_fare: f64,
    ) -> Result<Ride> {
        let (ride, seen) = self
            .mutate(ride_id, |ride, now| {
                if ride.driver_id != Some(driver_id) {
                    return Err(DispatchError::Validation(format!(
                        "driver {} is not assigned to ride {}",
                        driver_id, ride.id
                    )));
                }
                ride.complete(distance_meters, duration_seconds, total_fare, now)
            })
            .await?;

        self.metrics.rides_completed.increment();
        info!(total_fare, "Ride completed");

        let completed_at = ride.completed_at.unwrap_or_else(|| self.clock.now());
        let mut events = DispatchEvent::transitions_since(&ride, seen);
        events.push(DispatchEvent::ride_completed(
            &ride,
            distance_meters,
            duration_seconds,
            total_fare,
            completed_at,
        ));
        self.bus.publish_all(events).await;
        Ok(ride)
    }

    /// Cancel a ride in any non-terminal status.
    ///
    /// Outstanding offers are cancelled and an unfinished matching request is
    /// closed in the same commit.
    #[instrument(skip(self), fields(ride_id = %ride_id))]
    pub async fn cancel_ride(&self, ride_id: Uuid, reason: &str, cancelled_by: CancelledBy) -> Result<Ride> {
        let now = self.clock.now();
        let mut tx = self.rides.begin().await?;
        let staged = stage_cancel(&self.calls, tx.as_mut(), ride_id, reason, cancelled_by, now).await;
        let (ride, seen, cancelled_calls) = finish(tx, staged).await?;

        self.metrics.rides_cancelled.increment();
        info!(reason, cancelled_by = %cancelled_by.as_str(), "Ride cancelled");

        self.calls.announce_cancelled(&cancelled_calls).await;
        let mut events = DispatchEvent::transitions_since(&ride, seen);
        events.push(DispatchEvent::ride_cancelled(&ride, reason, cancelled_by, now));
        self.bus.publish_all(events).await;
        Ok(ride)
    }

    pub async fn rate_driver(&self, ride_id: Uuid, rating: u8) -> Result<Ride> {
        let (ride, _) = self.mutate(ride_id, |ride, _| ride.rate_driver(rating)).await?;
        Ok(ride)
    }

    pub async fn rate_passenger(&self, ride_id: Uuid, rating: u8) -> Result<Ride> {
        let (ride, _) = self
            .mutate(ride_id, |ride, _| ride.rate_passenger(rating))
            .await?;
        Ok(ride)
    }

    pub async fn retry_matching(&self, ride_id: Uuid) -> Result<RetryOutcome> {
        self.engine.retry_matching(ride_id).await
    }

    pub async fn surge_quote(&self, geo_cell: &str) -> Result<SurgeQuote> {
        geo::parse_cell(geo_cell)?;
        let current = self.surge.get_current(geo_cell).await?;
        Ok(SurgeQuote {
            geo_cell: geo_cell.to_string(),
            multiplier: current.as_ref().map_or(1.0, |s| s.surge_multiplier),
            current,
        })
    }

    pub async fn surge_history(&self, geo_cell: &str, limit: u32) -> Result<Vec<SurgePrice>> {
        geo::parse_cell(geo_cell)?;
        self.surge.history(geo_cell, limit).await
    }

    /// Apply a driver progress step and publish the resulting transitions
    async fn progress<F>(&self, ride_id: Uuid, apply: F) -> Result<Ride>
    where
        F: FnOnce(&mut Ride, DateTime<Utc>) -> Result<()> + Send,
    {
        let (ride, seen) = self.mutate(ride_id, apply).await?;
        debug!(ride_id = %ride_id, status = %ride.status, "Ride progressed");
        self.bus
            .publish_all(DispatchEvent::transitions_since(&ride, seen))
            .await;
        Ok(ride)
    }

    /// Load, change and save one ride under its lock. Returns the saved ride
    /// and how many audit transitions it had before the change.
    async fn mutate<F>(&self, ride_id: Uuid, apply: F) -> Result<(Ride, usize)>
    where
        F: FnOnce(&mut Ride, DateTime<Utc>) -> Result<()> + Send,
    {
        let now = self.clock.now();
        let mut tx = self.rides.begin().await?;

        let staged = async {
            let mut ride = load_locked(tx.as_mut(), ride_id).await?;
            let seen = ride.transitions.len();
            apply(&mut ride, now)?;
            tx.save_ride(&mut ride).await?;
            Ok::<_, DispatchError>((ride, seen))
        }
        .await;
        finish(tx, staged).await
    }
}

async fn stage_cancel(
    calls: &DriverCallService,
    tx: &mut dyn RideTransaction,
    ride_id: Uuid,
    reason: &str,
    cancelled_by: CancelledBy,
    now: DateTime<Utc>,
) -> Result<(Ride, usize, Vec<DriverCall>)> {
    let mut ride = load_locked(tx, ride_id).await?;
    let seen = ride.transitions.len();
    ride.cancel(reason, cancelled_by, now)?;

    let cancelled_calls = calls.stage_cancel_pending(tx, ride_id, None, now).await?;
    if let Some(mut request) = tx.latest_request_for_ride(ride_id).await? {
        if request.status != MatchingStatus::Completed {
            request.close(format!("ride cancelled: {}", reason), now);
            tx.save_request(&request).await?;
        }
    }
    tx.save_ride(&mut ride).await?;
    Ok((ride, seen, cancelled_calls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DriverCallStatus, RideStatus};
    use crate::event::topics;
    use crate::store::DriverCallStore;
    use crate::testing::{self, Harness};
    use assert_matches::assert_matches;

    fn ride_request(passenger_id: PassengerId) -> RideRequest {
        let pickup = testing::pickup();
        RideRequest {
            passenger_id,
            dropoff: testing::location_north_of(&pickup, 5000.0),
            pickup,
            vehicle_type: VehicleType::Standard,
            payment_method_id: Some("pm_card".to_string()),
        }
    }

    /// Request a ride and run matching with `drivers` nearby; returns the ride
    /// and its offers in rank order
    async fn offered_ride(h: &Harness, drivers: usize) -> (Ride, Vec<DriverCall>) {
        let pickup = testing::pickup();
        for i in 0..drivers {
            h.location
                .upsert(testing::nearby_driver(&pickup, 300.0 * (i + 1) as f64, 4.8, 0.9));
        }
        let ride = h.service.request_ride(ride_request(PassengerId::new())).await.unwrap();
        h.engine.run_batch().await.unwrap();
        let calls = h.store.calls_for_ride(ride.id).await.unwrap();
        (ride, calls)
    }

    #[tokio::test]
    async fn test_request_ride_prices_with_surge() {
        let h = testing::harness();
        h.surge
            .update_multiplier(testing::pickup().geo_cell(), 2.0)
            .await
            .unwrap();

        let ride = h.service.request_ride(ride_request(PassengerId::new())).await.unwrap();
        assert_eq!(ride.status, RideStatus::Requested);
        assert_eq!(ride.fare.surge_multiplier(), 2.0);
        assert_eq!(ride.fare.estimated(), ride.fare.base_fare() * 2.0);

        let request = h.store.latest_request_for_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(request.status, MatchingStatus::Pending);
        assert_eq!(request.surge_multiplier, 2.0);
        assert_eq!(request.expires_at, testing::t0() + chrono::Duration::seconds(120));

        assert_eq!(h.publisher.published_on(topics::RIDE_REQUESTED).len(), 1);
        assert_eq!(h.publisher.published_on(topics::MATCHING_REQUEST_CREATED).len(), 1);
    }

    #[tokio::test]
    async fn test_second_active_ride_is_rejected() {
        let h = testing::harness();
        let passenger = PassengerId::new();
        h.service.request_ride(ride_request(passenger)).await.unwrap();

        assert_matches!(
            h.service.request_ride(ride_request(passenger)).await,
            Err(DispatchError::DuplicateRideRequest(_))
        );
    }

    #[tokio::test]
    async fn test_same_pickup_and_dropoff_is_invalid() {
        let h = testing::harness();
        let mut request = ride_request(PassengerId::new());
        request.dropoff = request.pickup.clone();

        assert_matches!(h.service.request_ride(request).await, Err(DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn test_full_trip() {
        let h = testing::harness();
        let (ride, calls) = offered_ride(&h, 2).await;
        let driver = calls[0].driver_id;

        let acceptance = h.service.accept_call(calls[0].id, driver).await.unwrap();
        assert_eq!(acceptance.ride.status, RideStatus::DriverAssigned);

        assert_matches!(
            h.service.driver_en_route(ride.id, calls[1].driver_id).await,
            Err(DispatchError::Validation(_))
        );
        h.service.driver_en_route(ride.id, driver).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(4));
        h.service.driver_arrived(ride.id, driver).await.unwrap();
        h.service.start_trip(ride.id, driver).await.unwrap();

        assert_matches!(h.service.rate_driver(ride.id, 5).await, Err(DispatchError::InvalidRideState { .. }));

        h.clock.advance(chrono::Duration::minutes(12));
        let done = h
            .service
            .complete_ride(ride.id, driver, 5200.0, 720, 18.4)
            .await
            .unwrap();
        assert_eq!(done.status, RideStatus::Completed);
        assert_eq!(done.fare.total_fare(), Some(18.4));

        h.service.rate_driver(ride.id, 5).await.unwrap();
        assert_matches!(h.service.rate_passenger(ride.id, 6).await, Err(DispatchError::Validation(_)));

        let statuses: Vec<RideStatus> = h
            .service
            .get_ride(ride.id)
            .await
            .unwrap()
            .transitions
            .iter()
            .map(|t| t.to_status)
            .collect();
        assert_eq!(
            statuses,
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
        assert_eq!(h.publisher.published_on(topics::RIDE_COMPLETED).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_offers_are_out() {
        let h = testing::harness();
        let (ride, calls) = offered_ride(&h, 2).await;
        assert_eq!(calls.len(), 2);

        let cancelled = h
            .service
            .cancel_ride(ride.id, "changed plans", CancelledBy::Passenger)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(CancelledBy::Passenger));

        for call in h.store.calls_for_ride(ride.id).await.unwrap() {
            assert_eq!(call.status, DriverCallStatus::Cancelled);
        }
        assert_matches!(
            h.service.accept_call(calls[0].id, calls[0].driver_id).await,
            Err(DispatchError::InvalidDriverCallState { .. })
        );
        assert_eq!(h.publisher.published_on(topics::RIDE_CANCELLED).len(), 1);
    }

    #[tokio::test]
    async fn test_accept_survives_failed_match_publish() {
        let h = testing::harness();
        let (ride, calls) = offered_ride(&h, 2).await;
        h.publisher.fail_topic(topics::RIDE_MATCHED);
        h.publisher.fail_topic(topics::DRIVER_CALL_STATUS_CHANGED);

        let acceptance = h.service.accept_call(calls[0].id, calls[0].driver_id).await.unwrap();
        assert_eq!(acceptance.ride.status, RideStatus::DriverAssigned);

        let stored = h.store.get_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::DriverAssigned);
        assert_eq!(stored.driver_id, Some(calls[0].driver_id));
        let statuses: Vec<DriverCallStatus> = h
            .store
            .calls_for_ride(ride.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.status)
            .collect();
        assert_eq!(statuses, vec![DriverCallStatus::Accepted, DriverCallStatus::Cancelled]);

        assert!(h.publisher.published_on(topics::RIDE_MATCHED).is_empty());
        assert!(h.metrics.snapshot().publish_failures >= 1);
    }

    #[tokio::test]
    async fn test_cancel_survives_failed_publish() {
        let h = testing::harness();
        let (ride, _) = offered_ride(&h, 2).await;
        h.publisher.fail_topic(topics::RIDE_CANCELLED);

        let cancelled = h
            .service
            .cancel_ride(ride.id, "changed plans", CancelledBy::Passenger)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);

        let stored = h.store.get_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
        for call in h.store.calls_for_ride(ride.id).await.unwrap() {
            assert_eq!(call.status, DriverCallStatus::Cancelled);
        }
        assert!(h.publisher.published_on(topics::RIDE_CANCELLED).is_empty());
        assert_eq!(h.metrics.snapshot().publish_failures, 1);
    }

    #[tokio::test]
    async fn test_cancel_closes_unmatched_request() {
        let h = testing::harness();
        let ride = h.service.request_ride(ride_request(PassengerId::new())).await.unwrap();
        h.engine.run_batch().await.unwrap();

        h.service
            .cancel_ride(ride.id, "too slow", CancelledBy::Passenger)
            .await
            .unwrap();

        let request = h.store.latest_request_for_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(request.status, MatchingStatus::Failed);
        assert_eq!(request.error_message.as_deref(), Some("ride cancelled: too slow"));
        assert_matches!(
            h.service.retry_matching(ride.id).await.unwrap(),
            RetryOutcome::Refused { .. }
        );
        assert_matches!(
            h.service.cancel_ride(ride.id, "again", CancelledBy::Passenger).await,
            Err(DispatchError::InvalidRideStateTransition { .. })
        );
    }

    #[tokio::test]
    async fn test_last_rejection_requeues_ride() {
        let h = testing::harness();
        let (ride, calls) = offered_ride(&h, 2).await;

        h.service.reject_call(calls[0].id, calls[0].driver_id).await.unwrap();
        let request = h.store.latest_request_for_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(request.status, MatchingStatus::Completed);

        h.service.reject_call(calls[1].id, calls[1].driver_id).await.unwrap();
        let request = h.store.latest_request_for_ride(ride.id).await.unwrap().unwrap();
        assert_eq!((request.status, request.retry_count), (MatchingStatus::Pending, 1));
    }

    #[tokio::test]
    async fn test_details_tolerate_missing_profiles() {
        let h = testing::harness();
        let (ride, calls) = offered_ride(&h, 1).await;
        h.profiles.add_passenger(PassengerInfo {
            passenger_id: ride.passenger_id,
            name: "Ada".to_string(),
            rating: Some(4.9),
        });
        h.service.accept_call(calls[0].id, calls[0].driver_id).await.unwrap();

        let details = h.service.get_ride_details(ride.id).await.unwrap();
        assert_eq!(details.passenger.map(|p| p.name), Some("Ada".to_string()));
        assert_eq!(details.driver, None);
        assert_eq!(details.calls.len(), 1);
        assert_eq!(
            details.matching_request.map(|r| r.status),
            Some(MatchingStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_surge_quote_defaults_to_one() {
        let h = testing::harness();
        let cell = testing::pickup().geo_cell().to_string();

        assert_eq!(h.service.surge_quote(&cell).await.unwrap().multiplier, 1.0);
        h.surge.apply_sample(&cell, 12, 4).await.unwrap();
        assert_eq!(h.service.surge_quote(&cell).await.unwrap().multiplier, 2.0);
        assert_matches!(h.service.surge_quote("not-a-cell").await, Err(DispatchError::Validation(_)));
    }
}
