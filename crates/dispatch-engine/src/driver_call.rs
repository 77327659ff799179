//! Driver-call offer protocol
//!
//! Offers are created in rank order, answered by drivers, and swept when
//! their TTL passes. Everything that touches a ride's calls runs inside a
//! [`RideTransaction`] holding that ride's lock, which is what makes
//! "first acceptance wins" hold across instances.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{Clock, DriverId, Location};
use config::DriverCallConfig;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{DriverCall, DriverCallStatus, Ride, RideStatus};
use crate::error::{DispatchError, Result};
use crate::event::DispatchEvent;
use crate::metrics::EngineMetrics;
use crate::publisher::EventBus;
use crate::scoring::ScoredCandidate;
use crate::store::{DriverCallStore, RideStore, RideTransaction};

/// What the engine offers to one ranked driver
#[derive(Debug, Clone, PartialEq)]
pub struct CallOffer {
    pub driver_id: DriverId,
    pub driver_location: Location,
    pub distance_to_pickup_meters: f64,
    pub estimated_arrival_seconds: u32,
    pub estimated_fare: f64,
}

impl CallOffer {
    pub fn from_candidate(candidate: &ScoredCandidate, estimated_arrival_seconds: u32, estimated_fare: f64) -> Self {
        Self {
            driver_id: candidate.driver_id,
            driver_location: candidate.location.clone(),
            distance_to_pickup_meters: candidate.distance_meters,
            estimated_arrival_seconds,
            estimated_fare,
        }
    }
}

/// Outcome of a successful acceptance
#[derive(Debug, Clone, Serialize)]
pub struct Acceptance {
    pub call: DriverCall,
    pub ride: Ride,
    pub cancelled_siblings: Vec<DriverCall>,
}

pub struct DriverCallService {
    rides: Arc<dyn RideStore>,
    calls: Arc<dyn DriverCallStore>,
    bus: Arc<EventBus>,
    config: DriverCallConfig,
    max_retry_count: u32,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
}

impl DriverCallService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rides: Arc<dyn RideStore>,
        calls: Arc<dyn DriverCallStore>,
        bus: Arc<EventBus>,
        config: DriverCallConfig,
        max_retry_count: u32,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            rides,
            calls,
            bus,
            config,
            max_retry_count,
            clock,
            metrics,
        }
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::seconds(self.config.offer_ttl_seconds as i64)
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Offer the ride to `offers` in rank order and publish one batched
    /// `driver-call-request`. The ride must still be REQUESTED.
    pub async fn create_calls(&self, ride_id: Uuid, offers: &[CallOffer]) -> Result<Vec<DriverCall>> {
        let now = self.clock.now();
        let mut tx = self.rides.begin().await?;

        let staged = async {
            let ride = load_locked(tx.as_mut(), ride_id).await?;
            self.stage_calls(tx.as_mut(), &ride, offers, now).await
        }
        .await;
        let created = finish(tx, staged).await?;

        self.announce_calls(ride_id, &created).await;
        Ok(created)
    }

    /// Build and stage the calls inside an open transaction; the caller commits
    pub(crate) async fn stage_calls(
        &self,
        tx: &mut dyn RideTransaction,
        ride: &Ride,
        offers: &[CallOffer],
        now: DateTime<Utc>,
    ) -> Result<Vec<DriverCall>> {
        if ride.status != RideStatus::Requested {
            return Err(DispatchError::InvalidRideState {
                ride_id: ride.id,
                status: ride.status,
                message: "offers can only be made while REQUESTED".to_string(),
            });
        }
        if offers.is_empty() {
            return Err(DispatchError::NoAvailableDrivers(ride.pickup.geo_cell().to_string()));
        }

        let expires_at = now + self.offer_ttl();
        let calls: Vec<DriverCall> = offers
            .iter()
            .enumerate()
            .map(|(idx, offer)| {
                let mut call = DriverCall::offer(
                    ride.id,
                    offer.driver_id,
                    idx as u32 + 1,
                    offer.driver_location.clone(),
                    now,
                    expires_at,
                );
                call.distance_to_pickup_meters = Some(offer.distance_to_pickup_meters);
                call.estimated_arrival_seconds = Some(offer.estimated_arrival_seconds);
                call.estimated_fare = Some(offer.estimated_fare);
                call
            })
            .collect();

        tx.save_calls(&calls).await?;
        Ok(calls)
    }

    /// Publish the batched offer event for freshly committed calls
    pub(crate) async fn announce_calls(&self, ride_id: Uuid, calls: &[DriverCall]) {
        self.metrics.calls_offered.add(calls.len() as u64);
        self.bus
            .publish(DispatchEvent::driver_call_request(ride_id, calls))
            .await;
    }

    /// Driver accepts an offer.
    ///
    /// Fails with `DriverCallExpired` once `expires_at` has passed, even if the
    /// expiry sweep has not run, and with `InvalidDriverCallState` if the call
    /// was already answered or cancelled. On success all sibling PENDING calls
    /// are cancelled and the ride moves to DRIVER_ASSIGNED, in one commit.
    #[instrument(skip(self), fields(call_id = %call_id, driver_id = %driver_id))]
    pub async fn accept(&self, call_id: Uuid, driver_id: DriverId) -> Result<Acceptance> {
        let now = self.clock.now();
        let ride_id = self.ride_of(call_id, driver_id).await?;
        let mut tx = self.rides.begin().await?;

        let staged = self.stage_accept(tx.as_mut(), ride_id, call_id, driver_id, now).await;
        let (acceptance, transitions_before) = finish(tx, staged).await?;

        self.metrics.calls_accepted.increment();
        self.metrics
            .calls_cancelled
            .add(acceptance.cancelled_siblings.len() as u64);
        info!(
            ride_id = %ride_id,
            cancelled = acceptance.cancelled_siblings.len(),
            "Driver call accepted"
        );

        let mut events = vec![DispatchEvent::call_status_changed(&acceptance.call)];
        events.extend(
            acceptance
                .cancelled_siblings
                .iter()
                .map(DispatchEvent::call_status_changed),
        );
        events.push(DispatchEvent::ride_matched(&acceptance.ride, driver_id, &acceptance.call));
        events.extend(DispatchEvent::transitions_since(&acceptance.ride, transitions_before));
        self.bus.publish_all(events).await;

        Ok(acceptance)
    }

    async fn stage_accept(
        &self,
        tx: &mut dyn RideTransaction,
        ride_id: Uuid,
        call_id: Uuid,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<(Acceptance, usize)> {
        let mut ride = load_locked(tx, ride_id).await?;
        let mut call = tx
            .get_call(call_id)
            .await?
            .ok_or(DispatchError::DriverCallNotFound(call_id))?;

        call.accept(now)?;

        let transitions_before = ride.transitions.len();
        match ride.status {
            RideStatus::Requested => {
                ride.mark_matched(driver_id, now)?;
                ride.assign_driver(driver_id, now)?;
            }
            RideStatus::Matched => ride.assign_driver(driver_id, now)?,
            _ if ride.driver_id.is_some() => return Err(DispatchError::RideAlreadyMatched(ride.id)),
            status => {
                return Err(DispatchError::InvalidRideState {
                    ride_id: ride.id,
                    status,
                    message: "ride is no longer waiting for a driver".to_string(),
                })
            }
        }

        let mut cancelled = Vec::new();
        for mut sibling in tx.calls_for_ride(ride_id).await? {
            if sibling.id == call_id
                || sibling.driver_id == driver_id
                || sibling.status != DriverCallStatus::Pending
            {
                continue;
            }
            sibling.cancel(now)?;
            cancelled.push(sibling);
        }

        let mut writes = Vec::with_capacity(cancelled.len() + 1);
        writes.push(call.clone());
        writes.extend(cancelled.iter().cloned());
        tx.save_calls(&writes).await?;
        tx.save_ride(&mut ride).await?;

        Ok((
            Acceptance {
                call,
                ride,
                cancelled_siblings: cancelled,
            },
            transitions_before,
        ))
    }

    /// Driver declines an offer. Siblings are untouched.
    #[instrument(skip(self), fields(call_id = %call_id, driver_id = %driver_id))]
    pub async fn reject(&self, call_id: Uuid, driver_id: DriverId) -> Result<DriverCall> {
        let now = self.clock.now();
        let ride_id = self.ride_of(call_id, driver_id).await?;
        let mut tx = self.rides.begin().await?;

        let staged = async {
            load_locked(tx.as_mut(), ride_id).await?;
            let mut call = tx
                .get_call(call_id)
                .await?
                .ok_or(DispatchError::DriverCallNotFound(call_id))?;
            call.reject(now)?;
            tx.save_calls(std::slice::from_ref(&call)).await?;
            Ok::<_, DispatchError>(call)
        }
        .await;
        let call = finish(tx, staged).await?;

        self.metrics.calls_rejected.increment();
        debug!(ride_id = %ride_id, "Driver call rejected");
        self.bus.publish(DispatchEvent::call_status_changed(&call)).await;
        Ok(call)
    }

    /// Move every PENDING call past its deadline to EXPIRED. Idempotent.
    #[instrument(skip(self))]
    pub async fn expire_old_calls(&self) -> Result<Vec<DriverCall>> {
        let now = self.clock.now();
        let expired = self.calls.expire_calls(now).await?;
        if expired.is_empty() {
            return Ok(expired);
        }

        self.metrics.calls_expired.add(expired.len() as u64);
        info!(count = expired.len(), "Expired driver calls");
        self.bus
            .publish_all(expired.iter().map(DispatchEvent::call_status_changed).collect::<Vec<_>>())
            .await;
        Ok(expired)
    }

    /// Cancel the ride's PENDING calls, optionally sparing one driver
    pub async fn cancel_pending_calls_for_ride(
        &self,
        ride_id: Uuid,
        exclude_driver: Option<DriverId>,
    ) -> Result<Vec<DriverCall>> {
        let now = self.clock.now();
        let mut tx = self.rides.begin().await?;

        let staged = async {
            load_locked(tx.as_mut(), ride_id).await?;
            self.stage_cancel_pending(tx.as_mut(), ride_id, exclude_driver, now).await
        }
        .await;
        let cancelled = finish(tx, staged).await?;

        self.announce_cancelled(&cancelled).await;
        Ok(cancelled)
    }

    pub async fn cancel_all_calls_for_ride(&self, ride_id: Uuid) -> Result<Vec<DriverCall>> {
        self.cancel_pending_calls_for_ride(ride_id, None).await
    }

    /// Stage cancellation of PENDING calls inside an open transaction
    pub(crate) async fn stage_cancel_pending(
        &self,
        tx: &mut dyn RideTransaction,
        ride_id: Uuid,
        exclude_driver: Option<DriverId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DriverCall>> {
        let mut cancelled = Vec::new();
        for mut call in tx.calls_for_ride(ride_id).await? {
            if call.status != DriverCallStatus::Pending || Some(call.driver_id) == exclude_driver {
                continue;
            }
            call.cancel(now)?;
            cancelled.push(call);
        }
        if !cancelled.is_empty() {
            tx.save_calls(&cancelled).await?;
        }
        Ok(cancelled)
    }

    pub(crate) async fn announce_cancelled(&self, cancelled: &[DriverCall]) {
        if cancelled.is_empty() {
            return;
        }
        self.metrics.calls_cancelled.add(cancelled.len() as u64);
        self.bus
            .publish_all(cancelled.iter().map(DispatchEvent::call_status_changed).collect::<Vec<_>>())
            .await;
    }

    /// Accepted share of answered offers over the trailing window, or `None`
    /// when the driver has too few answered offers to judge
    pub async fn observed_acceptance_rate(&self, driver_id: DriverId) -> Result<Option<f64>> {
        let since = self.clock.now() - Duration::hours(self.config.acceptance_window_hours as i64);
        let (answered, accepted) = self.calls.acceptance_stats(driver_id, since).await?;

        if answered == 0 || answered < self.config.min_acceptance_samples as u64 {
            return Ok(None);
        }
        Ok(Some(accepted as f64 / answered as f64))
    }

    /// Observed rate when there is enough history, otherwise `reported`
    pub async fn get_driver_acceptance_rate(&self, driver_id: DriverId, reported: f64) -> Result<f64> {
        Ok(self
            .observed_acceptance_rate(driver_id)
            .await?
            .unwrap_or(reported)
            .clamp(0.0, 1.0))
    }

    pub async fn calls_for_ride(&self, ride_id: Uuid) -> Result<Vec<DriverCall>> {
        Ok(self.calls.calls_for_ride(ride_id).await?)
    }

    pub async fn pending_calls_for_driver(&self, driver_id: DriverId) -> Result<Vec<DriverCall>> {
        let now = self.clock.now();
        let mut calls = self.calls.pending_calls_for_driver(driver_id).await?;
        calls.retain(|c| !c.is_expired_at(now));
        Ok(calls)
    }

    /// Drivers among `drivers` that currently hold a PENDING call
    pub async fn busy_drivers(&self, drivers: &[DriverId]) -> Result<std::collections::HashSet<DriverId>> {
        Ok(self.calls.drivers_with_pending_calls(drivers).await?)
    }

    /// Ride id of the call, checking it was offered to `driver_id`
    async fn ride_of(&self, call_id: Uuid, driver_id: DriverId) -> Result<Uuid> {
        let call = self
            .calls
            .get_call(call_id)
            .await?
            .ok_or(DispatchError::DriverCallNotFound(call_id))?;
        if call.driver_id != driver_id {
            return Err(DispatchError::Validation(format!(
                "driver call {} was not offered to driver {}",
                call_id, driver_id
            )));
        }
        Ok(call.ride_id)
    }
}

/// Lock and load a ride inside a transaction
pub(crate) async fn load_locked(tx: &mut dyn RideTransaction, ride_id: Uuid) -> Result<Ride> {
    tx.lock_ride(ride_id)
        .await?
        .ok_or(DispatchError::RideNotFound(ride_id))
}

/// Commit on success, roll back on failure
pub(crate) async fn finish<T>(tx: Box<dyn RideTransaction>, staged: Result<T>) -> Result<T> {
    match staged {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MatchingRequest;
    use crate::store::RideStore;
    use crate::testing::{self, Harness};
    use assert_matches::assert_matches;

    async fn seeded_ride(h: &Harness) -> Ride {
        let ride = testing::ride(h.clock.now());
        let request = MatchingRequest::for_ride(&ride, h.clock.now() + Duration::seconds(120), h.clock.now());
        h.store.insert_ride(&ride, &request).await.unwrap();
        ride
    }

    fn offer(driver_id: DriverId, distance: f64) -> CallOffer {
        CallOffer {
            driver_id,
            driver_location: testing::location_north_of(&testing::pickup(), distance),
            distance_to_pickup_meters: distance,
            estimated_arrival_seconds: (distance / 8.33) as u32,
            estimated_fare: 12.0,
        }
    }

    #[tokio::test]
    async fn test_create_calls_in_rank_order() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let (d1, d2) = (DriverId::new(), DriverId::new());

        let calls = h
            .calls
            .create_calls(ride.id, &[offer(d1, 500.0), offer(d2, 2500.0)])
            .await
            .unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].driver_id, calls[0].sequence_number), (d1, 1));
        assert_eq!((calls[1].driver_id, calls[1].sequence_number), (d2, 2));
        assert_eq!(calls[0].expires_at, testing::t0() + Duration::seconds(20));
        assert_eq!(h.publisher.published_on(crate::event::topics::DRIVER_CALL_REQUEST).len(), 1);
    }

    #[tokio::test]
    async fn test_slower_rank_can_win_and_siblings_are_cancelled() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let (d1, d2) = (DriverId::new(), DriverId::new());
        let calls = h
            .calls
            .create_calls(ride.id, &[offer(d1, 500.0), offer(d2, 2500.0)])
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(5));
        let acceptance = h.calls.accept(calls[1].id, d2).await.unwrap();
        assert_eq!(acceptance.call.status, DriverCallStatus::Accepted);
        assert_eq!(acceptance.ride.status, RideStatus::DriverAssigned);
        assert_eq!(acceptance.ride.driver_id, Some(d2));

        let stored = h.store.get_call(calls[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, DriverCallStatus::Cancelled);

        let ride = h.store.get_ride(ride.id).await.unwrap().unwrap();
        let statuses: Vec<RideStatus> = ride.transitions.iter().map(|t| t.to_status).collect();
        assert_eq!(
            statuses,
            vec![RideStatus::Requested, RideStatus::Matched, RideStatus::DriverAssigned]
        );

        h.clock.advance(Duration::seconds(1));
        assert_matches!(
            h.calls.accept(calls[0].id, d1).await,
            Err(DispatchError::InvalidDriverCallState { .. })
        );
        assert_eq!(h.publisher.published_on(crate::event::topics::RIDE_MATCHED).len(), 1);
    }

    #[tokio::test]
    async fn test_accept_after_deadline_fails_without_sweep() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let driver = DriverId::new();
        let calls = h.calls.create_calls(ride.id, &[offer(driver, 300.0)]).await.unwrap();

        h.clock.advance(Duration::seconds(20));
        assert_matches!(
            h.calls.accept(calls[0].id, driver).await,
            Err(DispatchError::DriverCallExpired(_))
        );
        let stored = h.store.get_call(calls[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, DriverCallStatus::Pending);
    }

    #[tokio::test]
    async fn test_accept_by_other_driver_is_refused() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let calls = h
            .calls
            .create_calls(ride.id, &[offer(DriverId::new(), 300.0)])
            .await
            .unwrap();

        assert_matches!(
            h.calls.accept(calls[0].id, DriverId::new()).await,
            Err(DispatchError::Validation(_))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_accepts_have_single_winner() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let drivers: Vec<DriverId> = (0..8).map(|_| DriverId::new()).collect();
        let offers: Vec<CallOffer> = drivers
            .iter()
            .enumerate()
            .map(|(i, d)| offer(*d, 100.0 * (i as f64 + 1.0)))
            .collect();
        let calls = h.calls.create_calls(ride.id, &offers).await.unwrap();

        let mut handles = Vec::new();
        for call in calls.clone() {
            let service = h.calls.clone();
            handles.push(tokio::spawn(async move { service.accept(call.id, call.driver_id).await }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(acceptance) = handle.await.unwrap() {
                winners.push(acceptance.call.driver_id);
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = h.store.calls_for_ride(ride.id).await.unwrap();
        let accepted: Vec<_> = stored.iter().filter(|c| c.status == DriverCallStatus::Accepted).collect();
        assert_eq!(accepted.len(), 1);
        assert!(stored
            .iter()
            .filter(|c| c.status != DriverCallStatus::Accepted)
            .all(|c| c.status == DriverCallStatus::Cancelled));

        let ride = h.store.get_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(ride.status, RideStatus::DriverAssigned);
        assert_eq!(ride.driver_id, Some(winners[0]));
    }

    #[tokio::test]
    async fn test_reject_leaves_siblings_pending() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let (d1, d2) = (DriverId::new(), DriverId::new());
        let calls = h
            .calls
            .create_calls(ride.id, &[offer(d1, 500.0), offer(d2, 900.0)])
            .await
            .unwrap();

        let rejected = h.calls.reject(calls[0].id, d1).await.unwrap();
        assert_eq!(rejected.status, DriverCallStatus::Rejected);
        let sibling = h.store.get_call(calls[1].id).await.unwrap().unwrap();
        assert_eq!(sibling.status, DriverCallStatus::Pending);

        assert_matches!(
            h.calls.reject(calls[0].id, d1).await,
            Err(DispatchError::InvalidDriverCallState { .. })
        );
    }

    #[tokio::test]
    async fn test_expiry_sweep_is_idempotent() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        h.calls
            .create_calls(ride.id, &[offer(DriverId::new(), 500.0), offer(DriverId::new(), 900.0)])
            .await
            .unwrap();

        assert!(h.calls.expire_old_calls().await.unwrap().is_empty());
        h.clock.advance(Duration::seconds(21));
        assert_eq!(h.calls.expire_old_calls().await.unwrap().len(), 2);
        assert!(h.calls.expire_old_calls().await.unwrap().is_empty());
        let calls = h.calls.calls_for_ride(ride.id).await.unwrap();
        assert!(calls.iter().all(|c| c.status == DriverCallStatus::Expired));
    }

    #[tokio::test]
    async fn test_cancel_pending_spares_excluded_driver() {
        let h = testing::harness();
        let ride = seeded_ride(&h).await;
        let (d1, d2) = (DriverId::new(), DriverId::new());
        h.calls
            .create_calls(ride.id, &[offer(d1, 500.0), offer(d2, 900.0)])
            .await
            .unwrap();

        let cancelled = h.calls.cancel_pending_calls_for_ride(ride.id, Some(d2)).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].driver_id, d1);

        let rest = h.calls.cancel_all_calls_for_ride(ride.id).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].driver_id, d2);
    }

    #[tokio::test]
    async fn test_acceptance_rate_needs_enough_samples() {
        let h = testing::harness();
        let driver = DriverId::new();

        assert_eq!(h.calls.get_driver_acceptance_rate(driver, 0.8).await.unwrap(), 0.8);

        // five answered offers, one accepted
        for i in 0..5 {
            let ride = seeded_ride(&h).await;
            let calls = h.calls.create_calls(ride.id, &[offer(driver, 400.0)]).await.unwrap();
            if i == 0 {
                h.calls.accept(calls[0].id, driver).await.unwrap();
            } else {
                h.calls.reject(calls[0].id, driver).await.unwrap();
            }
        }
        assert_eq!(h.calls.get_driver_acceptance_rate(driver, 0.8).await.unwrap(), 0.2);
    }
}
