//! Batch matching engine
//!
//! One run claims the oldest PENDING matching requests, looks up nearby
//! drivers once per pickup cell, ranks them and offers the ride to the top
//! candidates. Only one instance in the cluster runs a batch at a time.
//!
//! A failure on one request marks that request FAILED and the run moves on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{geo, Clock, DriverId};
use config::MatchingConfig;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::location::{LocationClient, NearbyDriver};
use crate::clients::{with_timeout, ClientResult};
use crate::domain::{
    DriverCall, DriverCallStatus, MatchingRequest, MatchingStatus, Ride, RideStatus, NO_DRIVER_REASON,
};
use crate::driver_call::{finish, load_locked, CallOffer, DriverCallService};
use crate::error::{DispatchError, Result};
use crate::event::DispatchEvent;
use crate::fare::FareEstimator;
use crate::lock::BatchLock;
use crate::metrics::EngineMetrics;
use crate::publisher::EventBus;
use crate::scoring::{Candidate, ScoredCandidate, Scorer};
use crate::store::{MatchingRequestStore, RideStore, RideTransaction};

pub const MATCHING_TIMEOUT_REASON: &str = "matching timed out";

/// Summary of one batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub batch_id: Option<Uuid>,
    /// Another instance held the batch lock
    pub skipped: bool,
    pub claimed: usize,
    pub matched: usize,
    pub no_driver: usize,
    pub failed: usize,
    /// Requests whose ride had already left REQUESTED
    pub closed: usize,
    /// Claimed request ids, oldest first
    pub request_ids: Vec<Uuid>,
}

impl BatchReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Requeued(MatchingRequest),
    Refused { reason: String },
}

enum RequestOutcome {
    Matched,
    NoDriver,
    Closed,
}

struct TimedOut {
    ride: Ride,
    request: Option<MatchingRequest>,
    cancelled: Vec<DriverCall>,
    transitions_before: usize,
}

pub struct MatchingEngine {
    config: MatchingConfig,
    instance_id: String,
    rides: Arc<dyn RideStore>,
    requests: Arc<dyn MatchingRequestStore>,
    location: Arc<dyn LocationClient>,
    lock: Arc<dyn BatchLock>,
    calls: Arc<DriverCallService>,
    fares: Arc<FareEstimator>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    scorer: Scorer,
}

impl MatchingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MatchingConfig,
        instance_id: String,
        rides: Arc<dyn RideStore>,
        requests: Arc<dyn MatchingRequestStore>,
        location: Arc<dyn LocationClient>,
        lock: Arc<dyn BatchLock>,
        calls: Arc<DriverCallService>,
        fares: Arc<FareEstimator>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let scorer = Scorer::new(config.weights.clone(), config.max_search_radius_meters);
        Self {
            config,
            instance_id,
            rides,
            requests,
            location,
            lock,
            calls,
            fares,
            bus,
            clock,
            metrics,
            scorer,
        }
    }

    /// Run one batch if this instance can take the cluster-wide batch lock
    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let lease_length = Duration::from_millis(self.config.lock_lease_ms);
        let Some(lease) = self
            .lock
            .try_acquire(&self.config.lock_key, &self.instance_id, lease_length)
            .await?
        else {
            self.metrics.batch_runs_skipped.increment();
            debug!("Batch lock held by another instance, skipping run");
            return Ok(BatchReport::skipped());
        };

        let started = Instant::now();
        let result = self.process_batch().await;
        self.metrics.record_batch_latency(started.elapsed());

        match self.lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %lease.key, "Batch lease ran out before release"),
            Err(e) => warn!(error = %e, "Failed to release batch lock"),
        }
        result
    }

    /// Claim and match one page of pending requests. Callers must hold the batch lock.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let now = self.clock.now();
        let batch_id = Uuid::new_v4();
        let min_age = chrono::Duration::milliseconds(self.config.min_request_age_ms as i64);

        let claimed = self
            .requests
            .claim_pending(self.config.batch_size, now - min_age, batch_id, now)
            .await?;
        self.metrics.batch_runs.increment();

        let mut report = BatchReport {
            batch_id: Some(batch_id),
            claimed: claimed.len(),
            request_ids: claimed.iter().map(|r| r.id).collect(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        self.metrics.requests_claimed.add(claimed.len() as u64);

        let lookups = self.lookup_drivers(&claimed).await;
        let mut offered_in_batch: HashSet<DriverId> = HashSet::new();

        for request in &claimed {
            let outcome = match lookups.get(&request.pickup_cell) {
                Some(drivers) => {
                    self.process_request(request, drivers, &mut offered_in_batch, batch_id)
                        .await
                }
                None => Err(DispatchError::Internal(format!(
                    "no driver lookup for cell {}",
                    request.pickup_cell
                ))),
            };

            match outcome {
                Ok(RequestOutcome::Matched) => {
                    report.matched += 1;
                    self.metrics.requests_matched.increment();
                }
                Ok(RequestOutcome::NoDriver) => {
                    report.no_driver += 1;
                    self.metrics.requests_no_driver.increment();
                }
                Ok(RequestOutcome::Closed) => report.closed += 1,
                Err(e) => {
                    report.failed += 1;
                    self.fail_request(request, batch_id, &e).await;
                }
            }
        }

        info!(
            batch_id = %batch_id,
            claimed = report.claimed,
            matched = report.matched,
            no_driver = report.no_driver,
            failed = report.failed,
            "Batch run finished"
        );
        Ok(report)
    }

    /// One location query per distinct pickup cell, covering its neighborhood ring
    async fn lookup_drivers(&self, claimed: &[MatchingRequest]) -> HashMap<String, ClientResult<Vec<NearbyDriver>>> {
        let mut per_cell: BTreeMap<&str, u32> = BTreeMap::new();
        for request in claimed {
            *per_cell.entry(request.pickup_cell.as_str()).or_insert(0) += 1;
        }

        let timeout = Duration::from_millis(self.config.external_call_timeout_ms);
        let lookups = per_cell.into_iter().map(|(cell, requests)| async move {
            let cells = geo::neighborhood(cell, self.config.search_ring);
            let limit = self.config.candidate_limit.saturating_mul(requests);
            let result = with_timeout(
                timeout,
                self.location.find_nearby_available_drivers(&cells, limit),
            )
            .await;
            if let Err(e) = &result {
                warn!(geo_cell = cell, error = %e, "Driver lookup failed");
            }
            (cell.to_string(), result)
        });

        join_all(lookups).await.into_iter().collect()
    }

    async fn process_request(
        &self,
        request: &MatchingRequest,
        drivers: &ClientResult<Vec<NearbyDriver>>,
        offered_in_batch: &mut HashSet<DriverId>,
        batch_id: Uuid,
    ) -> Result<RequestOutcome> {
        let now = self.clock.now();
        let ride = self
            .rides
            .get_ride(request.ride_id)
            .await?
            .ok_or(DispatchError::RideNotFound(request.ride_id))?;

        if ride.status != RideStatus::Requested {
            let mut closed = request.clone();
            closed.close(format!("ride is {}", ride.status), now);
            self.requests.save_request(&closed, MatchingStatus::Processing).await?;
            return Ok(RequestOutcome::Closed);
        }

        let nearby = drivers
            .as_ref()
            .map_err(|e| DispatchError::ExternalService(format!("location lookup: {}", e)))?;
        let ranked = self.rank_candidates(&ride, nearby, offered_in_batch).await?;

        let Some(top) = ranked.first() else {
            let mut failed = request.clone();
            failed.record_no_driver(now)?;
            if self.requests.save_request(&failed, MatchingStatus::Processing).await? {
                debug!(ride_id = %ride.id, "No eligible drivers");
                self.bus
                    .publish(DispatchEvent::matching_failed(&failed, Some(batch_id), NO_DRIVER_REASON, now))
                    .await;
            }
            return Ok(RequestOutcome::NoDriver);
        };

        let offers: Vec<CallOffer> = ranked
            .iter()
            .map(|c| {
                CallOffer::from_candidate(c, self.fares.travel_seconds(c.distance_meters), ride.fare.estimated())
            })
            .collect();

        let mut tx = self.rides.begin().await?;
        let staged = self.stage_offers(tx.as_mut(), request, &offers, now).await;
        let (calls, completed) = finish(tx, staged).await?;

        offered_in_batch.extend(calls.iter().map(|c| c.driver_id));
        self.calls.announce_calls(ride.id, &calls).await;
        self.bus
            .publish(DispatchEvent::matching_success(
                &completed,
                batch_id,
                top.driver_id,
                top.score,
                calls.len(),
                now,
            ))
            .await;
        Ok(RequestOutcome::Matched)
    }

    /// Filter the looked-up drivers for this ride and rank the survivors
    async fn rank_candidates(
        &self,
        ride: &Ride,
        nearby: &[NearbyDriver],
        offered_in_batch: &HashSet<DriverId>,
    ) -> Result<Vec<ScoredCandidate>> {
        let previously_offered: HashSet<DriverId> = self
            .calls
            .calls_for_ride(ride.id)
            .await?
            .into_iter()
            .map(|c| c.driver_id)
            .collect();

        let eligible: Vec<&NearbyDriver> = nearby
            .iter()
            .filter(|d| d.vehicle_type == ride.vehicle_type)
            .filter(|d| !previously_offered.contains(&d.driver_id))
            .filter(|d| !offered_in_batch.contains(&d.driver_id))
            .filter(|d| d.location.distance_meters_to(&ride.pickup) <= self.scorer.max_radius_meters())
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<DriverId> = eligible.iter().map(|d| d.driver_id).collect();
        let busy = self.calls.busy_drivers(&ids).await?;

        let mut candidates = Vec::with_capacity(eligible.len());
        for driver in eligible.into_iter().filter(|d| !busy.contains(&d.driver_id)) {
            let rate = self
                .calls
                .get_driver_acceptance_rate(driver.driver_id, driver.acceptance_rate)
                .await?;
            candidates.push(Candidate::from_nearby(driver, &ride.pickup, rate));
        }

        Ok(self
            .scorer
            .rank(candidates, self.config.max_calls_per_request as usize))
    }

    /// Create the calls and complete the request in one commit
    async fn stage_offers(
        &self,
        tx: &mut dyn RideTransaction,
        request: &MatchingRequest,
        offers: &[CallOffer],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(Vec<DriverCall>, MatchingRequest)> {
        let ride = load_locked(tx, request.ride_id).await?;
        let mut current = tx
            .latest_request_for_ride(request.ride_id)
            .await?
            .filter(|r| r.id == request.id)
            .ok_or_else(|| {
                DispatchError::ConcurrentModification(format!("matching request {} was superseded", request.id))
            })?;
        current.complete(now)?;

        let calls = self.calls.stage_calls(tx, &ride, offers, now).await?;
        tx.save_request(&current).await?;
        Ok((calls, current))
    }

    async fn fail_request(&self, request: &MatchingRequest, batch_id: Uuid, cause: &DispatchError) {
        warn!(
            request_id = %request.id,
            ride_id = %request.ride_id,
            batch_id = %batch_id,
            error = %cause,
            "Matching request failed"
        );
        self.metrics.requests_failed.increment();

        let now = self.clock.now();
        let reason = cause.to_string();
        let mut failed = request.clone();
        if failed.fail(reason.clone(), now).is_err() {
            return;
        }

        match self.requests.save_request(&failed, MatchingStatus::Processing).await {
            Ok(true) => {
                self.bus
                    .publish(DispatchEvent::matching_failed(&failed, Some(batch_id), &reason, now))
                    .await;
            }
            Ok(false) => debug!(request_id = %request.id, "Request changed concurrently, leaving it"),
            Err(e) => error!(request_id = %request.id, error = %e, "Could not record matching failure"),
        }
    }

    /// Put a FAILED request back in the queue.
    ///
    /// Refused without any change when the ride is no longer REQUESTED, the
    /// deadline passed, or the retry bound is reached.
    #[instrument(skip(self), fields(ride_id = %ride_id))]
    pub async fn retry_matching(&self, ride_id: Uuid) -> Result<RetryOutcome> {
        let now = self.clock.now();
        let max_retry_count = self.config.max_retry_count;
        let mut tx = self.rides.begin().await?;

        let staged = async {
            let ride = load_locked(tx.as_mut(), ride_id).await?;
            let mut request = tx
                .latest_request_for_ride(ride_id)
                .await?
                .ok_or(DispatchError::MatchingRequestNotFound(ride_id))?;

            let refusal = if ride.status != RideStatus::Requested {
                Some(format!("ride is {}", ride.status))
            } else if request.status != MatchingStatus::Failed {
                Some(format!("matching request is {}", request.status))
            } else if request.retry_count >= max_retry_count {
                Some("max retry count exceeded".to_string())
            } else if request.expires_at <= now {
                Some("matching deadline has passed".to_string())
            } else {
                None
            };
            if let Some(reason) = refusal {
                return Ok(RetryOutcome::Refused { reason });
            }

            request.reset_for_retry(max_retry_count)?;
            tx.save_request(&request).await?;
            Ok::<_, DispatchError>(RetryOutcome::Requeued(request))
        }
        .await;
        let outcome = finish(tx, staged).await?;

        match &outcome {
            RetryOutcome::Requeued(request) => {
                self.metrics.requests_retried.increment();
                info!(retry_count = request.retry_count, "Matching request re-queued");
            }
            RetryOutcome::Refused { reason } => debug!(reason = %reason, "Retry refused"),
        }
        Ok(outcome)
    }

    /// Fail a ride that waited too long for a driver, together with its
    /// matching request and outstanding offers. Returns false if the ride was
    /// no longer waiting.
    #[instrument(skip(self), fields(ride_id = %ride_id))]
    pub async fn handle_matching_timeout(&self, ride_id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        let mut tx = self.rides.begin().await?;
        let staged = self.stage_timeout(tx.as_mut(), ride_id, now).await;
        let Some(timed_out) = finish(tx, staged).await? else {
            return Ok(false);
        };

        self.metrics.requests_timed_out.increment();
        info!("Matching timed out, ride failed");

        self.calls.announce_cancelled(&timed_out.cancelled).await;
        let mut events = DispatchEvent::transitions_since(&timed_out.ride, timed_out.transitions_before);
        events.push(DispatchEvent::request_expired(
            &timed_out.ride,
            timed_out.request.as_ref(),
            now,
        ));
        self.bus.publish_all(events).await;
        Ok(true)
    }

    async fn stage_timeout(
        &self,
        tx: &mut dyn RideTransaction,
        ride_id: Uuid,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<TimedOut>> {
        let mut ride = load_locked(tx, ride_id).await?;
        let latest = tx.latest_request_for_ride(ride_id).await?;

        if ride.status != RideStatus::Requested {
            // a request left open behind a ride that moved on is closed quietly
            if let Some(mut request) = latest.filter(|r| r.status.is_open()) {
                request.close(format!("ride is {}", ride.status), now);
                tx.save_request(&request).await?;
            }
            return Ok(None);
        }

        let transitions_before = ride.transitions.len();
        ride.fail(MATCHING_TIMEOUT_REASON, now)?;
        let cancelled = self.calls.stage_cancel_pending(tx, ride_id, None, now).await?;

        let request = match latest {
            Some(mut request) => {
                request.close(MATCHING_TIMEOUT_REASON, now);
                tx.save_request(&request).await?;
                Some(request)
            }
            None => None,
        };
        tx.save_ride(&mut ride).await?;

        Ok(Some(TimedOut {
            ride,
            request,
            cancelled,
            transitions_before,
        }))
    }

    /// Time out rides whose request deadline passed or that have been
    /// REQUESTED longer than the request TTL
    #[instrument(skip(self))]
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let now = self.clock.now();
        let ttl = chrono::Duration::seconds(self.config.request_ttl_seconds as i64);

        let mut ride_ids: Vec<Uuid> = self
            .requests
            .find_expired(now, self.config.batch_size)
            .await?
            .into_iter()
            .map(|r| r.ride_id)
            .collect();
        ride_ids.extend(
            self.rides
                .rides_requested_before(now - ttl, self.config.batch_size)
                .await?,
        );
        let mut seen = HashSet::new();
        ride_ids.retain(|id| seen.insert(*id));

        let mut timed_out = 0;
        for ride_id in ride_ids {
            match self.handle_matching_timeout(ride_id).await {
                Ok(true) => timed_out += 1,
                Ok(false) => {}
                Err(e) => warn!(ride_id = %ride_id, error = %e, "Timeout handling failed"),
            }
        }
        Ok(timed_out)
    }

    /// Queue a fresh request for a REQUESTED ride whose offers were all
    /// declined or expired. Drivers already offered the ride are skipped by
    /// the next batch.
    #[instrument(skip(self), fields(ride_id = %ride_id))]
    pub async fn redispatch_if_exhausted(&self, ride_id: Uuid) -> Result<Option<MatchingRequest>> {
        let now = self.clock.now();
        let max_retry_count = self.config.max_retry_count;
        let mut tx = self.rides.begin().await?;

        let staged = async {
            let ride = load_locked(tx.as_mut(), ride_id).await?;
            if ride.status != RideStatus::Requested {
                return Ok(None);
            }

            let calls = tx.calls_for_ride(ride_id).await?;
            let exhausted = !calls.is_empty()
                && calls.iter().all(|c| {
                    matches!(
                        c.status,
                        DriverCallStatus::Rejected | DriverCallStatus::Expired | DriverCallStatus::Cancelled
                    )
                });
            if !exhausted {
                return Ok(None);
            }

            let Some(latest) = tx.latest_request_for_ride(ride_id).await? else {
                return Ok(None);
            };
            if latest.status != MatchingStatus::Completed
                || latest.retry_count >= max_retry_count
                || latest.expires_at <= now
            {
                return Ok(None);
            }

            let next = MatchingRequest::redispatch(&latest, now);
            tx.save_request(&next).await?;
            Ok::<_, DispatchError>(Some(next))
        }
        .await;
        let next = finish(tx, staged).await?;

        if let Some(request) = &next {
            self.metrics.requests_redispatched.increment();
            info!(retry_count = request.retry_count, "Offers exhausted, ride re-dispatched");
            self.bus.publish(DispatchEvent::request_created(request)).await;
        }
        Ok(next)
    }

    /// Expire overdue offers and re-dispatch the rides left without one
    pub async fn expire_offers(&self) -> Result<usize> {
        let expired = self.calls.expire_old_calls().await?;
        let ride_ids: HashSet<Uuid> = expired.iter().map(|c| c.ride_id).collect();

        let mut redispatched = 0;
        for ride_id in ride_ids {
            match self.redispatch_if_exhausted(ride_id).await {
                Ok(Some(_)) => redispatched += 1,
                Ok(None) => {}
                Err(e) => warn!(ride_id = %ride_id, error = %e, "Re-dispatch failed"),
            }
        }
        Ok(redispatched)
    }

    /// Re-queue FAILED requests whose backoff elapsed and that have retries left
    #[instrument(skip(self))]
    pub async fn retry_failed_requests(&self) -> Result<usize> {
        let now = self.clock.now();
        let backoff = chrono::Duration::seconds(self.config.retry_backoff_seconds as i64);
        let retryable = self
            .requests
            .find_retryable(self.config.max_retry_count, now - backoff, now, self.config.batch_size)
            .await?;

        let mut requeued = 0;
        for request in retryable {
            match self.retry_matching(request.ride_id).await {
                Ok(RetryOutcome::Requeued(_)) => requeued += 1,
                Ok(RetryOutcome::Refused { .. }) => {}
                Err(e) => warn!(ride_id = %request.ride_id, error = %e, "Automatic retry failed"),
            }
        }
        Ok(requeued)
    }

    /// Delete finished requests older than the retention window
    pub async fn purge_expired_requests(&self) -> Result<u64> {
        let cutoff = self.clock.now() - chrono::Duration::hours(self.config.retention_hours as i64);
        let deleted = self.requests.delete_terminal_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "Purged finished matching requests");
        }
        Ok(deleted)
    }
}
