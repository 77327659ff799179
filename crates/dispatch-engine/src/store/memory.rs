//! In-memory dispatch store for development and tests
//!
//! All aggregates share one state map. Ride transactions take a per-ride async
//! mutex, stage their writes and apply them under the state write lock at commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DriverId, PassengerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::domain::{
    DriverCall, DriverCallStatus, MatchingRequest, MatchingStatus, Ride, RideStatus, SurgePrice,
};
use crate::store::traits::{
    DriverCallStore, MatchingRequestStore, RideStore, RideTransaction, StoreError, StoreResult,
    SurgePriceStore,
};

#[derive(Default)]
struct State {
    rides: HashMap<Uuid, Ride>,
    calls: HashMap<Uuid, DriverCall>,
    requests: HashMap<Uuid, MatchingRequest>,
    surge: Vec<SurgePrice>,
}

type RideLocks = Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>;

/// In-memory store implementing every repository trait
#[derive(Clone, Default)]
pub struct InMemoryDispatchStore {
    state: Arc<RwLock<State>>,
    ride_locks: RideLocks,
}

impl InMemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rides held
    pub fn ride_count(&self) -> usize {
        self.state.read().rides.len()
    }
}

fn latest_of<'a>(requests: impl Iterator<Item = &'a MatchingRequest>) -> Option<&'a MatchingRequest> {
    requests.max_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then(a.retry_count.cmp(&b.retry_count))
    })
}

fn sort_calls(calls: &mut [DriverCall]) {
    calls.sort_by(|a, b| {
        a.offered_at
            .cmp(&b.offered_at)
            .then(a.sequence_number.cmp(&b.sequence_number))
    });
}

// ==================== Ride Transaction ====================

struct InMemoryRideTransaction {
    state: Arc<RwLock<State>>,
    ride_locks: RideLocks,
    guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    /// Staged ride writes with the version they were read at
    rides: HashMap<Uuid, (i64, Ride)>,
    calls: HashMap<Uuid, DriverCall>,
    requests: HashMap<Uuid, MatchingRequest>,
    seen_calls: HashMap<Uuid, DriverCallStatus>,
    seen_requests: HashMap<Uuid, MatchingStatus>,
}

impl InMemoryRideTransaction {
    fn new(store: &InMemoryDispatchStore) -> Self {
        Self {
            state: Arc::clone(&store.state),
            ride_locks: Arc::clone(&store.ride_locks),
            guards: HashMap::new(),
            rides: HashMap::new(),
            calls: HashMap::new(),
            requests: HashMap::new(),
            seen_calls: HashMap::new(),
            seen_requests: HashMap::new(),
        }
    }

    fn observe_call(&mut self, call: &DriverCall) {
        self.seen_calls.entry(call.id).or_insert(call.status);
    }

    fn observe_request(&mut self, request: &MatchingRequest) {
        self.seen_requests.entry(request.id).or_insert(request.status);
    }

    /// Check every staged write against the current state
    fn validate(&self, state: &State) -> StoreResult<()> {
        for (ride_id, (expected, _)) in &self.rides {
            match state.rides.get(ride_id) {
                Some(stored) if stored.version == *expected => {}
                Some(_) => {
                    return Err(StoreError::VersionConflict {
                        ride_id: *ride_id,
                        expected: *expected,
                    })
                }
                None => return Err(StoreError::Conflict(format!("ride {} does not exist", ride_id))),
            }
        }

        for call_id in self.calls.keys() {
            if let (Some(seen), Some(stored)) = (self.seen_calls.get(call_id), state.calls.get(call_id)) {
                if stored.status != *seen {
                    return Err(StoreError::Conflict(format!(
                        "driver call {} changed from {} to {}",
                        call_id, seen, stored.status
                    )));
                }
            }
        }

        for request_id in self.requests.keys() {
            if let (Some(seen), Some(stored)) =
                (self.seen_requests.get(request_id), state.requests.get(request_id))
            {
                if stored.status != *seen {
                    return Err(StoreError::Conflict(format!(
                        "matching request {} changed from {} to {}",
                        request_id, seen, stored.status
                    )));
                }
            }
        }
        Ok(())
    }

    fn release_locks(&mut self) {
        let ids: Vec<Uuid> = self.guards.keys().copied().collect();
        self.guards.clear();

        let mut locks = self.ride_locks.lock();
        for id in ids {
            if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(&id);
            }
        }
    }
}

impl Drop for InMemoryRideTransaction {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[async_trait]
impl RideTransaction for InMemoryRideTransaction {
    async fn lock_ride(&mut self, ride_id: Uuid) -> StoreResult<Option<Ride>> {
        if !self.guards.contains_key(&ride_id) {
            let lock = {
                let mut locks = self.ride_locks.lock();
                Arc::clone(locks.entry(ride_id).or_default())
            };
            let guard = lock.lock_owned().await;
            self.guards.insert(ride_id, guard);
        }

        if let Some((_, staged)) = self.rides.get(&ride_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.state.read().rides.get(&ride_id).cloned())
    }

    async fn save_ride(&mut self, ride: &mut Ride) -> StoreResult<()> {
        if !self.guards.contains_key(&ride.id) {
            return Err(StoreError::Other(format!("ride {} was not locked", ride.id)));
        }
        let expected = self
            .rides
            .get(&ride.id)
            .map(|(expected, _)| *expected)
            .unwrap_or(ride.version);
        ride.version += 1;
        self.rides.insert(ride.id, (expected, ride.clone()));
        Ok(())
    }

    async fn get_call(&mut self, call_id: Uuid) -> StoreResult<Option<DriverCall>> {
        if let Some(staged) = self.calls.get(&call_id) {
            return Ok(Some(staged.clone()));
        }
        let stored = self.state.read().calls.get(&call_id).cloned();
        if let Some(call) = &stored {
            self.observe_call(call);
        }
        Ok(stored)
    }

    async fn calls_for_ride(&mut self, ride_id: Uuid) -> StoreResult<Vec<DriverCall>> {
        let stored: Vec<DriverCall> = self
            .state
            .read()
            .calls
            .values()
            .filter(|c| c.ride_id == ride_id)
            .cloned()
            .collect();

        let mut merged: HashMap<Uuid, DriverCall> = HashMap::new();
        for call in stored {
            self.observe_call(&call);
            merged.insert(call.id, call);
        }
        for staged in self.calls.values().filter(|c| c.ride_id == ride_id) {
            merged.insert(staged.id, staged.clone());
        }

        let mut calls: Vec<DriverCall> = merged.into_values().collect();
        sort_calls(&mut calls);
        Ok(calls)
    }

    async fn save_calls(&mut self, calls: &[DriverCall]) -> StoreResult<()> {
        for call in calls {
            self.calls.insert(call.id, call.clone());
        }
        Ok(())
    }

    async fn latest_request_for_ride(&mut self, ride_id: Uuid) -> StoreResult<Option<MatchingRequest>> {
        let stored = {
            let state = self.state.read();
            latest_of(state.requests.values().filter(|r| r.ride_id == ride_id)).cloned()
        };
        if let Some(request) = &stored {
            self.observe_request(request);
        }

        let staged = latest_of(self.requests.values().filter(|r| r.ride_id == ride_id)).cloned();
        let latest = match (stored, staged) {
            (Some(stored), Some(staged)) => {
                if staged.id == stored.id || staged.requested_at >= stored.requested_at {
                    Some(staged)
                } else {
                    Some(stored)
                }
            }
            (stored, staged) => staged.or(stored),
        };
        Ok(latest)
    }

    async fn save_request(&mut self, request: &MatchingRequest) -> StoreResult<()> {
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        {
            let shared = Arc::clone(&self.state);
            let mut state = shared.write();
            self.validate(&state)?;

            for (_, (_, ride)) in self.rides.drain() {
                state.rides.insert(ride.id, ride);
            }
            for (id, call) in self.calls.drain() {
                state.calls.insert(id, call);
            }
            for (id, request) in self.requests.drain() {
                state.requests.insert(id, request);
            }
        }
        self.release_locks();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.release_locks();
        Ok(())
    }
}

// ==================== Repository Traits ====================

#[async_trait]
impl RideStore for InMemoryDispatchStore {
    async fn insert_ride(&self, ride: &Ride, request: &MatchingRequest) -> StoreResult<()> {
        let mut state = self.state.write();
        if state
            .rides
            .values()
            .any(|r| r.passenger_id == ride.passenger_id && !r.is_terminal())
        {
            return Err(StoreError::Conflict(format!(
                "passenger {} already has an active ride",
                ride.passenger_id
            )));
        }
        if state.rides.contains_key(&ride.id) {
            return Err(StoreError::Conflict(format!("ride {} already exists", ride.id)));
        }

        state.rides.insert(ride.id, ride.clone());
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_ride(&self, ride_id: Uuid) -> StoreResult<Option<Ride>> {
        Ok(self.state.read().rides.get(&ride_id).cloned())
    }

    async fn active_ride_for_passenger(&self, passenger_id: PassengerId) -> StoreResult<Option<Ride>> {
        Ok(self
            .state
            .read()
            .rides
            .values()
            .find(|r| r.passenger_id == passenger_id && !r.is_terminal())
            .cloned())
    }

    async fn rides_requested_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Uuid>> {
        let state = self.state.read();
        let mut rides: Vec<&Ride> = state
            .rides
            .values()
            .filter(|r| r.status == RideStatus::Requested && r.requested_at < cutoff)
            .collect();
        rides.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        Ok(rides.into_iter().take(limit as usize).map(|r| r.id).collect())
    }

    async fn begin(&self) -> StoreResult<Box<dyn RideTransaction>> {
        Ok(Box::new(InMemoryRideTransaction::new(self)))
    }
}

#[async_trait]
impl DriverCallStore for InMemoryDispatchStore {
    async fn get_call(&self, call_id: Uuid) -> StoreResult<Option<DriverCall>> {
        Ok(self.state.read().calls.get(&call_id).cloned())
    }

    async fn calls_for_ride(&self, ride_id: Uuid) -> StoreResult<Vec<DriverCall>> {
        let mut calls: Vec<DriverCall> = self
            .state
            .read()
            .calls
            .values()
            .filter(|c| c.ride_id == ride_id)
            .cloned()
            .collect();
        sort_calls(&mut calls);
        Ok(calls)
    }

    async fn pending_calls_for_driver(&self, driver_id: DriverId) -> StoreResult<Vec<DriverCall>> {
        let mut calls: Vec<DriverCall> = self
            .state
            .read()
            .calls
            .values()
            .filter(|c| c.driver_id == driver_id && c.status == DriverCallStatus::Pending)
            .cloned()
            .collect();
        sort_calls(&mut calls);
        Ok(calls)
    }

    async fn drivers_with_pending_calls(&self, drivers: &[DriverId]) -> StoreResult<HashSet<DriverId>> {
        let wanted: HashSet<&DriverId> = drivers.iter().collect();
        Ok(self
            .state
            .read()
            .calls
            .values()
            .filter(|c| c.status == DriverCallStatus::Pending && wanted.contains(&c.driver_id))
            .map(|c| c.driver_id)
            .collect())
    }

    async fn expire_calls(&self, now: DateTime<Utc>) -> StoreResult<Vec<DriverCall>> {
        let mut state = self.state.write();
        let mut expired = Vec::new();
        for call in state.calls.values_mut() {
            if call.status == DriverCallStatus::Pending && call.expires_at < now && call.expire(now).is_ok() {
                expired.push(call.clone());
            }
        }
        sort_calls(&mut expired);
        Ok(expired)
    }

    async fn acceptance_stats(&self, driver_id: DriverId, since: DateTime<Utc>) -> StoreResult<(u64, u64)> {
        let state = self.state.read();
        let mut answered = 0;
        let mut accepted = 0;
        for call in state
            .calls
            .values()
            .filter(|c| c.driver_id == driver_id && c.offered_at >= since)
        {
            match call.status {
                DriverCallStatus::Accepted => {
                    answered += 1;
                    accepted += 1;
                }
                DriverCallStatus::Rejected | DriverCallStatus::Expired => answered += 1,
                DriverCallStatus::Pending | DriverCallStatus::Cancelled => {}
            }
        }
        Ok((answered, accepted))
    }
}

#[async_trait]
impl MatchingRequestStore for InMemoryDispatchStore {
    async fn get_request(&self, request_id: Uuid) -> StoreResult<Option<MatchingRequest>> {
        Ok(self.state.read().requests.get(&request_id).cloned())
    }

    async fn latest_request_for_ride(&self, ride_id: Uuid) -> StoreResult<Option<MatchingRequest>> {
        let state = self.state.read();
        Ok(latest_of(state.requests.values().filter(|r| r.ride_id == ride_id)).cloned())
    }

    async fn claim_pending(
        &self,
        limit: u32,
        older_than: DateTime<Utc>,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchingRequest>> {
        let mut state = self.state.write();
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = state
            .requests
            .values()
            .filter(|r| r.status == MatchingStatus::Pending && r.requested_at <= older_than)
            .map(|r| (r.requested_at, r.id))
            .collect();
        ids.sort();
        ids.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(request) = state.requests.get_mut(&id) {
                if request.start_processing(batch_id, now).is_ok() {
                    claimed.push(request.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn save_request(&self, request: &MatchingRequest, expected: MatchingStatus) -> StoreResult<bool> {
        let mut state = self.state.write();
        match state.requests.get_mut(&request.id) {
            Some(stored) if stored.status == expected => {
                *stored = request.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::Other(format!("matching request {} does not exist", request.id))),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<MatchingRequest>> {
        let state = self.state.read();
        let mut expired: Vec<MatchingRequest> = state
            .requests
            .values()
            .filter(|r| r.status.is_open() && r.expires_at < now)
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn find_retryable(
        &self,
        max_retry_count: u32,
        failed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<MatchingRequest>> {
        let state = self.state.read();
        let mut retryable: Vec<MatchingRequest> = state
            .requests
            .values()
            .filter(|r| {
                r.status == MatchingStatus::Failed
                    && r.retry_count < max_retry_count
                    && r.expires_at > now
                    && r.processed_at.is_some_and(|at| at <= failed_before)
            })
            .cloned()
            .collect();
        retryable.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        retryable.truncate(limit as usize);
        Ok(retryable)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write();
        let before = state.requests.len();
        state.requests.retain(|_, r| {
            let terminal = matches!(r.status, MatchingStatus::Completed | MatchingStatus::Failed);
            !(terminal && r.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.requests.len()) as u64)
    }

    async fn demand_by_cell(&self, since: DateTime<Utc>) -> StoreResult<HashMap<String, u64>> {
        let state = self.state.read();
        let rides: HashSet<(&str, Uuid)> = state
            .requests
            .values()
            .filter(|r| r.requested_at >= since)
            .map(|r| (r.pickup_cell.as_str(), r.ride_id))
            .collect();

        let mut demand: HashMap<String, u64> = HashMap::new();
        for (cell, _) in rides {
            *demand.entry(cell.to_string()).or_default() += 1;
        }
        Ok(demand)
    }
}

#[async_trait]
impl SurgePriceStore for InMemoryDispatchStore {
    async fn current(&self, geo_cell: &str, now: DateTime<Utc>) -> StoreResult<Option<SurgePrice>> {
        Ok(self
            .state
            .read()
            .surge
            .iter()
            .filter(|s| s.geo_cell == geo_cell && s.is_active_at(now))
            .max_by_key(|s| s.effective_from)
            .cloned())
    }

    async fn replace_active(&self, surge: &SurgePrice, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write();
        for row in state
            .surge
            .iter_mut()
            .filter(|s| s.geo_cell == surge.geo_cell && s.effective_to.is_none())
        {
            row.effective_to = Some(now);
        }
        state.surge.push(surge.clone());
        Ok(())
    }

    async fn history(&self, geo_cell: &str, limit: u32) -> StoreResult<Vec<SurgePrice>> {
        let state = self.state.read();
        let mut rows: Vec<SurgePrice> = state
            .surge
            .iter()
            .filter(|s| s.geo_cell == geo_cell)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.effective_from.cmp(&a.effective_from));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    async fn seeded(store: &InMemoryDispatchStore, now: DateTime<Utc>) -> (Ride, MatchingRequest) {
        let ride = testing::ride(now);
        let request = MatchingRequest::for_ride(&ride, now + Duration::seconds(120), now);
        store.insert_ride(&ride, &request).await.unwrap();
        (ride, request)
    }

    #[tokio::test]
    async fn test_second_active_ride_for_passenger_conflicts() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (ride, _) = seeded(&store, now).await;

        let mut again = testing::ride(now);
        again.passenger_id = ride.passenger_id;
        let request = MatchingRequest::for_ride(&again, now, now);
        assert_matches!(store.insert_ride(&again, &request).await, Err(StoreError::Conflict(_)));
        assert_eq!(store.ride_count(), 1);
    }

    #[tokio::test]
    async fn test_transaction_commits_atomically() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (ride, _) = seeded(&store, now).await;

        let mut tx = store.begin().await.unwrap();
        let mut locked = tx.lock_ride(ride.id).await.unwrap().unwrap();
        locked.fail("test", now).unwrap();
        tx.save_ride(&mut locked).await.unwrap();
        assert_eq!(locked.version, 1);

        // not visible before commit
        assert_eq!(store.get_ride(ride.id).await.unwrap().unwrap().status, RideStatus::Requested);
        tx.commit().await.unwrap();
        let stored = store.get_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Failed);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (ride, _) = seeded(&store, now).await;

        let mut tx = store.begin().await.unwrap();
        let mut locked = tx.lock_ride(ride.id).await.unwrap().unwrap();
        locked.fail("test", now).unwrap();
        tx.save_ride(&mut locked).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.get_ride(ride.id).await.unwrap().unwrap().status, RideStatus::Requested);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ride_lock_serializes_transactions() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (ride, _) = seeded(&store, now).await;

        let mut first = store.begin().await.unwrap();
        first.lock_ride(ride.id).await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                tx.lock_ride(ride.id).await.unwrap().unwrap()
            })
        };

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.commit().await.unwrap();
        let seen = contender.await.unwrap();
        assert_eq!(seen.id, ride.id);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (mut ride, _) = seeded(&store, now).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_ride(ride.id).await.unwrap();
        ride.version = 7;
        ride.fail("stale", now).unwrap();
        tx.save_ride(&mut ride).await.unwrap();
        assert_matches!(tx.commit().await, Err(StoreError::VersionConflict { expected: 7, .. }));
    }

    #[tokio::test]
    async fn test_commit_detects_call_changed_by_sweep() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (ride, _) = seeded(&store, now).await;
        let call = testing::driver_call(ride.id, DriverId::new(), 1, now);

        let mut tx = store.begin().await.unwrap();
        tx.lock_ride(ride.id).await.unwrap();
        tx.save_calls(&[call.clone()]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_ride(ride.id).await.unwrap();
        let mut read = tx.get_call(call.id).await.unwrap().unwrap();

        let expired = store.expire_calls(call.expires_at + Duration::seconds(1)).await.unwrap();
        assert_eq!(expired.len(), 1);

        read.accept(now).unwrap();
        tx.save_calls(&[read]).await.unwrap();
        assert_matches!(tx.commit().await, Err(StoreError::Conflict(_)));
        assert_eq!(
            store.get_call(call.id).await.unwrap().unwrap().status,
            DriverCallStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_claim_pending_oldest_first() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (_, newest) = seeded(&store, now).await;
        let (_, oldest) = seeded(&store, now - Duration::seconds(30)).await;
        let (_, middle) = seeded(&store, now - Duration::seconds(10)).await;

        let batch = Uuid::new_v4();
        let claimed = store.claim_pending(2, now, batch, now).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![oldest.id, middle.id]);
        assert!(claimed.iter().all(|r| r.status == MatchingStatus::Processing && r.batch_id == Some(batch)));

        // too young for the cutoff
        let claimed = store
            .claim_pending(10, now - Duration::seconds(1), Uuid::new_v4(), now)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(
            store.get_request(newest.id).await.unwrap().unwrap().status,
            MatchingStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_conditional_request_save() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (_, mut request) = seeded(&store, now).await;

        request.fail("boom", now).unwrap();
        assert!(!store.save_request(&request, MatchingStatus::Processing).await.unwrap());
        assert!(store.save_request(&request, MatchingStatus::Pending).await.unwrap());
        assert_eq!(
            store.get_request(request.id).await.unwrap().unwrap().status,
            MatchingStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_retention_only_deletes_old_terminal_requests() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (_, mut old) = seeded(&store, now - Duration::hours(48)).await;
        let (_, open) = seeded(&store, now - Duration::hours(48)).await;

        old.fail("boom", now - Duration::hours(47)).unwrap();
        store.save_request(&old, MatchingStatus::Pending).await.unwrap();

        let deleted = store.delete_terminal_before(now - Duration::hours(24)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_request(old.id).await.unwrap().is_none());
        assert!(store.get_request(open.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_surge_replace_keeps_one_active_row() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let first = SurgePrice::new("cell-a", 1.5, 6, 4, now);
        let second = SurgePrice::new("cell-a", 2.0, 12, 4, now + Duration::minutes(1));

        store.replace_active(&first, now).await.unwrap();
        store.replace_active(&second, now + Duration::minutes(1)).await.unwrap();

        let history = store.history("cell-a", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|s| s.effective_to.is_none()).count(), 1);

        let current = store.current("cell-a", now + Duration::minutes(2)).await.unwrap().unwrap();
        assert_eq!(current.surge_multiplier, 2.0);
        let earlier = store.current("cell-a", now).await.unwrap().unwrap();
        assert_eq!(earlier.surge_multiplier, 1.5);
    }

    #[tokio::test]
    async fn test_acceptance_stats_ignore_cancelled_and_pending() {
        let store = InMemoryDispatchStore::new();
        let now = testing::t0();
        let (ride, _) = seeded(&store, now).await;
        let driver = DriverId::new();

        let mut calls = Vec::new();
        for (seq, status) in [
            DriverCallStatus::Accepted,
            DriverCallStatus::Rejected,
            DriverCallStatus::Expired,
            DriverCallStatus::Cancelled,
            DriverCallStatus::Pending,
        ]
        .into_iter()
        .enumerate()
        {
            let mut call = testing::driver_call(ride.id, driver, seq as u32 + 1, now);
            call.status = status;
            calls.push(call);
        }
        let mut tx = store.begin().await.unwrap();
        tx.lock_ride(ride.id).await.unwrap();
        tx.save_calls(&calls).await.unwrap();
        tx.commit().await.unwrap();

        let (answered, accepted) = store
            .acceptance_stats(driver, now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!((answered, accepted), (3, 1));
    }
}
