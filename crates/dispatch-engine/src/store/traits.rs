//! Repository traits for the dispatch aggregates
//!
//! Each aggregate gets its own trait so services only see what they use.
//! Multi-step mutations on one ride go through a [`RideTransaction`], which
//! serializes writers on the ride and commits its writes all at once.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DriverId, PassengerId};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{DriverCall, MatchingRequest, MatchingStatus, Ride, SurgePrice};
use crate::error::DispatchError;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness rule or a concurrent status change was violated
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("version conflict on ride {ride_id}: expected version {expected}")]
    VersionConflict { ride_id: Uuid, expected: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) | StoreError::VersionConflict { .. } => {
                DispatchError::ConcurrentModification(err.to_string())
            }
            other => DispatchError::Storage(other.to_string()),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Unit of work scoped to one ride.
///
/// `lock_ride` blocks other transactions on the same ride until this one
/// commits or rolls back. Writes are not visible to others before `commit`.
#[async_trait]
pub trait RideTransaction: Send {
    /// Lock the ride and load it; `None` if it does not exist
    async fn lock_ride(&mut self, ride_id: Uuid) -> StoreResult<Option<Ride>>;

    /// Stage the ride for writing. Fails at commit if the stored version moved;
    /// bumps `ride.version` on success.
    async fn save_ride(&mut self, ride: &mut Ride) -> StoreResult<()>;

    async fn get_call(&mut self, call_id: Uuid) -> StoreResult<Option<DriverCall>>;

    /// All calls of the ride in offer order
    async fn calls_for_ride(&mut self, ride_id: Uuid) -> StoreResult<Vec<DriverCall>>;

    /// Insert new calls or update existing ones
    async fn save_calls(&mut self, calls: &[DriverCall]) -> StoreResult<()>;

    async fn latest_request_for_ride(&mut self, ride_id: Uuid) -> StoreResult<Option<MatchingRequest>>;

    /// Insert or update a matching request
    async fn save_request(&mut self, request: &MatchingRequest) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait RideStore: Send + Sync {
    /// Persist a new ride together with its first matching request.
    ///
    /// Fails with `Conflict` if the passenger already has a non-terminal ride.
    async fn insert_ride(&self, ride: &Ride, request: &MatchingRequest) -> StoreResult<()>;

    async fn get_ride(&self, ride_id: Uuid) -> StoreResult<Option<Ride>>;

    async fn active_ride_for_passenger(&self, passenger_id: PassengerId) -> StoreResult<Option<Ride>>;

    /// Ids of rides still REQUESTED that were requested before `cutoff`, oldest first
    async fn rides_requested_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Uuid>>;

    async fn begin(&self) -> StoreResult<Box<dyn RideTransaction>>;
}

#[async_trait]
pub trait DriverCallStore: Send + Sync {
    async fn get_call(&self, call_id: Uuid) -> StoreResult<Option<DriverCall>>;

    async fn calls_for_ride(&self, ride_id: Uuid) -> StoreResult<Vec<DriverCall>>;

    async fn pending_calls_for_driver(&self, driver_id: DriverId) -> StoreResult<Vec<DriverCall>>;

    /// Subset of `drivers` currently holding a PENDING call
    async fn drivers_with_pending_calls(&self, drivers: &[DriverId]) -> StoreResult<HashSet<DriverId>>;

    /// Move every PENDING call with `expires_at < now` to EXPIRED and return them
    async fn expire_calls(&self, now: DateTime<Utc>) -> StoreResult<Vec<DriverCall>>;

    /// `(answered, accepted)` offers to the driver since `since`.
    /// Answered counts ACCEPTED, REJECTED and EXPIRED calls.
    async fn acceptance_stats(&self, driver_id: DriverId, since: DateTime<Utc>) -> StoreResult<(u64, u64)>;
}

#[async_trait]
pub trait MatchingRequestStore: Send + Sync {
    async fn get_request(&self, request_id: Uuid) -> StoreResult<Option<MatchingRequest>>;

    async fn latest_request_for_ride(&self, ride_id: Uuid) -> StoreResult<Option<MatchingRequest>>;

    /// Atomically move up to `limit` PENDING requests requested at or before
    /// `older_than` to PROCESSING under `batch_id`, oldest first.
    async fn claim_pending(
        &self,
        limit: u32,
        older_than: DateTime<Utc>,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchingRequest>>;

    /// Write `request` only if the stored status is still `expected`.
    /// Returns false when another writer got there first.
    async fn save_request(&self, request: &MatchingRequest, expected: MatchingStatus) -> StoreResult<bool>;

    /// PENDING or PROCESSING requests whose deadline passed
    async fn find_expired(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<MatchingRequest>>;

    /// FAILED requests with retries left, failed before `failed_before`, whose
    /// deadline is still ahead
    async fn find_retryable(
        &self,
        max_retry_count: u32,
        failed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<MatchingRequest>>;

    /// Delete COMPLETED/FAILED requests processed before `cutoff`
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Distinct rides with a request created per pickup cell since `since`
    async fn demand_by_cell(&self, since: DateTime<Utc>) -> StoreResult<HashMap<String, u64>>;
}

#[async_trait]
pub trait SurgePriceStore: Send + Sync {
    /// The row active at `now`, if any
    async fn current(&self, geo_cell: &str, now: DateTime<Utc>) -> StoreResult<Option<SurgePrice>>;

    /// Close the active row for the cell at `now` and insert `surge` as the new active row
    async fn replace_active(&self, surge: &SurgePrice, now: DateTime<Utc>) -> StoreResult<()>;

    /// Newest first
    async fn history(&self, geo_cell: &str, limit: u32) -> StoreResult<Vec<SurgePrice>>;
}
