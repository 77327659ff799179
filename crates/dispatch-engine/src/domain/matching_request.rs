//! Matching request bookkeeping
//!
//! PENDING -> PROCESSING -> {COMPLETED, FAILED}; FAILED -> PENDING on retry.
//! `batch_id` is only set while PROCESSING.

use chrono::{DateTime, Utc};
use common::PassengerId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Ride;
use crate::error::{DispatchError, Result};

/// Recorded on requests that found no eligible driver
pub const NO_DRIVER_REASON: &str = "no available drivers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MatchingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchingStatus::Pending => "PENDING",
            MatchingStatus::Processing => "PROCESSING",
            MatchingStatus::Completed => "COMPLETED",
            MatchingStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(MatchingStatus::Pending),
            "PROCESSING" => Some(MatchingStatus::Processing),
            "COMPLETED" => Some(MatchingStatus::Completed),
            "FAILED" => Some(MatchingStatus::Failed),
            _ => None,
        }
    }

    /// Still waiting for, or inside, a batch run
    pub fn is_open(&self) -> bool {
        matches!(self, MatchingStatus::Pending | MatchingStatus::Processing)
    }
}

impl std::fmt::Display for MatchingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingRequest {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub passenger_id: PassengerId,
    pub pickup_cell: String,
    pub dropoff_cell: String,
    pub surge_multiplier: f64,
    /// Absolute deadline for matching the ride
    pub expires_at: DateTime<Utc>,
    pub status: MatchingStatus,
    pub requested_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<Uuid>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub last_no_driver_at: Option<DateTime<Utc>>,
}

impl MatchingRequest {
    pub fn for_ride(ride: &Ride, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            pickup_cell: ride.pickup.geo_cell().to_string(),
            dropoff_cell: ride.dropoff.geo_cell().to_string(),
            surge_multiplier: ride.fare.surge_multiplier(),
            expires_at,
            status: MatchingStatus::Pending,
            requested_at: now,
            processing_started_at: None,
            processed_at: None,
            batch_id: None,
            retry_count: 0,
            error_message: None,
            last_no_driver_at: None,
        }
    }

    /// Fresh PENDING request for the same ride, one retry further along
    pub fn redispatch(previous: &MatchingRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: MatchingStatus::Pending,
            requested_at: now,
            processing_started_at: None,
            processed_at: None,
            batch_id: None,
            retry_count: previous.retry_count + 1,
            error_message: None,
            last_no_driver_at: previous.last_no_driver_at,
            ..previous.clone()
        }
    }

    fn invalid_state(&self, message: &str) -> DispatchError {
        DispatchError::InvalidMatchingRequestState {
            request_id: self.id,
            status: self.status.to_string(),
            message: message.to_string(),
        }
    }

    pub fn start_processing(&mut self, batch_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if self.status != MatchingStatus::Pending {
            return Err(self.invalid_state("only PENDING requests can be processed"));
        }
        self.status = MatchingStatus::Processing;
        self.batch_id = Some(batch_id);
        self.processing_started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != MatchingStatus::Processing {
            return Err(self.invalid_state("only PROCESSING requests can complete"));
        }
        self.status = MatchingStatus::Completed;
        self.batch_id = None;
        self.processed_at = Some(now);
        self.error_message = None;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_open() {
            return Err(self.invalid_state("only PENDING or PROCESSING requests can fail"));
        }
        self.status = MatchingStatus::Failed;
        self.batch_id = None;
        self.processed_at = Some(now);
        self.error_message = Some(reason.into());
        Ok(())
    }

    pub fn record_no_driver(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.fail(NO_DRIVER_REASON, now)?;
        self.last_no_driver_at = Some(now);
        Ok(())
    }

    /// Fail the request for good because its ride can no longer be matched.
    ///
    /// The deadline is pulled in to `now` so no sweep or retry picks it up again.
    pub fn close(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.status != MatchingStatus::Completed {
            self.status = MatchingStatus::Failed;
            self.batch_id = None;
            self.processed_at = Some(now);
            self.error_message = Some(reason.into());
        }
        if self.expires_at > now {
            self.expires_at = now;
        }
    }

    pub fn can_retry(&self, max_retry_count: u32) -> bool {
        self.status == MatchingStatus::Failed && self.retry_count < max_retry_count
    }

    /// FAILED -> PENDING, clearing processing fields and counting the attempt
    pub fn reset_for_retry(&mut self, max_retry_count: u32) -> Result<()> {
        if self.status != MatchingStatus::Failed {
            return Err(self.invalid_state("only FAILED requests can be retried"));
        }
        if self.retry_count >= max_retry_count {
            return Err(self.invalid_state("max retry count exceeded"));
        }
        self.status = MatchingStatus::Pending;
        self.retry_count += 1;
        self.processing_started_at = None;
        self.processed_at = None;
        self.batch_id = None;
        self.error_message = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn request() -> MatchingRequest {
        let now = testing::t0();
        let ride = testing::ride(now);
        MatchingRequest::for_ride(&ride, now + Duration::seconds(120), now)
    }

    #[test]
    fn test_batch_id_only_while_processing() {
        let now = testing::t0();
        let mut req = request();
        let batch = Uuid::new_v4();

        req.start_processing(batch, now).unwrap();
        assert_eq!(req.batch_id, Some(batch));
        assert_matches!(
            req.start_processing(Uuid::new_v4(), now),
            Err(DispatchError::InvalidMatchingRequestState { .. })
        );

        req.complete(now).unwrap();
        assert_eq!(req.status, MatchingStatus::Completed);
        assert_eq!(req.batch_id, None);
    }

    #[test]
    fn test_no_driver_stamps_time() {
        let now = testing::t0();
        let mut req = request();
        req.start_processing(Uuid::new_v4(), now).unwrap();
        req.record_no_driver(now).unwrap();

        assert_eq!(req.status, MatchingStatus::Failed);
        assert_eq!(req.last_no_driver_at, Some(now));
        assert_eq!(req.error_message.as_deref(), Some(NO_DRIVER_REASON));
    }

    #[test]
    fn test_retry_bound() {
        let now = testing::t0();
        let mut req = request();
        req.fail("boom", now).unwrap();
        req.retry_count = 2;

        req.reset_for_retry(3).unwrap();
        assert_eq!(req.status, MatchingStatus::Pending);
        assert_eq!(req.retry_count, 3);
        assert!(req.error_message.is_none());

        req.fail("boom", now).unwrap();
        let before = req.clone();
        assert_matches!(
            req.reset_for_retry(3),
            Err(DispatchError::InvalidMatchingRequestState { ref message, .. }) if message == "max retry count exceeded"
        );
        assert_eq!(req, before);
    }

    #[test]
    fn test_close_pulls_deadline_in() {
        let now = testing::t0();
        let mut req = request();
        req.close("ride cancelled", now);

        assert_eq!(req.status, MatchingStatus::Failed);
        assert_eq!(req.expires_at, now);
    }

    #[test]
    fn test_redispatch_keeps_deadline() {
        let now = testing::t0();
        let mut req = request();
        req.start_processing(Uuid::new_v4(), now).unwrap();
        req.complete(now).unwrap();

        let next = MatchingRequest::redispatch(&req, now + Duration::seconds(30));
        assert_ne!(next.id, req.id);
        assert_eq!(next.status, MatchingStatus::Pending);
        assert_eq!(next.retry_count, 1);
        assert_eq!(next.expires_at, req.expires_at);
    }
}
