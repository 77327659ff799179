//! Dispatch error types

use thiserror::Error;
use uuid::Uuid;

use crate::domain::RideStatus;

/// Errors surfaced by the dispatch services
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Ride not found: {0}")]
    RideNotFound(Uuid),

    #[error("Driver call not found: {0}")]
    DriverCallNotFound(Uuid),

    #[error("No matching request for ride: {0}")]
    MatchingRequestNotFound(Uuid),

    /// The ride is not in a status that allows the operation
    #[error("Ride {ride_id} is {status}: {message}")]
    InvalidRideState {
        ride_id: Uuid,
        status: RideStatus,
        message: String,
    },

    #[error("Invalid ride state transition: {from} -> {to}")]
    InvalidRideStateTransition { from: RideStatus, to: RideStatus },

    #[error("Driver call {call_id} is {status}, expected PENDING")]
    InvalidDriverCallState { call_id: Uuid, status: String },

    #[error("Matching request {request_id} is {status}: {message}")]
    InvalidMatchingRequestState {
        request_id: Uuid,
        status: String,
        message: String,
    },

    #[error("Ride {0} already has a driver")]
    RideAlreadyMatched(Uuid),

    #[error("Passenger {0} already has an active ride")]
    DuplicateRideRequest(String),

    /// Optimistic version check failed; the caller may reload and retry
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("No available drivers near {0}")]
    NoAvailableDrivers(String),

    #[error("Matching timed out for ride {0}")]
    MatchingTimeout(Uuid),

    #[error("Driver call {0} has expired")]
    DriverCallExpired(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to publish to {topic} (key {key}): {message}")]
    EventPublish {
        topic: String,
        key: String,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a caller (usually the API layer) should present an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    /// State conflict: already matched, invalid transition, ...
    Conflict,
    /// Temporarily unavailable; the same request may succeed later
    RetryLater,
    /// The offer can no longer be acted on
    OfferUnavailable,
    Invalid,
    Infrastructure,
}

impl DispatchError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::RideNotFound(_) => "RIDE_NOT_FOUND",
            DispatchError::DriverCallNotFound(_) => "DRIVER_CALL_NOT_FOUND",
            DispatchError::MatchingRequestNotFound(_) => "MATCHING_REQUEST_NOT_FOUND",
            DispatchError::InvalidRideState { .. } => "INVALID_RIDE_STATE",
            DispatchError::InvalidRideStateTransition { .. } => "INVALID_RIDE_STATE_TRANSITION",
            DispatchError::InvalidDriverCallState { .. } => "INVALID_DRIVER_CALL_STATE",
            DispatchError::InvalidMatchingRequestState { .. } => "INVALID_MATCHING_REQUEST_STATE",
            DispatchError::RideAlreadyMatched(_) => "RIDE_ALREADY_MATCHED",
            DispatchError::DuplicateRideRequest(_) => "DUPLICATE_RIDE_REQUEST",
            DispatchError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            DispatchError::NoAvailableDrivers(_) => "NO_AVAILABLE_DRIVERS",
            DispatchError::MatchingTimeout(_) => "MATCHING_TIMEOUT",
            DispatchError::DriverCallExpired(_) => "DRIVER_CALL_EXPIRED",
            DispatchError::Validation(_) => "VALIDATION",
            DispatchError::EventPublish { .. } => "EVENT_PUBLISH_FAILED",
            DispatchError::Storage(_) => "STORAGE",
            DispatchError::Lock(_) => "LOCK",
            DispatchError::ExternalService(_) => "EXTERNAL_SERVICE",
            DispatchError::Internal(_) => "INTERNAL",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::RideNotFound(_)
            | DispatchError::DriverCallNotFound(_)
            | DispatchError::MatchingRequestNotFound(_) => ErrorCategory::NotFound,

            DispatchError::InvalidRideState { .. }
            | DispatchError::InvalidRideStateTransition { .. }
            | DispatchError::InvalidDriverCallState { .. }
            | DispatchError::InvalidMatchingRequestState { .. }
            | DispatchError::RideAlreadyMatched(_)
            | DispatchError::DuplicateRideRequest(_)
            | DispatchError::ConcurrentModification(_) => ErrorCategory::Conflict,

            DispatchError::NoAvailableDrivers(_) | DispatchError::MatchingTimeout(_) => {
                ErrorCategory::RetryLater
            }

            DispatchError::DriverCallExpired(_) => ErrorCategory::OfferUnavailable,

            DispatchError::Validation(_) => ErrorCategory::Invalid,

            DispatchError::EventPublish { .. }
            | DispatchError::Storage(_)
            | DispatchError::Lock(_)
            | DispatchError::ExternalService(_)
            | DispatchError::Internal(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Message safe to show to a passenger or driver
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::NotFound | ErrorCategory::Invalid => self.to_string(),
            ErrorCategory::Conflict => format!("Request conflicts with the current ride state: {}", self),
            ErrorCategory::RetryLater => "Service temporarily unavailable, please retry".to_string(),
            ErrorCategory::OfferUnavailable => "Offer no longer available".to_string(),
            ErrorCategory::Infrastructure => "Internal error, please try again later".to_string(),
        }
    }
}

impl From<common::Error> for DispatchError {
    fn from(err: common::Error) -> Self {
        DispatchError::Validation(err.detail().to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Internal(format!("serialization: {}", err))
    }
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let id = Uuid::new_v4();
        assert_eq!(DispatchError::RideNotFound(id).category(), ErrorCategory::NotFound);
        assert_eq!(DispatchError::RideAlreadyMatched(id).category(), ErrorCategory::Conflict);
        assert_eq!(
            DispatchError::InvalidRideStateTransition {
                from: RideStatus::Completed,
                to: RideStatus::OnTrip
            }
            .category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            DispatchError::NoAvailableDrivers("cell".into()).category(),
            ErrorCategory::RetryLater
        );
        assert_eq!(DispatchError::DriverCallExpired(id).category(), ErrorCategory::OfferUnavailable);
        assert_eq!(DispatchError::Storage("down".into()).category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_user_messages() {
        let id = Uuid::new_v4();
        assert_eq!(
            DispatchError::MatchingTimeout(id).user_message(),
            "Service temporarily unavailable, please retry"
        );
        assert_eq!(DispatchError::DriverCallExpired(id).user_message(), "Offer no longer available");
        assert_eq!(DispatchError::DriverCallExpired(id).code(), "DRIVER_CALL_EXPIRED");
    }

    #[test]
    fn test_from_common_error() {
        let err: DispatchError = common::Error::InvalidCoordinate("bad latitude".to_string()).into();
        assert!(matches!(err, DispatchError::Validation(ref m) if m == "bad latitude"));
    }
}
