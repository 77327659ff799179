//! Dispatch domain entities

pub mod driver_call;
pub mod matching_request;
pub mod ride;
pub mod surge;

pub use driver_call::{DriverCall, DriverCallStatus};
pub use matching_request::{MatchingRequest, MatchingStatus, NO_DRIVER_REASON};
pub use ride::{CancelledBy, NewRide, Ride, RideStateTransition, RideStatus, RideTrigger};
pub use surge::SurgePrice;
