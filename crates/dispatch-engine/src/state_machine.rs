//! Ride lifecycle transition table
//!
//! The ride's own `status` column is the durable state; this module only
//! answers whether a move between two statuses is legal.

use crate::domain::RideStatus;
use crate::error::{DispatchError, Result};

/// Statuses reachable in one step from `from`
pub fn allowed_transitions(from: RideStatus) -> &'static [RideStatus] {
    use RideStatus::*;

    match from {
        Requested => &[Matched, Cancelled, Failed],
        Matched => &[DriverAssigned, Cancelled, Failed],
        DriverAssigned => &[EnRouteToPickup, Cancelled, Failed],
        EnRouteToPickup => &[ArrivedAtPickup, Cancelled, Failed],
        ArrivedAtPickup => &[OnTrip, Cancelled, Failed],
        OnTrip => &[Completed, Cancelled, Failed],
        Completed | Cancelled | Failed => &[],
    }
}

pub fn can_transition(from: RideStatus, to: RideStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Fails with `InvalidRideStateTransition` when the move is not in the table
pub fn ensure_transition(from: RideStatus, to: RideStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(DispatchError::InvalidRideStateTransition { from, to })
    }
}
