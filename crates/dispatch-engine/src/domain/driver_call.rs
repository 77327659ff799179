//! Time-bounded ride offer to one driver

use chrono::{DateTime, Utc};
use common::{DriverId, Location};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverCallStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
}

impl DriverCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverCallStatus::Pending => "PENDING",
            DriverCallStatus::Accepted => "ACCEPTED",
            DriverCallStatus::Rejected => "REJECTED",
            DriverCallStatus::Expired => "EXPIRED",
            DriverCallStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(DriverCallStatus::Pending),
            "ACCEPTED" => Some(DriverCallStatus::Accepted),
            "REJECTED" => Some(DriverCallStatus::Rejected),
            "EXPIRED" => Some(DriverCallStatus::Expired),
            "CANCELLED" => Some(DriverCallStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DriverCallStatus::Pending)
    }
}

impl std::fmt::Display for DriverCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverCall {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub driver_id: DriverId,
    /// 1-based rank within the offer batch
    pub sequence_number: u32,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub estimated_arrival_seconds: Option<u32>,
    pub estimated_fare: Option<f64>,
    pub distance_to_pickup_meters: Option<f64>,
    /// Where the driver was when the offer was made
    pub driver_location: Location,
    pub status: DriverCallStatus,
    pub responded_at: Option<DateTime<Utc>>,
}

impl DriverCall {
    /// New PENDING offer valid until `expires_at`
    pub fn offer(
        ride_id: Uuid,
        driver_id: DriverId,
        sequence_number: u32,
        driver_location: Location,
        offered_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ride_id,
            driver_id,
            sequence_number,
            offered_at,
            expires_at,
            estimated_arrival_seconds: None,
            estimated_fare: None,
            distance_to_pickup_meters: None,
            driver_location,
            status: DriverCallStatus::Pending,
            responded_at: None,
        }
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.status != DriverCallStatus::Pending {
            return Err(DispatchError::InvalidDriverCallState {
                call_id: self.id,
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    /// The offer is usable strictly before `expires_at`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// PENDING -> ACCEPTED. Checks the deadline inline so a call past its
    /// TTL cannot be accepted even if the expiry sweep has not run.
    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired_at(now) {
            return Err(DispatchError::DriverCallExpired(self.id));
        }
        self.ensure_pending()?;
        self.status = DriverCallStatus::Accepted;
        self.responded_at = Some(now);
        Ok(())
    }

    pub fn reject(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = DriverCallStatus::Rejected;
        self.responded_at = Some(now);
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = DriverCallStatus::Expired;
        self.responded_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = DriverCallStatus::Cancelled;
        self.responded_at = Some(now);
        Ok(())
    }
}
