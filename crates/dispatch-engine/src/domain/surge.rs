//! Surge price windows per geo-cell

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One versioned surge multiplier for a geo-cell.
///
/// At most one row per cell has `effective_to == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurgePrice {
    pub id: Uuid,
    pub geo_cell: String,
    pub surge_multiplier: f64,
    pub demand_count: u64,
    pub supply_count: u64,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl SurgePrice {
    pub fn new(
        geo_cell: impl Into<String>,
        surge_multiplier: f64,
        demand_count: u64,
        supply_count: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            geo_cell: geo_cell.into(),
            surge_multiplier,
            demand_count,
            supply_count,
            effective_from: now,
            effective_to: None,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_from <= now && self.effective_to.map_or(true, |to| now < to)
    }
}
