//! Surge pricing per geo-cell
//!
//! The multiplier reacts to the ratio of recent ride demand to available
//! drivers. Every update closes the cell's active row and opens a new one, so
//! the table doubles as the surge history.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use common::{round_half_up, Clock, MAX_SURGE_MULTIPLIER, MIN_SURGE_MULTIPLIER};
use config::SurgeConfig;
use tracing::{debug, info, instrument, warn};

use crate::clients::location::LocationClient;
use crate::clients::with_timeout;
use crate::domain::SurgePrice;
use crate::error::{DispatchError, Result};
use crate::metrics::EngineMetrics;
use crate::store::{MatchingRequestStore, SurgePriceStore};

/// Upper bound on drivers counted when sampling supply for one cell
const SUPPLY_SAMPLE_LIMIT: u32 = 1000;

/// Stepped multiplier for a demand/supply sample, always within [1.0, 5.0]
pub fn calculate_surge_multiplier(demand: u64, supply: u64) -> f64 {
    if supply == 0 {
        return MAX_SURGE_MULTIPLIER;
    }

    let ratio = demand as f64 / supply as f64;
    let multiplier = match ratio {
        r if r <= 1.0 => 1.0,
        r if r <= 1.5 => 1.2,
        r if r <= 2.0 => 1.5,
        r if r <= 3.0 => 2.0,
        r if r <= 4.0 => 3.0,
        _ => MAX_SURGE_MULTIPLIER,
    };
    round_half_up(multiplier, 2)
}

pub struct SurgePriceService {
    surge_store: Arc<dyn SurgePriceStore>,
    request_store: Arc<dyn MatchingRequestStore>,
    location: Arc<dyn LocationClient>,
    config: SurgeConfig,
    external_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
}

impl SurgePriceService {
    pub fn new(
        surge_store: Arc<dyn SurgePriceStore>,
        request_store: Arc<dyn MatchingRequestStore>,
        location: Arc<dyn LocationClient>,
        config: SurgeConfig,
        external_timeout: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            surge_store,
            request_store,
            location,
            config,
            external_timeout,
            clock,
            metrics,
        }
    }

    /// Multiplier in effect for the cell now; 1.0 when none was ever set
    pub async fn get_current_multiplier(&self, geo_cell: &str) -> Result<f64> {
        let now = self.clock.now();
        let current = self.surge_store.current(geo_cell, now).await?;
        Ok(current.map_or(MIN_SURGE_MULTIPLIER, |s| s.surge_multiplier))
    }

    pub async fn get_current(&self, geo_cell: &str) -> Result<Option<SurgePrice>> {
        Ok(self.surge_store.current(geo_cell, self.clock.now()).await?)
    }

    /// Set the multiplier for a cell directly
    pub async fn update_multiplier(&self, geo_cell: &str, multiplier: f64) -> Result<SurgePrice> {
        self.store_row(geo_cell, multiplier, 0, 0).await
    }

    /// Recompute the cell's multiplier from a demand/supply sample
    pub async fn apply_sample(&self, geo_cell: &str, demand: u64, supply: u64) -> Result<SurgePrice> {
        let multiplier = self.bounded(calculate_surge_multiplier(demand, supply));
        self.store_row(geo_cell, multiplier, demand, supply).await
    }

    /// Resample demand and supply for the configured cells plus every cell
    /// with recent demand. Cells whose supply lookup fails are skipped.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Vec<SurgePrice>> {
        let now = self.clock.now();
        let window = chrono::Duration::minutes(self.config.demand_window_minutes as i64);
        let demand = self.request_store.demand_by_cell(now - window).await?;

        let cells: BTreeSet<String> = self
            .config
            .cells
            .iter()
            .cloned()
            .chain(demand.keys().cloned())
            .collect();

        let updated = self.resample(cells, &demand).await;
        info!(cells = updated.len(), "Surge refresh finished");
        Ok(updated)
    }

    /// Resample only the given cells
    pub async fn refresh_cells(&self, cells: &[String]) -> Result<Vec<SurgePrice>> {
        let now = self.clock.now();
        let window = chrono::Duration::minutes(self.config.demand_window_minutes as i64);
        let demand = self.request_store.demand_by_cell(now - window).await?;

        let cells: BTreeSet<String> = cells.iter().cloned().collect();
        Ok(self.resample(cells, &demand).await)
    }

    async fn resample(&self, cells: BTreeSet<String>, demand: &HashMap<String, u64>) -> Vec<SurgePrice> {
        let mut updated = Vec::with_capacity(cells.len());
        for cell in cells {
            let cell_demand = demand.get(&cell).copied().unwrap_or(0);
            let Some(supply) = self.sample_supply(&cell).await else {
                continue;
            };
            match self.apply_sample(&cell, cell_demand, supply).await {
                Ok(row) => updated.push(row),
                Err(e) => warn!(geo_cell = %cell, error = %e, "Surge update failed"),
            }
        }
        updated
    }

    /// Newest first
    pub async fn history(&self, geo_cell: &str, limit: u32) -> Result<Vec<SurgePrice>> {
        Ok(self.surge_store.history(geo_cell, limit).await?)
    }

    async fn sample_supply(&self, cell: &str) -> Option<u64> {
        let cells = [cell.to_string()];
        let lookup = self
            .location
            .find_nearby_available_drivers(&cells, SUPPLY_SAMPLE_LIMIT);
        match with_timeout(self.external_timeout, lookup).await {
            Ok(drivers) => Some(drivers.len() as u64),
            Err(e) => {
                warn!(geo_cell = %cell, error = %e, "Supply lookup failed, skipping cell");
                None
            }
        }
    }

    fn bounded(&self, multiplier: f64) -> f64 {
        multiplier.clamp(self.config.min_multiplier, self.config.max_multiplier)
    }

    async fn store_row(&self, geo_cell: &str, multiplier: f64, demand: u64, supply: u64) -> Result<SurgePrice> {
        if geo_cell.trim().is_empty() {
            return Err(DispatchError::Validation("geo-cell must not be blank".to_string()));
        }
        if !(MIN_SURGE_MULTIPLIER..=MAX_SURGE_MULTIPLIER).contains(&multiplier) {
            return Err(DispatchError::Validation(format!(
                "surge multiplier must be within [{}, {}], got {}",
                MIN_SURGE_MULTIPLIER, MAX_SURGE_MULTIPLIER, multiplier
            )));
        }

        let now = self.clock.now();
        let row = SurgePrice::new(geo_cell, multiplier, demand, supply, now);
        self.surge_store.replace_active(&row, now).await?;
        self.metrics.surge_updates.increment();

        debug!(geo_cell, multiplier, demand, supply, "Surge multiplier updated");
        Ok(row)
    }
}
