//! Driver directory / location lookup

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use common::{DriverId, Location, VehicleType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::ClientResult;

/// An available driver as reported by the location service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub location: Location,
    /// 0.0 to 5.0
    pub rating: f64,
    /// Directory-reported acceptance rate, 0.0 to 1.0
    pub acceptance_rate: f64,
    pub vehicle_type: VehicleType,
}

/// Location capability - protocol agnostic
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocationClient: Send + Sync {
    /// Currently available drivers located in any of `cells`
    async fn find_nearby_available_drivers(
        &self,
        cells: &[String],
        limit: u32,
    ) -> ClientResult<Vec<NearbyDriver>>;
}

// ==================== Static Implementation ====================

/// In-process driver directory used when no location service is configured
#[derive(Default)]
pub struct StaticLocationClient {
    drivers: RwLock<HashMap<DriverId, NearbyDriver>>,
}

impl StaticLocationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drivers(drivers: impl IntoIterator<Item = NearbyDriver>) -> Self {
        let client = Self::new();
        for driver in drivers {
            client.upsert(driver);
        }
        client
    }

    /// Add or move a driver
    pub fn upsert(&self, driver: NearbyDriver) {
        self.drivers.write().insert(driver.driver_id, driver);
    }
}

#[async_trait]
impl LocationClient for StaticLocationClient {
    async fn find_nearby_available_drivers(
        &self,
        cells: &[String],
        limit: u32,
    ) -> ClientResult<Vec<NearbyDriver>> {
        let wanted: HashSet<&str> = cells.iter().map(String::as_str).collect();
        let mut found: Vec<NearbyDriver> = self
            .drivers
            .read()
            .values()
            .filter(|d| wanted.contains(d.location.geo_cell()))
            .cloned()
            .collect();

        found.sort_by_key(|d| d.driver_id);
        found.truncate(limit as usize);

        tracing::debug!(cells = cells.len(), found = found.len(), "Static location lookup");
        Ok(found)
    }
}

// ==================== HTTP Implementation ====================

#[cfg(feature = "client")]
pub mod http {
    use async_trait::async_trait;
    use reqwest::Client;
    use serde::Serialize;
    use std::time::Duration;

    use super::{LocationClient, NearbyDriver};
    use crate::clients::{ClientError, ClientResult};

    #[derive(Serialize)]
    struct NearbyQuery<'a> {
        cells: &'a [String],
        limit: u32,
    }

    /// HTTP-based location client
    pub struct HttpLocationClient {
        client: Client,
        base_url: String,
    }

    impl HttpLocationClient {
        pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ClientError::Unavailable(e.to_string()))?;

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
            })
        }
    }

    #[async_trait]
    impl LocationClient for HttpLocationClient {
        async fn find_nearby_available_drivers(
            &self,
            cells: &[String],
            limit: u32,
        ) -> ClientResult<Vec<NearbyDriver>> {
            let url = format!("{}/api/v1/drivers/nearby", self.base_url);

            let response = self
                .client
                .post(&url)
                .json(&NearbyQuery { cells, limit })
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        ClientError::Unavailable(format!("timeout calling {}", url))
                    } else {
                        ClientError::Unavailable(e.to_string())
                    }
                })?;

            if !response.status().is_success() {
                return Err(ClientError::Unavailable(format!(
                    "location service returned {}",
                    response.status()
                )));
            }

            response
                .json::<Vec<NearbyDriver>>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))
        }
    }
}
