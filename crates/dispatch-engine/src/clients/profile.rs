//! Passenger / driver profile lookup (read-only, display context)

use std::collections::HashMap;

use async_trait::async_trait;
use common::{DriverId, PassengerId, VehicleType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::ClientResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassengerInfo {
    pub passenger_id: PassengerId,
    pub name: String,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub driver_id: DriverId,
    pub name: String,
    pub rating: Option<f64>,
    pub vehicle_type: VehicleType,
    pub license_plate: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileClient: Send + Sync {
    async fn get_passenger_info(&self, id: PassengerId) -> ClientResult<Option<PassengerInfo>>;

    async fn get_driver_info(&self, id: DriverId) -> ClientResult<Option<DriverInfo>>;
}

// ==================== Static Implementation ====================

#[derive(Default)]
pub struct StaticProfileClient {
    passengers: RwLock<HashMap<PassengerId, PassengerInfo>>,
    drivers: RwLock<HashMap<DriverId, DriverInfo>>,
}

impl StaticProfileClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_passenger(&self, info: PassengerInfo) {
        self.passengers.write().insert(info.passenger_id, info);
    }

    pub fn add_driver(&self, info: DriverInfo) {
        self.drivers.write().insert(info.driver_id, info);
    }
}

#[async_trait]
impl ProfileClient for StaticProfileClient {
    async fn get_passenger_info(&self, id: PassengerId) -> ClientResult<Option<PassengerInfo>> {
        Ok(self.passengers.read().get(&id).cloned())
    }

    async fn get_driver_info(&self, id: DriverId) -> ClientResult<Option<DriverInfo>> {
        Ok(self.drivers.read().get(&id).cloned())
    }
}

// ==================== HTTP Implementation ====================

#[cfg(feature = "client")]
pub mod http {
    use async_trait::async_trait;
    use common::{DriverId, PassengerId};
    use reqwest::{Client, StatusCode};
    use serde::de::DeserializeOwned;
    use std::time::Duration;

    use super::{DriverInfo, PassengerInfo, ProfileClient};
    use crate::clients::{ClientError, ClientResult};

    pub struct HttpProfileClient {
        client: Client,
        base_url: String,
    }

    impl HttpProfileClient {
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

        async fn fetch<T: DeserializeOwned>(&self, path: String) -> ClientResult<Option<T>> {
            let url = format!("{}{}", self.base_url, path);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ClientError::Unavailable(e.to_string()))?;

            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => response
                    .json::<T>()
                    .await
                    .map(Some)
                    .map_err(|e| ClientError::Decode(e.to_string())),
                status => Err(ClientError::Unavailable(format!(
                    "profile service returned {}",
                    status
                ))),
            }
        }
    }

    #[async_trait]
    impl ProfileClient for HttpProfileClient {
        async fn get_passenger_info(&self, id: PassengerId) -> ClientResult<Option<PassengerInfo>> {
            self.fetch(format!("/api/v1/passengers/{}", id)).await
        }

        async fn get_driver_info(&self, id: DriverId) -> ClientResult<Option<DriverInfo>> {
            self.fetch(format!("/api/v1/drivers/{}", id)).await
        }
    }
}
