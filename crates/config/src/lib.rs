use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod defaults;
pub mod parser;
pub mod substitution;
pub mod validator;

pub use defaults::*;
pub use parser::*;
pub use substitution::*;
pub use validator::*;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Identity of this process in the cluster; generated at startup when absent
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            instance_id: None,
        }
    }
}

/// Relative importance of each ranking component
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringWeights {
    #[serde(default = "default_distance_weight")]
    pub distance: f64,
    #[serde(default = "default_rating_weight")]
    pub rating: f64,
    #[serde(default = "default_acceptance_weight")]
    pub acceptance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            distance: default_distance_weight(),
            rating: default_rating_weight(),
            acceptance: default_acceptance_weight(),
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.distance + self.rating + self.acceptance
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatchingConfig {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Requests younger than this are left for the next run
    #[serde(default = "default_min_request_age_ms")]
    pub min_request_age_ms: u64,
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    #[serde(default = "default_max_calls_per_request")]
    pub max_calls_per_request: u32,
    /// Neighborhood ring (in grid steps) searched around the pickup cell
    #[serde(default = "default_search_ring")]
    pub search_ring: u32,
    #[serde(default = "default_max_search_radius_meters")]
    pub max_search_radius_meters: f64,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: u32,
    #[serde(default = "default_request_ttl_seconds")]
    pub request_ttl_seconds: u64,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: u64,
    #[serde(default = "default_timeout_sweep_interval_seconds")]
    pub timeout_sweep_interval_seconds: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_external_call_timeout_ms")]
    pub external_call_timeout_ms: u64,
    #[serde(default)]
    pub weights: ScoringWeights,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            batch_size: default_batch_size(),
            min_request_age_ms: default_min_request_age_ms(),
            lock_key: default_lock_key(),
            lock_lease_ms: default_lock_lease_ms(),
            max_calls_per_request: default_max_calls_per_request(),
            search_ring: default_search_ring(),
            max_search_radius_meters: default_max_search_radius_meters(),
            candidate_limit: default_candidate_limit(),
            request_ttl_seconds: default_request_ttl_seconds(),
            max_retry_count: default_max_retry_count(),
            retry_backoff_seconds: default_retry_backoff_seconds(),
            timeout_sweep_interval_seconds: default_timeout_sweep_interval_seconds(),
            retention_hours: default_retention_hours(),
            external_call_timeout_ms: default_external_call_timeout_ms(),
            weights: ScoringWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverCallConfig {
    #[serde(default = "default_offer_ttl_seconds")]
    pub offer_ttl_seconds: u64,
    #[serde(default = "default_expiry_sweep_interval_seconds")]
    pub expiry_sweep_interval_seconds: u64,
    /// Trailing window for acceptance-rate statistics
    #[serde(default = "default_acceptance_window_hours")]
    pub acceptance_window_hours: u64,
    /// Below this many offers the directory-reported rate is used instead
    #[serde(default = "default_min_acceptance_samples")]
    pub min_acceptance_samples: u32,
}

impl Default for DriverCallConfig {
    fn default() -> Self {
        Self {
            offer_ttl_seconds: default_offer_ttl_seconds(),
            expiry_sweep_interval_seconds: default_expiry_sweep_interval_seconds(),
            acceptance_window_hours: default_acceptance_window_hours(),
            min_acceptance_samples: default_min_acceptance_samples(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SurgeConfig {
    #[serde(default = "default_surge_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_demand_window_minutes")]
    pub demand_window_minutes: u64,
    #[serde(default = "default_min_multiplier")]
    pub min_multiplier: f64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
    /// Cells refreshed on every cycle in addition to cells with recent demand
    #[serde(default)]
    pub cells: Vec<String>,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_surge_refresh_interval_seconds(),
            demand_window_minutes: default_demand_window_minutes(),
            min_multiplier: default_min_multiplier(),
            max_multiplier: default_max_multiplier(),
            cells: Vec::new(),
        }
    }
}

/// Rates for one vehicle class
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VehicleRate {
    pub base_fare: f64,
    pub per_km: f64,
    pub per_minute: f64,
    #[serde(default)]
    pub minimum_fare: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FaresConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_average_speed_kmh")]
    pub average_speed_kmh: f64,
    /// Keyed by vehicle type name (standard, comfort, premium, xl)
    #[serde(default = "default_vehicle_rates")]
    pub vehicle_types: HashMap<String, VehicleRate>,
}

impl Default for FaresConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            average_speed_kmh: default_average_speed_kmh(),
            vehicle_types: default_vehicle_rates(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeadLetterConfig {
    /// Occurrences of an unrecoverable failure before quarantine
    #[serde(default = "default_poison_threshold")]
    pub poison_threshold: u32,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "default_unrecoverable_error_classes")]
    pub unrecoverable_error_classes: Vec<String>,
    /// Failure counts for a (topic, key) are forgotten after this long
    #[serde(default = "default_poison_window_seconds")]
    pub poison_window_seconds: u64,
    /// Consumer group used when reading the `<topic>-dlq` streams
    #[serde(default = "default_dlq_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_dlq_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dlq_read_batch_size")]
    pub read_batch_size: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            poison_threshold: default_poison_threshold(),
            max_redeliveries: default_max_redeliveries(),
            unrecoverable_error_classes: default_unrecoverable_error_classes(),
            poison_window_seconds: default_poison_window_seconds(),
            consumer_group: default_dlq_consumer_group(),
            poll_interval_ms: default_dlq_poll_interval_ms(),
            read_batch_size: default_dlq_read_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

impl PostgresConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db_index: u8,
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db_index)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db_index
            )
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// `memory` or `postgres`
    #[serde(rename = "type")]
    #[serde(default = "default_store_type")]
    pub store_type: String,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: default_store_type(),
            postgres: None,
            redis: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    /// `memory` or `redis`
    #[serde(default = "default_lock_backend")]
    pub backend: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_lock_backend(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// `memory`, `log` or `redis`
    #[serde(default = "default_publisher")]
    pub publisher: String,
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            publisher: default_publisher(),
            stream_max_len: default_stream_max_len(),
        }
    }
}

/// Endpoints of the external collaborators; absent means static test doubles
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientsConfig {
    #[serde(default)]
    pub location_url: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_api_port(),
        }
    }
}

impl ApiConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub driver_call: DriverCallConfig,
    #[serde(default)]
    pub surge: SurgeConfig,
    #[serde(default)]
    pub fares: FaresConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub clients: ClientsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_dispatch_config() {
        let yaml = include_str!("../../../dispatch_config/dispatch.yaml");
        let cfg: DispatchConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(cfg.service.name, "ride-dispatch");
        assert_eq!(cfg.matching.batch_interval_ms, 2000);
        assert_eq!(cfg.matching.max_calls_per_request, 5);
        assert_eq!(cfg.matching.weights.distance, 0.7);
        assert_eq!(cfg.driver_call.offer_ttl_seconds, 20);
        assert_eq!(cfg.dead_letter.poison_threshold, 5);
        assert!(cfg.fares.vehicle_types.contains_key("standard"));
        assert_eq!(cfg.store.store_type, "memory");
        assert!(cfg.api.enabled);

        let report = validate_config(&cfg);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg: DispatchConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(cfg.matching.batch_size, 50);
        assert_eq!(cfg.matching.lock_key, "matching-batch-run");
        assert_eq!(cfg.matching.max_retry_count, 3);
        assert_eq!(cfg.surge.max_multiplier, 5.0);
        assert_eq!(cfg.events.publisher, "memory");
        assert!((cfg.matching.weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let yaml = r#"
matching:
  batch_size: 10
  weights:
    distance: 0.6
    rating: 0.3
"#;
        let cfg: DispatchConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.matching.batch_size, 10);
        assert_eq!(cfg.matching.batch_interval_ms, 2000);
        assert_eq!(cfg.matching.weights.acceptance, 0.1);
    }

    #[test]
    fn test_redis_connection_url() {
        let redis = RedisConfig {
            host: "localhost".into(),
            port: 6379,
            password: String::new(),
            db_index: 2,
        };
        assert_eq!(redis.connection_url(), "redis://localhost:6379/2");

        let secured = RedisConfig {
            password: "s3cret".into(),
            ..redis
        };
        assert_eq!(secured.connection_url(), "redis://:s3cret@localhost:6379/2");
    }
}
