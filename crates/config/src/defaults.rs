use std::collections::HashMap;

use super::VehicleRate;

pub fn default_service_name() -> String {
    "ride-dispatch".to_string()
}

pub fn default_batch_interval_ms() -> u64 {
    2000
}

pub fn default_batch_size() -> u32 {
    50
}

pub fn default_min_request_age_ms() -> u64 {
    500
}

pub fn default_lock_key() -> String {
    "matching-batch-run".to_string()
}

pub fn default_lock_lease_ms() -> u64 {
    1500
}

pub fn default_max_calls_per_request() -> u32 {
    5
}

pub fn default_search_ring() -> u32 {
    1
}

pub fn default_max_search_radius_meters() -> f64 {
    5000.0
}

pub fn default_candidate_limit() -> u32 {
    20
}

pub fn default_request_ttl_seconds() -> u64 {
    120
}

pub fn default_max_retry_count() -> u32 {
    3
}

pub fn default_retry_backoff_seconds() -> u64 {
    15
}

pub fn default_timeout_sweep_interval_seconds() -> u64 {
    10
}

pub fn default_retention_hours() -> u64 {
    24
}

pub fn default_external_call_timeout_ms() -> u64 {
    800
}

pub fn default_distance_weight() -> f64 {
    0.7
}

pub fn default_rating_weight() -> f64 {
    0.2
}

pub fn default_acceptance_weight() -> f64 {
    0.1
}

pub fn default_offer_ttl_seconds() -> u64 {
    20
}

pub fn default_expiry_sweep_interval_seconds() -> u64 {
    5
}

pub fn default_acceptance_window_hours() -> u64 {
    168
}

pub fn default_min_acceptance_samples() -> u32 {
    5
}

pub fn default_surge_refresh_interval_seconds() -> u64 {
    60
}

pub fn default_demand_window_minutes() -> u64 {
    10
}

pub fn default_min_multiplier() -> f64 {
    1.0
}

pub fn default_max_multiplier() -> f64 {
    5.0
}

pub fn default_currency() -> String {
    "USD".to_string()
}

pub fn default_average_speed_kmh() -> f64 {
    30.0
}

pub fn default_vehicle_rates() -> HashMap<String, VehicleRate> {
    let rate = |base_fare, per_km, per_minute, minimum_fare| VehicleRate {
        base_fare,
        per_km,
        per_minute,
        minimum_fare,
    };

    HashMap::from([
        ("standard".to_string(), rate(2.5, 1.2, 0.25, 6.0)),
        ("comfort".to_string(), rate(3.5, 1.6, 0.35, 8.0)),
        ("premium".to_string(), rate(5.0, 2.4, 0.5, 12.0)),
        ("xl".to_string(), rate(4.0, 2.0, 0.4, 10.0)),
    ])
}

pub fn default_poison_threshold() -> u32 {
    5
}

pub fn default_max_redeliveries() -> u32 {
    3
}

pub fn default_unrecoverable_error_classes() -> Vec<String> {
    vec![
        "RIDE_NOT_FOUND".to_string(),
        "INVALID_RIDE_STATE_TRANSITION".to_string(),
        "VALIDATION".to_string(),
        "SERIALIZATION".to_string(),
    ]
}

pub fn default_poison_window_seconds() -> u64 {
    3600
}

pub fn default_dlq_consumer_group() -> String {
    "ride-dispatch-dlq".to_string()
}

pub fn default_dlq_poll_interval_ms() -> u64 {
    1000
}

pub fn default_dlq_read_batch_size() -> u32 {
    100
}

pub fn default_store_type() -> String {
    "memory".to_string()
}

pub fn default_postgres_port() -> u16 {
    5432
}

pub fn default_max_connections() -> u32 {
    20
}

pub fn default_connection_timeout() -> u64 {
    30
}

pub fn default_redis_port() -> u16 {
    6379
}

pub fn default_lock_backend() -> String {
    "memory".to_string()
}

pub fn default_publisher() -> String {
    "memory".to_string()
}

pub fn default_stream_max_len() -> usize {
    10_000
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_api_port() -> u16 {
    8080
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}
