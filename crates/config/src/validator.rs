use crate::*;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("Service name is required")]
    MissingServiceName,

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("{field} must be a positive float")]
    InvalidPositiveFloat { field: String },

    #[error("Matching: {message}")]
    InvalidMatching { message: String },

    #[error("Scoring weights must be non-negative and sum to 1.0, got {sum}")]
    InvalidScoringWeights { sum: f64 },

    #[error("Driver call: {message}")]
    InvalidDriverCall { message: String },

    #[error("Surge: {message}")]
    InvalidSurge { message: String },

    #[error("Fare for '{vehicle_type}': {message}")]
    InvalidFare { vehicle_type: String, message: String },

    #[error("Dead letter: {message}")]
    InvalidDeadLetter { message: String },

    #[error("Store: {message}")]
    InvalidStore { message: String },

    #[error("Lock: {message}")]
    InvalidLock { message: String },

    #[error("Events: {message}")]
    InvalidEvents { message: String },

    #[error("Client endpoint '{name}' is not a valid URL: {message}")]
    InvalidClientUrl { name: String, message: String },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &DispatchConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    if config.service.name.trim().is_empty() {
        report.add_error(ValidationError::MissingServiceName);
    }

    validate_matching(&config.matching, &mut report);
    validate_driver_call(&config.driver_call, &config.matching, &mut report);
    validate_surge(&config.surge, &mut report);
    validate_fares(&config.fares, &mut report);
    validate_dead_letter(&config.dead_letter, &mut report);
    validate_store(&config.store, &mut report);
    validate_backends(config, &mut report);
    validate_clients(&config.clients, &mut report);

    if !["pretty", "json", "compact"].contains(&config.monitoring.log_format.as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(
            config.monitoring.log_format.clone(),
        ));
    }

    report
}

fn require_positive(value: u64, field: &str, report: &mut ValidationReport) {
    if value == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: field.to_string(),
        });
    }
}

fn validate_matching(matching: &MatchingConfig, report: &mut ValidationReport) {
    require_positive(matching.batch_interval_ms, "matching.batch_interval_ms", report);
    require_positive(matching.batch_size as u64, "matching.batch_size", report);
    require_positive(matching.lock_lease_ms, "matching.lock_lease_ms", report);
    require_positive(
        matching.max_calls_per_request as u64,
        "matching.max_calls_per_request",
        report,
    );
    require_positive(matching.candidate_limit as u64, "matching.candidate_limit", report);
    require_positive(matching.request_ttl_seconds, "matching.request_ttl_seconds", report);
    require_positive(
        matching.timeout_sweep_interval_seconds,
        "matching.timeout_sweep_interval_seconds",
        report,
    );
    require_positive(
        matching.external_call_timeout_ms,
        "matching.external_call_timeout_ms",
        report,
    );

    if matching.lock_key.trim().is_empty() {
        report.add_error(ValidationError::InvalidMatching {
            message: "lock_key must not be empty".to_string(),
        });
    }

    // The lease must lapse before the next tick so a crashed holder cannot block a cycle
    if matching.lock_lease_ms >= matching.batch_interval_ms {
        report.add_error(ValidationError::InvalidMatching {
            message: format!(
                "lock_lease_ms ({}) must be shorter than batch_interval_ms ({})",
                matching.lock_lease_ms, matching.batch_interval_ms
            ),
        });
    }

    if !(matching.max_search_radius_meters > 0.0) {
        report.add_error(ValidationError::InvalidPositiveFloat {
            field: "matching.max_search_radius_meters".to_string(),
        });
    }

    if matching.candidate_limit < matching.max_calls_per_request {
        report.add_warning(
            "matching.candidate_limit",
            "smaller than max_calls_per_request; fewer offers than allowed will be sent",
        );
    }

    let w = &matching.weights;
    if w.distance < 0.0 || w.rating < 0.0 || w.acceptance < 0.0 || (w.sum() - 1.0).abs() > 1e-3 {
        report.add_error(ValidationError::InvalidScoringWeights { sum: w.sum() });
    }
}

fn validate_driver_call(
    driver_call: &DriverCallConfig,
    matching: &MatchingConfig,
    report: &mut ValidationReport,
) {
    require_positive(driver_call.offer_ttl_seconds, "driver_call.offer_ttl_seconds", report);
    require_positive(
        driver_call.expiry_sweep_interval_seconds,
        "driver_call.expiry_sweep_interval_seconds",
        report,
    );
    require_positive(
        driver_call.acceptance_window_hours,
        "driver_call.acceptance_window_hours",
        report,
    );

    if driver_call.offer_ttl_seconds >= matching.request_ttl_seconds {
        report.add_error(ValidationError::InvalidDriverCall {
            message: format!(
                "offer_ttl_seconds ({}) must be shorter than matching.request_ttl_seconds ({})",
                driver_call.offer_ttl_seconds, matching.request_ttl_seconds
            ),
        });
    }
}

fn validate_surge(surge: &SurgeConfig, report: &mut ValidationReport) {
    require_positive(surge.refresh_interval_seconds, "surge.refresh_interval_seconds", report);
    require_positive(surge.demand_window_minutes, "surge.demand_window_minutes", report);

    let lower = common::MIN_SURGE_MULTIPLIER;
    let upper = common::MAX_SURGE_MULTIPLIER;
    if surge.min_multiplier < lower
        || surge.max_multiplier > upper
        || surge.min_multiplier > surge.max_multiplier
    {
        report.add_error(ValidationError::InvalidSurge {
            message: format!(
                "multiplier bounds [{}, {}] must lie within [{}, {}]",
                surge.min_multiplier, surge.max_multiplier, lower, upper
            ),
        });
    }

    for cell in &surge.cells {
        if common::geo::parse_cell(cell).is_err() {
            report.add_error(ValidationError::InvalidSurge {
                message: format!("'{}' is not a valid geo-cell index", cell),
            });
        }
    }
}

fn validate_fares(fares: &FaresConfig, report: &mut ValidationReport) {
    if fares.currency.trim().is_empty() {
        report.add_error(ValidationError::InvalidFare {
            vehicle_type: "*".to_string(),
            message: "currency must not be empty".to_string(),
        });
    }
    if !(fares.average_speed_kmh > 0.0) {
        report.add_error(ValidationError::InvalidPositiveFloat {
            field: "fares.average_speed_kmh".to_string(),
        });
    }

    for (name, rate) in &fares.vehicle_types {
        if common::VehicleType::parse(name).is_none() {
            report.add_error(ValidationError::InvalidFare {
                vehicle_type: name.clone(),
                message: "unknown vehicle type".to_string(),
            });
        }
        if rate.base_fare < 0.0 || rate.per_km < 0.0 || rate.per_minute < 0.0 || rate.minimum_fare < 0.0 {
            report.add_error(ValidationError::InvalidFare {
                vehicle_type: name.clone(),
                message: "rates must be non-negative".to_string(),
            });
        }
    }

    for vehicle in ["standard", "comfort", "premium", "xl"] {
        if !fares.vehicle_types.contains_key(vehicle) {
            report.add_warning(
                "fares.vehicle_types",
                &format!("no rates for '{}'; rides of that type cannot be priced", vehicle),
            );
        }
    }
}

fn validate_dead_letter(dlq: &DeadLetterConfig, report: &mut ValidationReport) {
    if dlq.poison_threshold == 0 {
        report.add_error(ValidationError::InvalidDeadLetter {
            message: "poison_threshold must be a positive integer".to_string(),
        });
    }
    if dlq.poison_window_seconds == 0 {
        report.add_error(ValidationError::InvalidDeadLetter {
            message: "poison_window_seconds must be a positive integer".to_string(),
        });
    }
    if dlq.read_batch_size == 0 || dlq.poll_interval_ms == 0 {
        report.add_error(ValidationError::InvalidDeadLetter {
            message: "read_batch_size and poll_interval_ms must be positive".to_string(),
        });
    }
    if dlq.consumer_group.trim().is_empty() {
        report.add_error(ValidationError::InvalidDeadLetter {
            message: "consumer_group must not be blank".to_string(),
        });
    }
}

fn validate_store(store: &StoreConfig, report: &mut ValidationReport) {
    match store.store_type.as_str() {
        "memory" => {}
        "postgres" => match store.postgres {
            Some(ref pg) => {
                if pg.password.is_empty() || pg.password.starts_with("${") {
                    report.add_error(ValidationError::InvalidEnvVar {
                        var: "POSTGRES_PASSWORD".to_string(),
                        message: "postgres password is missing or unresolved".to_string(),
                    });
                }
                if pg.max_connections == 0 {
                    report.add_error(ValidationError::InvalidStore {
                        message: "max_connections must be a positive integer".to_string(),
                    });
                }
            }
            None => report.add_error(ValidationError::InvalidStore {
                message: "Store type is 'postgres' but postgres configuration is missing"
                    .to_string(),
            }),
        },
        other => report.add_error(ValidationError::InvalidStore {
            message: format!("Invalid store type '{}'. Must be one of: memory, postgres", other),
        }),
    }

    if let Some(ref redis) = store.redis {
        if redis.host.is_empty() || redis.host.starts_with("${") {
            report.add_error(ValidationError::InvalidEnvVar {
                var: "REDIS_HOST".to_string(),
                message: "redis host is missing or unresolved".to_string(),
            });
        }
    }
}

fn validate_backends(config: &DispatchConfig, report: &mut ValidationReport) {
    let has_redis = config.store.redis.is_some();

    match config.lock.backend.as_str() {
        "memory" => {}
        "redis" if has_redis => {}
        "redis" => report.add_error(ValidationError::InvalidLock {
            message: "backend 'redis' requires store.redis".to_string(),
        }),
        other => report.add_error(ValidationError::InvalidLock {
            message: format!("Invalid lock backend '{}'. Must be one of: memory, redis", other),
        }),
    }

    match config.events.publisher.as_str() {
        "memory" | "log" => {}
        "redis" if has_redis => {}
        "redis" => report.add_error(ValidationError::InvalidEvents {
            message: "publisher 'redis' requires store.redis".to_string(),
        }),
        other => report.add_error(ValidationError::InvalidEvents {
            message: format!(
                "Invalid publisher '{}'. Must be one of: memory, log, redis",
                other
            ),
        }),
    }

    if config.lock.backend == "memory" {
        report.add_warning(
            "lock.backend",
            "in-memory lock only excludes runs within this process",
        );
    }
}

fn validate_clients(clients: &ClientsConfig, report: &mut ValidationReport) {
    for (name, value) in [
        ("location_url", &clients.location_url),
        ("profile_url", &clients.profile_url),
    ] {
        if let Some(raw) = value {
            if let Err(e) = url::Url::parse(raw) {
                report.add_error(ValidationError::InvalidClientUrl {
                    name: name.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let report = validate_config(&DispatchConfig::default());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_dead_letter_window_and_batch_must_be_positive() {
        let mut cfg = DispatchConfig::default();
        cfg.dead_letter.poison_window_seconds = 0;
        cfg.dead_letter.read_batch_size = 0;
        let report = validate_config(&cfg);
        assert_eq!(
            report
                .errors
                .iter()
                .filter(|e| matches!(e, ValidationError::InvalidDeadLetter { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut cfg = DispatchConfig::default();
        cfg.matching.weights.rating = 0.5;
        let report = validate_config(&cfg);
        assert_matches!(
            report.errors.as_slice(),
            [ValidationError::InvalidScoringWeights { .. }]
        );
    }

    #[test]
    fn test_lease_must_be_shorter_than_interval() {
        let mut cfg = DispatchConfig::default();
        cfg.matching.lock_lease_ms = cfg.matching.batch_interval_ms;
        let report = validate_config(&cfg);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidMatching { .. })));
    }

    #[test]
    fn test_surge_bounds() {
        let mut cfg = DispatchConfig::default();
        cfg.surge.max_multiplier = 6.0;
        assert!(!validate_config(&cfg).is_valid());

        cfg.surge.max_multiplier = 4.0;
        cfg.surge.min_multiplier = 4.5;
        assert!(!validate_config(&cfg).is_valid());
    }

    #[test]
    fn test_postgres_requires_section() {
        let mut cfg = DispatchConfig::default();
        cfg.store.store_type = "postgres".to_string();
        let report = validate_config(&cfg);
        assert_matches!(report.errors.as_slice(), [ValidationError::InvalidStore { .. }]);
    }

    #[test]
    fn test_redis_backends_require_redis() {
        let mut cfg = DispatchConfig::default();
        cfg.lock.backend = "redis".to_string();
        cfg.events.publisher = "redis".to_string();
        let report = validate_config(&cfg);
        assert_eq!(report.errors.len(), 2);

        cfg.store.redis = Some(RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db_index: 0,
        });
        assert!(validate_config(&cfg).is_valid());
    }

    #[test]
    fn test_client_urls_are_checked() {
        let mut cfg = DispatchConfig::default();
        cfg.clients.location_url = Some("not a url".to_string());
        let report = validate_config(&cfg);
        assert_matches!(
            report.errors.as_slice(),
            [ValidationError::InvalidClientUrl { .. }]
        );
    }

    #[test]
    fn test_unknown_vehicle_type_rejected() {
        let mut cfg = DispatchConfig::default();
        cfg.fares.vehicle_types.insert(
            "hovercraft".to_string(),
            VehicleRate {
                base_fare: 1.0,
                per_km: 1.0,
                per_minute: 1.0,
                minimum_fare: 0.0,
            },
        );
        assert!(!validate_config(&cfg).is_valid());
    }
}
