//! Fare estimation from configured per-vehicle rates

use common::{round_half_up, Fare, Location, VehicleType};
use config::{FaresConfig, VehicleRate};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone)]
pub struct FareEstimator {
    config: FaresConfig,
}

impl FareEstimator {
    pub fn new(config: FaresConfig) -> Self {
        Self { config }
    }

    fn rate(&self, vehicle_type: VehicleType) -> Result<&VehicleRate> {
        self.config
            .vehicle_types
            .get(vehicle_type.as_str())
            .ok_or_else(|| {
                DispatchError::Validation(format!("no fare rates configured for {}", vehicle_type.as_str()))
            })
    }

    /// Seconds needed to cover `distance_meters` at the configured average speed
    pub fn travel_seconds(&self, distance_meters: f64) -> u32 {
        let meters_per_second = self.config.average_speed_kmh * 1000.0 / 3600.0;
        if meters_per_second <= 0.0 {
            return 0;
        }
        (distance_meters / meters_per_second).round() as u32
    }

    /// Base fare for the trip before surge:
    /// `base + per_km * km + per_minute * minutes`, floored at the minimum fare
    pub fn base_fare(&self, pickup: &Location, dropoff: &Location, vehicle_type: VehicleType) -> Result<f64> {
        let rate = self.rate(vehicle_type)?;
        let distance_km = pickup.distance_meters_to(dropoff) / 1000.0;
        let minutes = self.travel_seconds(distance_km * 1000.0) as f64 / 60.0;

        let fare = rate.base_fare + rate.per_km * distance_km + rate.per_minute * minutes;
        Ok(round_half_up(fare.max(rate.minimum_fare), 2))
    }

    pub fn estimate(
        &self,
        pickup: &Location,
        dropoff: &Location,
        vehicle_type: VehicleType,
        surge_multiplier: f64,
    ) -> Result<Fare> {
        let base = self.base_fare(pickup, dropoff, vehicle_type)?;
        Ok(Fare::new(base, surge_multiplier, self.config.currency.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_short_trip_hits_minimum_fare() {
        let estimator = FareEstimator::new(FaresConfig::default());
        let pickup = testing::pickup();

        let fare = estimator
            .estimate(&pickup, &pickup, VehicleType::Standard, 1.0)
            .unwrap();
        assert_eq!(fare.base_fare(), 6.0);
        assert_eq!(fare.currency(), "USD");
    }

    #[test]
    fn test_surge_scales_estimate_only() {
        let estimator = FareEstimator::new(FaresConfig::default());
        let pickup = testing::pickup();
        let dropoff = testing::location_north_of(&pickup, 10_000.0);

        let plain = estimator.estimate(&pickup, &dropoff, VehicleType::Standard, 1.0).unwrap();
        let surged = estimator.estimate(&pickup, &dropoff, VehicleType::Standard, 2.0).unwrap();

        // 2.5 + 1.2 * 10 km + 0.25 * 20 min
        assert!((plain.base_fare() - 19.5).abs() < 0.05, "got {}", plain.base_fare());
        assert_eq!(plain.base_fare(), surged.base_fare());
        assert_eq!(surged.estimated(), round_half_up(plain.base_fare() * 2.0, 2));
    }

    #[test]
    fn test_travel_seconds_at_thirty_kmh() {
        let estimator = FareEstimator::new(FaresConfig::default());
        assert_eq!(estimator.travel_seconds(500.0), 60);
    }

    #[test]
    fn test_missing_rate_is_validation_error() {
        let mut config = FaresConfig::default();
        config.vehicle_types.remove("xl");
        let estimator = FareEstimator::new(config);
        let pickup = testing::pickup();

        assert!(matches!(
            estimator.estimate(&pickup, &pickup, VehicleType::Xl, 1.0),
            Err(DispatchError::Validation(_))
        ));
    }
}
