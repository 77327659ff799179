//! Common types used across the dispatch service
//!
//! This module provides the value objects shared by rides, driver calls
//! and matching requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geo;

/// Lower bound of a surge multiplier
pub const MIN_SURGE_MULTIPLIER: f64 = 1.0;

/// Upper bound of a surge multiplier
pub const MAX_SURGE_MULTIPLIER: f64 = 5.0;

/// Unique identifier for drivers (owned by the driver directory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub Uuid);

impl DriverId {
    /// Create a new random DriverId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a DriverId from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DriverId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for passengers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassengerId(pub Uuid);

impl PassengerId {
    /// Create a new random PassengerId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a PassengerId from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PassengerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PassengerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vehicle class requested by a passenger and offered by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    #[default]
    Standard,
    Comfort,
    Premium,
    Xl,
}

impl VehicleType {
    /// Stable lowercase name, also used as config key
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Standard => "standard",
            VehicleType::Comfort => "comfort",
            VehicleType::Premium => "premium",
            VehicleType::Xl => "xl",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Some(VehicleType::Standard),
            "comfort" => Some(VehicleType::Comfort),
            "premium" => Some(VehicleType::Premium),
            "xl" => Some(VehicleType::Xl),
            _ => None,
        }
    }
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point on the map together with its geo-cell bucket.
///
/// Immutable once built; constructors validate the coordinate ranges and
/// require a non-blank geo-cell index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LocationRecord")]
pub struct Location {
    latitude: f64,
    longitude: f64,
    address: Option<String>,
    geo_cell: String,
}

/// Wire shape of a [`Location`]. A missing geo-cell is derived from the
/// coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationRecord {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub geo_cell: Option<String>,
}

impl TryFrom<LocationRecord> for Location {
    type Error = Error;

    fn try_from(record: LocationRecord) -> Result<Self> {
        match record.geo_cell {
            Some(cell) => Location::new(record.latitude, record.longitude, record.address, cell),
            None => Location::from_coordinates(record.latitude, record.longitude, record.address),
        }
    }
}

impl Location {
    /// Build a location with an explicit geo-cell index
    pub fn new(
        latitude: f64,
        longitude: f64,
        address: Option<String>,
        geo_cell: impl Into<String>,
    ) -> Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidCoordinate(format!(
                "latitude must be within [-90, 90], got {}",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidCoordinate(format!(
                "longitude must be within [-180, 180], got {}",
                longitude
            )));
        }
        let geo_cell = geo_cell.into();
        if geo_cell.trim().is_empty() {
            return Err(Error::InvalidGeoCell("geo-cell index must not be blank".to_string()));
        }

        Ok(Self {
            latitude,
            longitude,
            address,
            geo_cell,
        })
    }

    /// Build a location, deriving the geo-cell from the coordinates
    pub fn from_coordinates(latitude: f64, longitude: f64, address: Option<String>) -> Result<Self> {
        let cell = geo::cell_for(latitude, longitude, geo::DEFAULT_RESOLUTION)?;
        Self::new(latitude, longitude, address, cell)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn geo_cell(&self) -> &str {
        &self.geo_cell
    }

    /// Great-circle distance to another location, in meters
    pub fn distance_meters_to(&self, other: &Location) -> f64 {
        geo::haversine_meters(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}

/// Fare value attached to a ride.
///
/// `estimated = base_fare * surge_multiplier`; `total_fare` is only known once
/// the trip completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fare {
    base_fare: f64,
    surge_multiplier: f64,
    total_fare: Option<f64>,
    currency: String,
}

impl Fare {
    /// Create a fare estimate
    pub fn new(base_fare: f64, surge_multiplier: f64, currency: impl Into<String>) -> Result<Self> {
        if !(base_fare >= 0.0) {
            return Err(Error::InvalidFare(format!(
                "base fare must be >= 0, got {}",
                base_fare
            )));
        }
        if !(MIN_SURGE_MULTIPLIER..=MAX_SURGE_MULTIPLIER).contains(&surge_multiplier) {
            return Err(Error::InvalidFare(format!(
                "surge multiplier must be within [{}, {}], got {}",
                MIN_SURGE_MULTIPLIER, MAX_SURGE_MULTIPLIER, surge_multiplier
            )));
        }
        let currency = currency.into();
        if currency.trim().is_empty() {
            return Err(Error::InvalidFare("currency code must not be blank".to_string()));
        }

        Ok(Self {
            base_fare,
            surge_multiplier,
            total_fare: None,
            currency,
        })
    }

    pub fn base_fare(&self) -> f64 {
        self.base_fare
    }

    pub fn surge_multiplier(&self) -> f64 {
        self.surge_multiplier
    }

    pub fn total_fare(&self) -> Option<f64> {
        self.total_fare
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Estimated price before the trip: base fare scaled by surge
    pub fn estimated(&self) -> f64 {
        round_half_up(self.base_fare * self.surge_multiplier, 2)
    }

    /// Return a copy carrying the final charged amount
    pub fn with_total(&self, total_fare: f64) -> Result<Self> {
        if !(total_fare >= 0.0) {
            return Err(Error::InvalidFare(format!(
                "total fare must be >= 0, got {}",
                total_fare
            )));
        }
        Ok(Self {
            total_fare: Some(total_fare),
            ..self.clone()
        })
    }
}

/// Round to `decimals` places, halves away from zero
pub fn round_half_up(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_location_rejects_out_of_range() {
        assert_matches!(
            Location::new(91.0, 0.0, None, "89283082837ffff"),
            Err(Error::InvalidCoordinate(_))
        );
        assert_matches!(
            Location::new(0.0, -180.5, None, "89283082837ffff"),
            Err(Error::InvalidCoordinate(_))
        );
    }

    #[test]
    fn test_location_requires_geo_cell() {
        assert_matches!(Location::new(10.0, 10.0, None, "  "), Err(Error::InvalidGeoCell(_)));
    }

    #[test]
    fn test_location_from_coordinates_derives_cell() {
        let loc = Location::from_coordinates(37.7749, -122.4194, Some("Market St".into())).unwrap();
        assert!(!loc.geo_cell().is_empty());
        assert_eq!(loc.address(), Some("Market St"));
    }

    #[test]
    fn test_location_deserialize_validates() {
        let err = serde_json::from_str::<Location>(
            r#"{"latitude": 123.0, "longitude": 0.0, "geo_cell": "89283082837ffff"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("latitude"), "got {}", err);

        assert!(serde_json::from_str::<Location>(
            r#"{"latitude": 10.0, "longitude": 10.0, "geo_cell": " "}"#
        )
        .is_err());
    }

    #[test]
    fn test_location_deserialize_derives_missing_cell() {
        let loc: Location =
            serde_json::from_str(r#"{"latitude": 37.7749, "longitude": -122.4194}"#).unwrap();
        let expected = Location::from_coordinates(37.7749, -122.4194, None).unwrap();
        assert_eq!(loc, expected);

        let round_trip: Location = serde_json::from_value(serde_json::to_value(&loc).unwrap()).unwrap();
        assert_eq!(round_trip, loc);
    }

    #[test]
    fn test_fare_estimated() {
        let fare = Fare::new(10.0, 1.5, "USD").unwrap();
        assert_eq!(fare.estimated(), 15.0);
        assert!(fare.total_fare().is_none());

        let done = fare.with_total(17.25).unwrap();
        assert_eq!(done.total_fare(), Some(17.25));
    }

    #[test]
    fn test_fare_bounds() {
        assert!(Fare::new(-1.0, 1.0, "USD").is_err());
        assert!(Fare::new(5.0, 0.9, "USD").is_err());
        assert!(Fare::new(5.0, 5.1, "USD").is_err());
        assert!(Fare::new(5.0, 5.0, "USD").is_ok());
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_half_up(1.005_000_1, 2), 1.01);
        assert_eq!(round_half_up(2.344, 2), 2.34);
        assert_eq!(round_half_up(2.345_000_1, 2), 2.35);
    }

    #[test]
    fn test_vehicle_type_parse() {
        assert_eq!(VehicleType::parse("XL"), Some(VehicleType::Xl));
        assert_eq!(VehicleType::parse("bike"), None);
    }
}
