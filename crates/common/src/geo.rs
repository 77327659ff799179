//! Geo primitives: haversine distance and H3 geo-cell helpers.
//!
//! Geo-cells are carried around as H3 index strings so that persisted rows
//! and events stay readable. Default resolution is 9 (~240m cells), which is
//! suitable for city-scale dispatch.

use h3o::{CellIndex, LatLng, Resolution};

use crate::error::{Error, Result};

/// Mean earth radius used by the haversine formula, in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Resolution used when deriving cells from coordinates
pub const DEFAULT_RESOLUTION: Resolution = Resolution::Nine;

/// Great-circle distance between two coordinates, in meters
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1) = (lat1.to_radians(), lon1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lon2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c * 1000.0
}

/// H3 cell index (hex string) containing the coordinate
pub fn cell_for(latitude: f64, longitude: f64, resolution: Resolution) -> Result<String> {
    let ll = LatLng::new(latitude, longitude)
        .map_err(|e| Error::InvalidCoordinate(e.to_string()))?;
    Ok(ll.to_cell(resolution).to_string())
}

/// Parse a geo-cell string into an H3 index
pub fn parse_cell(cell: &str) -> Result<CellIndex> {
    cell.parse::<CellIndex>()
        .map_err(|e| Error::InvalidGeoCell(format!("'{}': {}", cell, e)))
}

/// The cell plus every cell within `ring` grid steps, sorted.
///
/// Cells that are not valid H3 indexes (e.g. externally assigned bucket
/// names) have no known neighbours and yield just themselves.
pub fn neighborhood(cell: &str, ring: u32) -> Vec<String> {
    let mut cells = match parse_cell(cell) {
        Ok(index) => index
            .grid_disk::<Vec<_>>(ring)
            .into_iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>(),
        Err(_) => vec![cell.to_string()],
    };
    cells.sort();
    cells.dedup();
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // San Francisco -> Los Angeles is roughly 559 km
        let d = haversine_meters(37.7749, -122.4194, 34.0522, -118.2437);
        assert!((d / 1000.0 - 559.0).abs() < 5.0, "got {} km", d / 1000.0);
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine_meters(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn test_neighborhood_contains_origin() {
        let cell = cell_for(37.7749, -122.4194, DEFAULT_RESOLUTION).unwrap();
        let ring = neighborhood(&cell, 1);
        assert!(ring.contains(&cell));
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn test_neighborhood_unknown_cell() {
        assert_eq!(neighborhood("downtown-A", 2), vec!["downtown-A".to_string()]);
    }
}
