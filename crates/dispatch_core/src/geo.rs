//! Coordinates and great-circle distance.
//!
//! All distances are in meters. Coordinates are WGS84 degrees; the proximity
//! index converts them to H3 cells (see [`Coordinate::to_cell`]).

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Mean Earth radius used by the Haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinate {
    /// Build a coordinate, rejecting out-of-range values.
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        let coordinate = Self { lon, lat };
        coordinate.validate()?;
        Ok(coordinate)
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(DispatchError::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            })
        }
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        haversine_m(self, other)
    }

    /// H3 cell containing this point, or `None` for non-finite input.
    pub fn to_cell(&self, resolution: Resolution) -> Option<CellIndex> {
        LatLng::new(self.lat, self.lon)
            .ok()
            .map(|ll| ll.to_cell(resolution))
    }
}

/// Haversine distance between two coordinates in meters.
pub fn haversine_m(a: &Coordinate, b: &Coordinate) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}
