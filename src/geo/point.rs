use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A WGS84 position in decimal degrees.
///
/// Construction validates the range, so any `GeoPoint` in hand is finite with
/// `lat ∈ [-90, 90]` and `lng ∈ [-180, 180]`. Deserialization goes through the
/// same check.
///
/// # Examples
///
/// ```
/// use geowatch::GeoPoint;
///
/// let p = GeoPoint::new(51.5, -0.12).unwrap();
/// assert_eq!(p.lat(), 51.5);
/// assert!(GeoPoint::new(90.5, 0.0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPoint")]
pub struct GeoPoint {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct RawPoint {
    lat: f64,
    lng: f64,
}

impl TryFrom<RawPoint> for GeoPoint {
    type Error = ValidationError;

    fn try_from(raw: RawPoint) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lng)
    }
}

impl GeoPoint {
    /// Creates a validated point.
    ///
    /// # Errors
    /// `InvalidCoordinate` when either component is non-finite or out of range.
    pub fn new(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        let lat_ok = lat.is_finite() && (-90.0..=90.0).contains(&lat);
        let lng_ok = lng.is_finite() && (-180.0..=180.0).contains(&lng);
        if lat_ok && lng_ok {
            Ok(Self { lat, lng })
        } else {
            Err(ValidationError::InvalidCoordinate { lat, lng })
        }
    }

    /// Latitude in degrees.
    #[must_use]
    pub const fn lat(&self) -> f64 {
        self.lat
    }

    /// Longitude in degrees.
    #[must_use]
    pub const fn lng(&self) -> f64 {
        self.lng
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}
