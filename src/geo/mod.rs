//! Geometry primitives and containment predicates.
//!
//! Everything in this module is pure: no shared state, safe to call from any
//! number of threads.

/// Containment predicates and great-circle distance.
pub mod evaluator;
/// Validated WGS84 coordinates.
pub mod point;

pub use evaluator::{distance_meters, point_in_circle, point_in_polygon, EARTH_RADIUS_METERS};
pub use point::GeoPoint;
