//! Point containment predicates.
//!
//! Circles are evaluated with great-circle (haversine) distance so radii stay
//! in meters end to end. Polygons are evaluated by even-odd ray casting in the
//! (lng, lat) plane, which is accurate for fences of city scale and below and
//! does not handle rings that cross the antimeridian.

use super::point::GeoPoint;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two points, in meters.
#[must_use]
pub fn distance_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat().to_radians();
    let lat2 = b.lat().to_radians();
    let dlat = (b.lat() - a.lat()).to_radians();
    let dlng = (b.lng() - a.lng()).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1] for antipodal points.
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Returns true if `point` lies within `radius_meters` of `center`.
///
/// The boundary counts as inside.
#[must_use]
pub fn point_in_circle(point: &GeoPoint, center: &GeoPoint, radius_meters: f64) -> bool {
    distance_meters(point, center) <= radius_meters
}

/// Returns true if `point` lies inside the implicitly closed ring `vertices`.
///
/// Uses the half-open crossing rule, so a point on an edge always gets the
/// same answer for the same input. Vertex order (clockwise or not) does not
/// matter; self-intersecting rings follow even-odd semantics. Rings with fewer
/// than three vertices contain nothing.
#[must_use]
pub fn point_in_polygon(point: &GeoPoint, vertices: &[GeoPoint]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }

    let (x, y) = (point.lng(), point.lat());
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (vertices[i].lng(), vertices[i].lat());
        let (xj, yj) = (vertices[j].lng(), vertices[j].lat());
        if (yi > y) != (yj > y) {
            // yi != yj here, the edge straddles the ray.
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng).unwrap()
    }

    fn unit_square_ccw() -> Vec<GeoPoint> {
        vec![p(0.0, 0.0), p(0.0, 1.0), p(1.0, 1.0), p(1.0, 0.0)]
    }

    #[test]
    fn distance_of_one_degree_latitude() {
        let d = distance_meters(&p(0.0, 0.0), &p(1.0, 0.0));
        assert!((d - 111_195.08).abs() < 1.0, "got {d}");
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = p(48.85, 2.35);
        let b = p(40.71, -74.0);
        assert_eq!(distance_meters(&a, &a), 0.0);
        assert!((distance_meters(&a, &b) - distance_meters(&b, &a)).abs() < 1e-6);
    }

    #[test]
    fn antipodal_distance_is_half_circumference() {
        let d = distance_meters(&p(0.0, 0.0), &p(0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_METERS).abs() < 1.0);
    }

    #[test]
    fn circle_contains_points_strictly_inside() {
        let center = p(0.0, 0.0);
        for (lat, lng) in [(0.0, 0.0), (0.005, 0.0), (0.0, -0.008), (0.006, 0.006)] {
            assert!(point_in_circle(&p(lat, lng), &center, 1000.0), "({lat}, {lng})");
        }
    }

    #[test]
    fn circle_excludes_points_beyond_radius() {
        let center = p(0.0, 0.0);
        // ~2.2km north, ~1.1km east, ~1.6km diagonal.
        for (lat, lng) in [(0.02, 0.0), (0.0, 0.01), (0.01, 0.01)] {
            assert!(!point_in_circle(&p(lat, lng), &center, 1000.0), "({lat}, {lng})");
        }
    }

    #[test]
    fn polygon_classifies_centroid_and_far_point_both_windings() {
        let ccw = unit_square_ccw();
        let mut cw = ccw.clone();
        cw.reverse();

        for ring in [&ccw, &cw] {
            assert!(point_in_polygon(&p(0.5, 0.5), ring));
            assert!(!point_in_polygon(&p(5.0, 5.0), ring));
            assert!(!point_in_polygon(&p(-0.5, 0.5), ring));
        }
    }

    #[test]
    fn polygon_handles_concave_ring() {
        // "U" shape open to the north.
        let ring = vec![
            p(0.0, 0.0),
            p(0.0, 3.0),
            p(3.0, 3.0),
            p(3.0, 2.0),
            p(1.0, 2.0),
            p(1.0, 1.0),
            p(3.0, 1.0),
            p(3.0, 0.0),
        ];
        assert!(point_in_polygon(&p(2.0, 0.5), &ring));
        assert!(!point_in_polygon(&p(2.0, 1.5), &ring));
        assert!(point_in_polygon(&p(0.5, 1.5), &ring));
    }

    #[test]
    fn polygon_edge_answer_is_stable() {
        let ring = unit_square_ccw();
        let on_edge = p(0.0, 0.5);
        let first = point_in_polygon(&on_edge, &ring);
        for _ in 0..100 {
            assert_eq!(point_in_polygon(&on_edge, &ring), first);
        }
    }

    #[test]
    fn degenerate_ring_contains_nothing() {
        let ring = vec![p(0.0, 0.0), p(1.0, 1.0)];
        assert!(!point_in_polygon(&p(0.5, 0.5), &ring));
    }
}
