//! Violation detection.
//!
//! Fences are permitted zones: an entity is safe while it is inside every one
//! of its fences, and a violation is reported when its position falls outside
//! at least one of them. Entities without fences never violate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::fence::{FenceId, FenceKind, Geofence};
use crate::geo::GeoPoint;
use crate::location::LocationUpdate;

/// A location found outside one of the entity's fences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Violating entity.
    pub entity_id: EntityId,
    /// Fence the point was found outside of.
    pub fence_id: FenceId,
    /// That fence's name.
    pub fence_name: String,
    /// That fence's kind.
    pub kind: FenceKind,
    /// Offending position.
    pub location: GeoPoint,
    /// Time of the offending fix.
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    fn new(update: &LocationUpdate, fence: &Geofence) -> Self {
        Self {
            entity_id: update.entity_id,
            fence_id: fence.id,
            fence_name: fence.name.clone(),
            kind: fence.kind(),
            location: update.point,
            timestamp: update.timestamp,
        }
    }
}

/// Checks `update` against `fences` in order and reports the first fence the
/// point lies outside of. Later fences are not evaluated.
#[must_use]
pub fn evaluate(update: &LocationUpdate, fences: &[Geofence]) -> Option<Violation> {
    fences
        .iter()
        .find(|fence| !fence.contains(&update.point))
        .map(|fence| Violation::new(update, fence))
}

/// Checks every fence and reports all violations, in fence order.
#[must_use]
pub fn evaluate_all(update: &LocationUpdate, fences: &[Geofence]) -> Vec<Violation> {
    fences
        .iter()
        .filter(|fence| !fence.contains(&update.point))
        .map(|fence| Violation::new(update, fence))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fence::{FenceGeometry, FenceTemplate};

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng).unwrap()
    }

    fn circle(lat: f64, lng: f64, radius: f64, name: &str) -> Geofence {
        FenceTemplate::new(FenceGeometry::circle(p(lat, lng), radius).unwrap())
            .named(name)
            .instantiate(FenceId::new())
            .unwrap()
    }

    fn update_at(lat: f64, lng: f64) -> LocationUpdate {
        LocationUpdate::new(EntityId::new(), lat, lng, Utc::now()).unwrap()
    }

    #[test]
    fn no_fences_never_violates() {
        for (lat, lng) in [(0.0, 0.0), (89.0, 179.0), (-45.0, 12.0)] {
            assert!(evaluate(&update_at(lat, lng), &[]).is_none());
            assert!(evaluate_all(&update_at(lat, lng), &[]).is_empty());
        }
    }

    #[test]
    fn inside_every_fence_is_safe() {
        let fences = vec![circle(0.0, 0.0, 1000.0, "a"), circle(0.001, 0.0, 1000.0, "b")];
        assert!(evaluate(&update_at(0.0005, 0.0), &fences).is_none());
    }

    #[test]
    fn reports_first_violated_fence_only() {
        let f1 = circle(0.0, 0.0, 1000.0, "contains");
        let f2 = circle(10.0, 10.0, 1000.0, "second");
        let f3 = circle(-10.0, -10.0, 1000.0, "third");
        let f2_id = f2.id;
        let fences = vec![f1, f2, f3];

        let update = update_at(0.0, 0.0);
        let violation = evaluate(&update, &fences).unwrap();
        assert_eq!(violation.fence_id, f2_id);
        assert_eq!(violation.fence_name, "second");
        assert_eq!(violation.kind, FenceKind::Circle);
        assert_eq!(violation.entity_id, update.entity_id);
        assert_eq!(violation.location, update.point);
    }

    #[test]
    fn evaluate_all_enumerates_in_order() {
        let fences = vec![
            circle(0.0, 0.0, 1000.0, "contains"),
            circle(10.0, 10.0, 1000.0, "second"),
            circle(-10.0, -10.0, 1000.0, "third"),
        ];
        let names: Vec<String> = evaluate_all(&update_at(0.0, 0.0), &fences)
            .into_iter()
            .map(|v| v.fence_name)
            .collect();
        assert_eq!(names, vec!["second", "third"]);
    }

    #[test]
    fn polygon_exit_is_a_violation() {
        let square = FenceTemplate::new(
            FenceGeometry::polygon(vec![p(0.0, 0.0), p(0.0, 1.0), p(1.0, 1.0), p(1.0, 0.0)]).unwrap(),
        )
        .instantiate(FenceId::new())
        .unwrap();
        let fences = vec![square];
        assert!(evaluate(&update_at(0.5, 0.5), &fences).is_none());
        let v = evaluate(&update_at(1.5, 0.5), &fences).unwrap();
        assert_eq!(v.kind, FenceKind::Polygon);
    }
}
