//! Location updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::ValidationError;
use crate::geo::GeoPoint;

/// One reported position of an entity.
///
/// The latest update is the entity's current position for violation purposes;
/// it does not replace history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    /// Reporting entity.
    pub entity_id: EntityId,
    /// Reported position.
    pub point: GeoPoint,
    /// Time of the fix.
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    /// Validates raw coordinates into an update.
    ///
    /// # Errors
    /// `InvalidCoordinate` when lat/lng are out of range or not finite.
    pub fn new(entity_id: EntityId, lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Result<Self, ValidationError> {
        Ok(Self {
            entity_id,
            point: GeoPoint::new(lat, lng)?,
            timestamp,
        })
    }
}
