//! Geofence definitions.
//!
//! A geofence is a named permitted region assigned to one entity. Geometry is
//! fixed at creation: changing a fence means deleting it and creating a new
//! one with a fresh id.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::geo::{point_in_circle, point_in_polygon, GeoPoint};

/// Maximum length of a fence name.
pub const MAX_FENCE_NAME_LEN: usize = 256;

/// Maximum number of polygon vertices accepted on creation.
pub const MAX_POLYGON_VERTICES: usize = 10_000;

/// Unique identifier for a geofence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FenceId(Uuid);

impl FenceId {
    /// Create a new random fence id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FenceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Shape of a geofence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceKind {
    /// Center plus radius in meters.
    Circle,
    /// Implicitly closed vertex ring.
    Polygon,
}

impl fmt::Display for FenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circle => write!(f, "circle"),
            Self::Polygon => write!(f, "polygon"),
        }
    }
}

/// Fence geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FenceGeometry {
    /// All points within `radius_meters` of `center`.
    Circle {
        /// Circle center.
        center: GeoPoint,
        /// Radius in meters, finite and positive.
        radius_meters: f64,
    },
    /// Area enclosed by `vertices`, first and last implicitly connected.
    Polygon {
        /// Ordered ring vertices.
        vertices: Vec<GeoPoint>,
    },
}

impl FenceGeometry {
    /// Validated circle geometry.
    ///
    /// # Errors
    /// `InvalidRadius` unless the radius is finite and positive.
    pub fn circle(center: GeoPoint, radius_meters: f64) -> Result<Self, ValidationError> {
        let geometry = Self::Circle {
            center,
            radius_meters,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Validated polygon geometry.
    ///
    /// Consecutive repeated vertices are collapsed and an explicit closing
    /// vertex equal to the first vertex is dropped; the ring is closed
    /// implicitly either way.
    ///
    /// # Errors
    /// `TooFewVertices` if fewer than three vertices remain, `FieldTooLong`
    /// past [`MAX_POLYGON_VERTICES`].
    pub fn polygon(vertices: Vec<GeoPoint>) -> Result<Self, ValidationError> {
        let geometry = Self::Polygon {
            vertices: normalize_ring(vertices),
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Checks the structural invariants. Used on every path that builds a
    /// fence, including deserialized input.
    ///
    /// # Errors
    /// See [`FenceGeometry::circle`] and [`FenceGeometry::polygon`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Circle { radius_meters, .. } => {
                if radius_meters.is_finite() && *radius_meters > 0.0 {
                    Ok(())
                } else {
                    Err(ValidationError::InvalidRadius {
                        radius_meters: *radius_meters,
                    })
                }
            }
            Self::Polygon { vertices } => {
                if vertices.len() > MAX_POLYGON_VERTICES {
                    return Err(ValidationError::FieldTooLong {
                        field: "vertices".to_string(),
                        max_length: MAX_POLYGON_VERTICES,
                    });
                }
                let count = distinct_vertices(vertices);
                if count < 3 {
                    return Err(ValidationError::TooFewVertices { count });
                }
                Ok(())
            }
        }
    }

    /// The geometry's kind.
    #[must_use]
    pub const fn kind(&self) -> FenceKind {
        match self {
            Self::Circle { .. } => FenceKind::Circle,
            Self::Polygon { .. } => FenceKind::Polygon,
        }
    }

    /// Returns true if `point` is inside the region.
    #[must_use]
    pub fn contains(&self, point: &GeoPoint) -> bool {
        match self {
            Self::Circle {
                center,
                radius_meters,
            } => point_in_circle(point, center, *radius_meters),
            Self::Polygon { vertices } => point_in_polygon(point, vertices),
        }
    }
}

fn normalize_ring(mut vertices: Vec<GeoPoint>) -> Vec<GeoPoint> {
    vertices.dedup();
    if vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    vertices
}

/// Number of distinct vertices; a repeated or closing vertex counts once.
fn distinct_vertices(vertices: &[GeoPoint]) -> usize {
    // `+ 0.0` folds -0.0 into 0.0 so equal coordinates hash equally.
    let keys: HashSet<(u64, u64)> = vertices
        .iter()
        .map(|v| ((v.lat() + 0.0).to_bits(), (v.lng() + 0.0).to_bits()))
        .collect();
    keys.len()
}

/// A geofence assigned to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Registry-wide unique id.
    pub id: FenceId,
    /// Display name.
    pub name: String,
    /// Region.
    pub geometry: FenceGeometry,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Geofence {
    /// The fence's kind.
    #[must_use]
    pub const fn kind(&self) -> FenceKind {
        self.geometry.kind()
    }

    /// Returns true if `point` is inside the fence.
    #[must_use]
    pub fn contains(&self, point: &GeoPoint) -> bool {
        self.geometry.contains(point)
    }

    /// Checks the name and geometry of a fully built fence, e.g. one that was
    /// deserialized rather than instantiated from a template.
    ///
    /// # Errors
    /// As for [`FenceTemplate::validate`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;
        self.geometry.validate()
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > MAX_FENCE_NAME_LEN {
        return Err(ValidationError::FieldTooLong {
            field: "name".to_string(),
            max_length: MAX_FENCE_NAME_LEN,
        });
    }
    Ok(())
}

/// Creation input for one or many fences.
///
/// Each instantiation gets its own id and creation time, so a template can be
/// stamped onto several entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FenceTemplate {
    /// Optional display name. Defaults to `Geofence HH:MM:SS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Region shared by every instance.
    pub geometry: FenceGeometry,
}

impl FenceTemplate {
    /// Template with the default generated name.
    #[must_use]
    pub const fn new(geometry: FenceGeometry) -> Self {
        Self {
            name: None,
            geometry,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Checks the name and geometry.
    ///
    /// # Errors
    /// Geometry errors, or `FieldTooLong` for an oversized name.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        self.geometry.validate()
    }

    /// Stamps a fence with the given id, created now.
    ///
    /// # Errors
    /// See [`FenceTemplate::validate`].
    pub fn instantiate(&self, id: FenceId) -> Result<Geofence, ValidationError> {
        self.instantiate_at(id, Utc::now())
    }

    /// Stamps a fence with the given id and creation time.
    ///
    /// # Errors
    /// See [`FenceTemplate::validate`].
    pub fn instantiate_at(&self, id: FenceId, created_at: DateTime<Utc>) -> Result<Geofence, ValidationError> {
        self.validate()?;
        let name = match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("Geofence {}", created_at.format("%H:%M:%S")),
        };
        let geometry = match &self.geometry {
            FenceGeometry::Polygon { vertices } => FenceGeometry::Polygon {
                vertices: normalize_ring(vertices.clone()),
            },
            circle => circle.clone(),
        };
        Ok(Geofence {
            id,
            name,
            geometry,
            created_at,
        })
    }
}
