//! Alert types.
//!
//! Alerts are transient: they live for one fan-out pass and are never
//! persisted. They serialize to JSON so a transport can forward them as-is.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::Violation;
use crate::entity::{EntityId, SubscriberId};
use crate::fence::{FenceId, FenceKind};
use crate::geo::GeoPoint;

/// Unique identifier of one published alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    /// Create a new random alert id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who caused an alert to be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "subscriber_id", rename_all = "snake_case")]
pub enum AlertOrigin {
    /// Raised by the engine itself (fence evaluation).
    System,
    /// Raised by a connected subscriber.
    Subscriber(SubscriberId),
}

impl AlertOrigin {
    /// The originating subscriber, if any.
    #[must_use]
    pub const fn subscriber(&self) -> Option<SubscriberId> {
        match self {
            Self::System => None,
            Self::Subscriber(id) => Some(*id),
        }
    }
}

/// What the alert is about.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertPayload {
    /// The entity left one of its permitted zones.
    FenceViolation {
        fence_id: FenceId,
        fence_name: String,
        kind: FenceKind,
    },
    /// Manually raised danger signal.
    Danger {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// A published alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert id, shared by every delivered copy.
    pub id: AlertId,
    /// Entity the alert is about.
    pub source_entity_id: EntityId,
    /// Publisher.
    pub origin: AlertOrigin,
    /// Alert details.
    pub payload: AlertPayload,
    /// Entity position that triggered the alert.
    pub location: GeoPoint,
    /// Time of that position.
    pub timestamp: DateTime<Utc>,
    /// When the alert was built.
    pub emitted_at: DateTime<Utc>,
}

impl Alert {
    /// System alert for a fence violation.
    #[must_use]
    pub fn fence_violation(violation: &Violation) -> Self {
        Self {
            id: AlertId::new(),
            source_entity_id: violation.entity_id,
            origin: AlertOrigin::System,
            payload: AlertPayload::FenceViolation {
                fence_id: violation.fence_id,
                fence_name: violation.fence_name.clone(),
                kind: violation.kind,
            },
            location: violation.location,
            timestamp: violation.timestamp,
            emitted_at: Utc::now(),
        }
    }

    /// Danger alert raised by a subscriber on behalf of an entity.
    #[must_use]
    pub fn danger(origin: SubscriberId, entity_id: EntityId, location: GeoPoint, message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AlertId::new(),
            source_entity_id: entity_id,
            origin: AlertOrigin::Subscriber(origin),
            payload: AlertPayload::Danger { message },
            location,
            timestamp: now,
            emitted_at: now,
        }
    }

    /// The violated fence, for fence alerts.
    #[must_use]
    pub const fn fence_id(&self) -> Option<FenceId> {
        match &self.payload {
            AlertPayload::FenceViolation { fence_id, .. } => Some(*fence_id),
            AlertPayload::Danger { .. } => None,
        }
    }
}
