//! Location history contract.
//!
//! The core writes every accepted update through to a [`HistoryStore`] but
//! does not own the store: production deployments plug in a document or
//! time-series database. [`InMemoryHistoryStore`] is a thread-safe reference
//! implementation for tests and embedded use.

mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::EntityId;
use crate::geo::GeoPoint;

pub use memory::InMemoryHistoryStore;

/// Default number of entries returned by a recent-history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Errors reported by a history backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend temporarily unreachable. Safe to retry.
    #[error("History store unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the operation.
    #[error("History store backend error: {0}")]
    Backend(String),

    /// Encoding or decoding failed.
    #[error("History serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true if the same call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One recorded position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Recorded position.
    pub point: GeoPoint,
    /// Time of the fix.
    pub timestamp: DateTime<Utc>,
}

/// Append-only location history.
///
/// Implementations must be safe to call from many threads. `append` is the
/// only call the ingestion pipeline blocks on.
pub trait HistoryStore: Send + Sync {
    /// Record a position for an entity.
    fn append(&self, entity_id: EntityId, point: GeoPoint, timestamp: DateTime<Utc>) -> Result<(), StoreError>;

    /// Up to `max` entries for an entity, most recent first.
    fn query_recent(&self, entity_id: EntityId, max: usize) -> Result<Vec<HistoryEntry>, StoreError>;
}
