use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::{HistoryEntry, HistoryStore, StoreError};
use crate::entity::EntityId;
use crate::geo::GeoPoint;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory history store.
///
/// Keeps at most `per_entity_limit` entries per entity, evicting the oldest
/// appended entry first.
#[derive(Debug)]
pub struct InMemoryHistoryStore {
    per_entity_limit: usize,
    state: RwLock<HashMap<EntityId, VecDeque<HistoryEntry>>>,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::with_limit(10_000)
    }
}

impl InMemoryHistoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store retaining at most `per_entity_limit` entries per entity.
    #[must_use]
    pub fn with_limit(per_entity_limit: usize) -> Self {
        Self {
            per_entity_limit: per_entity_limit.max(1),
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries held for an entity.
    pub fn len_for(&self, entity_id: EntityId) -> Result<usize, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("history.len_for"))?;
        Ok(state.get(&entity_id).map_or(0, VecDeque::len))
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, entity_id: EntityId, point: GeoPoint, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("history.append"))?;
        let entries = state.entry(entity_id).or_default();
        if entries.len() >= self.per_entity_limit {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry { point, timestamp });
        Ok(())
    }

    fn query_recent(&self, entity_id: EntityId, max: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("history.query_recent"))?;
        let Some(entries) = state.get(&entity_id) else {
            return Ok(Vec::new());
        };
        // Newest append first, then a stable sort so equal timestamps keep
        // that order.
        let mut out: Vec<HistoryEntry> = entries.iter().rev().copied().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(max);
        Ok(out)
    }
}
