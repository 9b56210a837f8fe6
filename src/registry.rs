//! Fence registry: entity id → ordered set of active geofences.
//!
//! Each entity's set is synchronized independently and published as an
//! immutable snapshot, so evaluation for one entity never waits on fence edits
//! for another, and a reader sees a set either entirely before or entirely
//! after any single or bulk mutation. Fence ids are unique across the whole
//! registry; uniqueness is enforced by a sharded id index.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info};

use crate::entity::EntityId;
use crate::error::{GeowatchError, GeowatchResult, RegistryError};
use crate::fence::{FenceId, FenceTemplate, Geofence};
use crate::sync::{stable_shard, KeyedSlots};

/// Number of shards in the fence id index.
const ID_INDEX_SHARDS: usize = 16;

/// Ordered fences of one entity, in insertion order.
pub type FenceSet = Arc<Vec<Geofence>>;

/// Outcome of a bulk add.
///
/// Successes are applied even when other entities fail.
#[derive(Debug, Default, Serialize)]
pub struct BulkAddReport {
    /// Entities that received a fence, with the id it got.
    pub added: Vec<(EntityId, FenceId)>,
    /// Entities whose add failed, with the reason.
    #[serde(serialize_with = "serialize_failures")]
    pub failed: Vec<(EntityId, GeowatchError)>,
}

impl BulkAddReport {
    /// True when every entity received its fence.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn serialize_failures<S>(failed: &[(EntityId, GeowatchError)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(failed.len()))?;
    for (entity_id, err) in failed {
        seq.serialize_element(&(entity_id, err.to_string()))?;
    }
    seq.end()
}

#[derive(Debug)]
struct FenceIdIndex {
    shards: Vec<Mutex<HashSet<FenceId>>>,
}

impl FenceIdIndex {
    fn new() -> Self {
        Self {
            shards: (0..ID_INDEX_SHARDS).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    fn shard(&self, id: FenceId) -> &Mutex<HashSet<FenceId>> {
        &self.shards[stable_shard(id.as_uuid().as_bytes(), self.shards.len())]
    }

    /// Reserves `id`; false if it is already taken.
    fn reserve(&self, id: FenceId) -> bool {
        self.shard(id).lock().unwrap_or_else(PoisonError::into_inner).insert(id)
    }

    fn release(&self, id: FenceId) {
        self.shard(id).lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

/// Registry of geofences per entity.
#[derive(Debug)]
pub struct FenceRegistry {
    fences: KeyedSlots<EntityId, Geofence>,
    ids: FenceIdIndex,
}

impl Default for FenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fences: KeyedSlots::default(),
            ids: FenceIdIndex::new(),
        }
    }

    /// Appends `fence` to the entity's ordered set.
    ///
    /// # Errors
    /// Validation errors for a malformed fence (non-positive radius, fewer than
    /// three distinct polygon vertices, oversized name), or `DuplicateFenceId`
    /// if a fence with the same id exists anywhere in the registry. Nothing is
    /// changed in either case.
    pub fn add_fence(&self, entity_id: EntityId, fence: Geofence) -> GeowatchResult<()> {
        fence.validate()?;
        let id = fence.id;
        if !self.ids.reserve(id) {
            return Err(RegistryError::DuplicateFenceId { id }.into());
        }
        debug!(entity = %entity_id, fence = %id, kind = %fence.kind(), "fence added");
        self.fences.update(&entity_id, |set| set.push(fence));
        Ok(())
    }

    /// Stamps `template` onto every entity with a freshly generated id.
    ///
    /// Entities are processed independently: a failure for one is recorded in
    /// the report and does not stop the others.
    pub fn bulk_add_fence(&self, entity_ids: &[EntityId], template: &FenceTemplate) -> BulkAddReport {
        self.bulk_add_fence_with(entity_ids, template, |_| FenceId::new())
    }

    /// [`FenceRegistry::bulk_add_fence`] with a caller-supplied id source.
    pub fn bulk_add_fence_with(
        &self,
        entity_ids: &[EntityId],
        template: &FenceTemplate,
        mut id_source: impl FnMut(EntityId) -> FenceId,
    ) -> BulkAddReport {
        let mut report = BulkAddReport::default();
        for &entity_id in entity_ids {
            let result = template
                .instantiate(id_source(entity_id))
                .map_err(GeowatchError::from)
                .and_then(|fence| {
                    let id = fence.id;
                    self.add_fence(entity_id, fence)?;
                    Ok(id)
                });
            match result {
                Ok(id) => report.added.push((entity_id, id)),
                Err(err) => report.failed.push((entity_id, err)),
            }
        }
        info!(
            added = report.added.len(),
            failed = report.failed.len(),
            "bulk fence add finished"
        );
        report
    }

    /// Removes a fence from an entity. Returns false (not an error) when the
    /// entity has no such fence.
    pub fn remove_fence(&self, entity_id: EntityId, fence_id: FenceId) -> bool {
        let removed = self.fences.update_existing(&entity_id, |set| {
            let before = set.len();
            set.retain(|f| f.id != fence_id);
            set.len() != before
        });
        if removed {
            self.ids.release(fence_id);
            debug!(entity = %entity_id, fence = %fence_id, "fence removed");
        }
        removed
    }

    /// Removes every fence of an entity, returning how many were removed.
    pub fn clear_entity(&self, entity_id: EntityId) -> usize {
        let mut taken = Vec::new();
        self.fences.update_existing(&entity_id, |set| {
            taken = std::mem::take(set);
            !taken.is_empty()
        });
        for fence in &taken {
            self.ids.release(fence.id);
        }
        taken.len()
    }

    /// The entity's fences in insertion order. Empty for unknown entities.
    #[must_use]
    pub fn fences_for(&self, entity_id: EntityId) -> FenceSet {
        self.fences.snapshot(&entity_id)
    }

    /// Total number of fences across all entities.
    #[must_use]
    pub fn fence_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of entities that currently have at least one fence.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.fences.key_count()
    }
}
