//! Per-key copy-on-write collections.
//!
//! Both the fence registry and the alert broadcaster keep a list per key
//! (entity or channel) that is read far more often than it is written. Each
//! key owns its own lock; the outer map lock is only taken for writing when a
//! key is seen for the first time. Readers clone an `Arc` snapshot and iterate
//! without holding any lock, so a writer can never be observed half way.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// An immutable, cheaply clonable view of one key's list.
pub type Snapshot<T> = Arc<Vec<T>>;

#[derive(Debug)]
struct Slot<T> {
    items: RwLock<Snapshot<T>>,
    /// Set, under the `items` write lock, once the slot is unlinked from the
    /// map. Writers that still hold it must look the key up again.
    retired: AtomicBool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(Arc::new(Vec::new())),
            retired: AtomicBool::new(false),
        }
    }
}

/// Map from key to an ordered list, synchronized per key.
///
/// Lock poisoning is recovered rather than propagated: every mutation is
/// prepared on a private copy and published with a single pointer store, so a
/// panicking writer leaves the previous complete snapshot in place.
#[derive(Debug)]
pub(crate) struct KeyedSlots<K, T> {
    slots: RwLock<HashMap<K, Arc<Slot<T>>>>,
}

impl<K, T> Default for KeyedSlots<K, T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, T> KeyedSlots<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn slot(&self, key: &K) -> Option<Arc<Slot<T>>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()
    }

    fn slot_or_insert(&self, key: &K) -> Arc<Slot<T>> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Current list for `key`; empty when the key was never written.
    pub(crate) fn snapshot(&self, key: &K) -> Snapshot<T> {
        match self.slot(key) {
            Some(slot) => {
                let items = slot.items.read().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(&items)
            }
            None => Arc::new(Vec::new()),
        }
    }

    /// Applies `f` to a private copy of the list and publishes it.
    ///
    /// Writers to the same key are serialized; writers to different keys do
    /// not contend. The new snapshot is published even if `f` leaves the list
    /// unchanged, so callers should use [`KeyedSlots::update_existing`] for
    /// operations that are usually no-ops or that may empty the list.
    pub(crate) fn update<R>(&self, key: &K, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        loop {
            let slot = self.slot_or_insert(key);
            let mut items = slot.items.write().unwrap_or_else(PoisonError::into_inner);
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }
            let mut next = Vec::clone(&items);
            let out = f(&mut next);
            *items = Arc::new(next);
            return out;
        }
    }

    /// Like [`KeyedSlots::update`] but never creates the key, and publishes
    /// only when `f` reports a change. Drops the key if the list ends up
    /// empty.
    pub(crate) fn update_existing(&self, key: &K, f: impl FnOnce(&mut Vec<T>) -> bool) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let emptied = {
            let mut items = slot.items.write().unwrap_or_else(PoisonError::into_inner);
            if slot.retired.load(Ordering::Acquire) {
                return false;
            }
            let mut next = Vec::clone(&items);
            if !f(&mut next) {
                return false;
            }
            let emptied = next.is_empty();
            *items = Arc::new(next);
            emptied
        };
        if emptied {
            self.retire_if_empty(key, &slot);
        }
        true
    }

    fn retire_if_empty(&self, key: &K, slot: &Arc<Slot<T>>) {
        // Lock order is map then slot; no other path holds a slot lock while
        // taking the map lock.
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if !slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            return;
        }
        let items = slot.items.write().unwrap_or_else(PoisonError::into_inner);
        if items.is_empty() {
            slot.retired.store(true, Ordering::Release);
            slots.remove(key);
        }
    }

    /// Number of keys with a non-empty list (or a write in progress).
    pub(crate) fn key_count(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sum of list lengths across keys.
    pub(crate) fn total_len(&self) -> usize {
        let slots: Vec<Arc<Slot<T>>> = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.values().cloned().collect()
        };
        slots
            .iter()
            .map(|slot| slot.items.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

/// Stable shard index for `bytes` in `0..shards`.
///
/// Uses blake3 so placement does not depend on the process' random hasher
/// seed.
pub(crate) fn stable_shard(bytes: &[u8], shards: usize) -> usize {
    let shards = shards.max(1);
    let hash = blake3::hash(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    // Truncation is fine: the result is reduced modulo `shards`.
    #[allow(clippy::cast_possible_truncation)]
    let idx = (u64::from_le_bytes(prefix) % shards as u64) as usize;
    idx
}
