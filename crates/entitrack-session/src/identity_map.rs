//! Identity Map: at most one live instance per key within a session.
//!
//! Unchanged entities are held weakly, so the map never keeps an object the
//! application has dropped. Records whose weak handle has died are pruned
//! lazily: on lookup, or in bulk by [`IdentityMap::prune`].

use crate::record::{EntityHandle, EntityState, TrackedRecord};
use entitrack_core::{AnyEntityRef, EntityKey};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct IdentityMap {
    records: HashMap<EntityKey, TrackedRecord>,
    next_order: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: EntityKey) -> Option<&TrackedRecord> {
        self.records.get(&key)
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut TrackedRecord> {
        self.records.get_mut(&key)
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.records.contains_key(&key)
    }

    /// The live instance tracked under `key`.
    pub fn live(&self, key: EntityKey) -> Option<AnyEntityRef> {
        self.records.get(&key).and_then(TrackedRecord::entity)
    }

    pub fn state(&self, key: EntityKey) -> Option<EntityState> {
        self.records.get(&key).map(|r| r.state)
    }

    /// Track `entity` in `state`, replacing any existing record for its key.
    pub fn insert(&mut self, entity: &AnyEntityRef, state: EntityState) -> &TrackedRecord {
        let key = entity.key();
        let handle = if state.is_pending() {
            EntityHandle::Strong(Rc::clone(entity))
        } else {
            EntityHandle::Weak(Rc::downgrade(entity))
        };
        let record = TrackedRecord {
            key,
            table: entity.table_name(),
            type_id: entity.entity_type(),
            insertion_order: self.next_order,
            state,
            handle,
        };
        self.next_order += 1;
        tracing::trace!(key = %key, table = record.table, state = %state, "Tracking entity");
        self.records.insert(key, record);
        &self.records[&key]
    }

    pub fn remove(&mut self, key: EntityKey) -> Option<TrackedRecord> {
        self.records.remove(&key)
    }

    /// Drop records whose entity is gone. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.handle.is_live());
        let pruned = before - self.records.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned dead identity map records");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedRecord> {
        self.records.values()
    }

    /// Records sorted by insertion order.
    pub fn ordered(&self) -> Vec<&TrackedRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|r| r.insertion_order);
        records
    }

    /// Live instances of `table`, in insertion order.
    pub fn live_in_table(&self, table: &str) -> Vec<(EntityState, AnyEntityRef)> {
        self.ordered()
            .into_iter()
            .filter(|r| r.table == table)
            .filter_map(|r| r.entity().map(|e| (r.state, e)))
            .collect()
    }

    /// Remove every record.
    pub fn drain(&mut self) -> Vec<TrackedRecord> {
        self.records.drain().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{UserType, erase_new};

    #[test]
    fn insert_assigns_monotonic_order() {
        let mut map = IdentityMap::new();
        let a = erase_new(UserType::named("a"));
        let b = erase_new(UserType::named("b"));

        map.insert(&b, EntityState::Added);
        map.insert(&a, EntityState::Unchanged);

        let ordered: Vec<_> = map.ordered().iter().map(|r| r.key).collect();
        assert_eq!(ordered, vec![b.key(), a.key()]);
        assert!(map.get(b.key()).unwrap().handle.is_strong());
        assert!(!map.get(a.key()).unwrap().handle.is_strong());
    }

    #[test]
    fn unchanged_records_do_not_keep_entities_alive() {
        let mut map = IdentityMap::new();
        let kept = erase_new(UserType::named("kept"));
        let key = {
            let dropped = erase_new(UserType::named("dropped"));
            map.insert(&dropped, EntityState::Unchanged);
            dropped.key()
        };
        map.insert(&kept, EntityState::Unchanged);

        assert!(map.live(key).is_none());
        assert_eq!(map.prune(), 1);
        assert!(!map.contains(key));
        assert!(map.live(kept.key()).is_some());
    }

    #[test]
    fn pending_records_pin_entities() {
        let mut map = IdentityMap::new();
        let key = {
            let added = erase_new(UserType::named("pinned"));
            map.insert(&added, EntityState::Added);
            added.key()
        };
        assert!(map.live(key).is_some());
        assert_eq!(map.prune(), 0);
    }
}
