//! Cascade delete.
//!
//! Deleting an entity first collects its cascade closure: every entity
//! reachable through relationships flagged `cascade_delete`, loading lazy
//! collections and references on the way. Only then is each entity in the
//! closure marked `Deleted`. A failed load therefore deletes nothing.

use crate::SessionInner;
use crate::record::EntityState;
use crate::resolver::resolve_reference;
use entitrack_core::{AnyEntityRef, EntityKey, RelationshipKind, Result};
use std::collections::HashSet;
use std::rc::Rc;

impl SessionInner {
    /// Mark `root` and its cascade closure as deleted.
    pub(crate) fn delete_entity(&self, root: &AnyEntityRef) -> Result<()> {
        self.ensure_open()?;
        let state = self.owned_state(root.as_ref(), "delete")?;
        if state == EntityState::Deleted {
            return Ok(());
        }
        let closure = self.cascade_closure(root)?;
        for entity in &closure {
            self.mark_deleted(entity)?;
        }
        tracing::debug!(
            session = %self.id,
            root = %root.key(),
            deleted = closure.len(),
            "Delete cascaded"
        );
        Ok(())
    }

    /// `root` followed by every entity its cascade relationships reach.
    pub(crate) fn cascade_closure(&self, root: &AnyEntityRef) -> Result<Vec<AnyEntityRef>> {
        let mut visited = HashSet::new();
        let mut closure = Vec::new();
        self.walk(root, true, &mut visited, &mut closure)?;
        Ok(closure)
    }

    fn walk(
        &self,
        entity: &AnyEntityRef,
        is_root: bool,
        visited: &mut HashSet<EntityKey>,
        closure: &mut Vec<AnyEntityRef>,
    ) -> Result<()> {
        let key = entity.key();
        if !visited.insert(key) {
            return Ok(());
        }
        if !is_root
            && (!self.owns(entity.as_ref()) || self.state(key) == Some(EntityState::Deleted))
        {
            return Ok(());
        }
        closure.push(Rc::clone(entity));

        let table = entity.table_name();
        for rel in self.schema().relationships(table) {
            if !rel.cascade_delete {
                continue;
            }
            match rel.kind {
                RelationshipKind::Collection => {
                    self.load_collection(entity, rel)?;
                    for member in entity.members(rel.property)? {
                        self.walk(&member, false, visited, closure)?;
                    }
                }
                RelationshipKind::Reference => {
                    if let Some(target) = resolve_reference(entity, rel.property)? {
                        self.walk(&target, false, visited, closure)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `Deleted`, pinned, with every outgoing foreign key nulled.
    fn mark_deleted(&self, entity: &AnyEntityRef) -> Result<()> {
        let key = entity.key();
        if let Some(record) = self.map.borrow_mut().get_mut(key) {
            record.transition(EntityState::Deleted);
        }
        for rel in self.schema().relationships(entity.table_name()) {
            if rel.kind != RelationshipKind::Reference {
                continue;
            }
            let Some(target_key) = entity.reference_key(rel.property)? else {
                continue;
            };
            if let Some(collection) = rel.inverse {
                let owner = match entity.reference_cached(rel.property)? {
                    Some((_, owner)) => Some(owner),
                    None => self.live(target_key),
                };
                if let Some(owner) = owner {
                    if owner.remove_member(collection, key)?.is_some() {
                        self.notify(target_key, collection);
                    }
                }
            }
            entity.assign_reference(rel.property, None)?;
            self.notify(key, rel.property);
        }
        tracing::trace!(session = %self.id, key = %key, table = entity.table_name(), "Marked deleted");
        Ok(())
    }
}
