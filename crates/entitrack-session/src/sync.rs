//! Cross-session synchronization.
//!
//! After a commit, the committed plan is replayed into every other live
//! session on the same [`Store`](crate::Store). The replay only touches what a
//! sibling already has in memory: tracked instances get the new column values,
//! and loaded collections gain or lose members. Nothing is read from storage
//! and nothing can fail the originating commit.

use crate::SessionInner;
use crate::record::EntityState;
use crate::unit_of_work::{FlushPlan, PendingOp};
use entitrack_core::{EntityKey, RelationshipKind, Result, Row, Value};
use std::rc::Rc;

/// Replay `plan` into the siblings of `source`. Best effort.
pub(crate) fn replay(source: &SessionInner, plan: &FlushPlan) {
    if plan.is_empty() {
        return;
    }
    let siblings: Vec<Rc<SessionInner>> = source
        .store
        .live_sessions()
        .into_iter()
        .filter(|s| s.id != source.id && !s.is_closed() && s.config.accept_sync)
        .collect();
    for sibling in &siblings {
        for op in &plan.ops {
            if let Err(err) = sibling.apply_remote(op) {
                tracing::warn!(
                    source = %source.id,
                    target = %sibling.id,
                    key = %op.key(),
                    table = op.table(),
                    error = %err,
                    "Synchronization skipped an operation"
                );
            }
        }
    }
    tracing::debug!(
        source = %source.id,
        siblings = siblings.len(),
        ops = plan.len(),
        "Replayed commit into sibling sessions"
    );
}

impl SessionInner {
    fn apply_remote(&self, op: &PendingOp) -> Result<()> {
        match op {
            PendingOp::Upsert {
                key,
                table,
                row,
                state: EntityState::Added,
            } => self.remote_added(*key, table, row),
            PendingOp::Upsert { key, table, row, .. } => self.remote_modified(*key, table, row),
            PendingOp::Delete { key, table } => self.remote_deleted(*key, table),
        }
    }

    /// Copy changed columns onto the tracked instance, if any.
    fn remote_modified(&self, key: EntityKey, table: &str, row: &Row) -> Result<()> {
        let Some(entity) = self.live(key) else {
            return Ok(());
        };
        if entity.table_name() != table || self.state(key) == Some(EntityState::Deleted) {
            return Ok(());
        }
        let entry = self.schema().entry(table)?;
        let changed = crate::attach::changed_columns(entry, entity.as_ref(), row);
        if changed.is_empty() {
            return Ok(());
        }

        let references: Vec<_> = entry
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::Reference)
            .collect();
        let before = references
            .iter()
            .map(|r| entity.reference_key(r.property))
            .collect::<Result<Vec<_>>>()?;

        for name in &changed {
            let storage = entry.table.storage_name_of(name).unwrap_or(*name);
            if let Some(value) = row.get_by_name(storage) {
                entity.set_column(name, value)?;
            }
        }

        for (rel, old) in references.iter().zip(before) {
            let new = entity.reference_key(rel.property)?;
            if new == old {
                continue;
            }
            entity.forget_reference(rel.property)?;
            let Some(collection) = rel.inverse else {
                continue;
            };
            if let Some(previous) = old.and_then(|k| self.live(k)) {
                if previous.remove_member(collection, key)?.is_some() {
                    self.notify(previous.key(), collection);
                }
            }
            if let Some(next) = new.and_then(|k| self.live(k)) {
                if next.binding(collection)?.is_some_and(|b| b.loaded)
                    && next.push_member(collection, &entity)?
                {
                    entity.cache_reference(rel.property, &next)?;
                    self.notify(next.key(), collection);
                }
            }
        }

        for name in changed {
            self.notify(key, name);
        }
        Ok(())
    }

    /// Insert a new row into the loaded collections of its tracked owners.
    fn remote_added(&self, key: EntityKey, table: &str, row: &Row) -> Result<()> {
        let entry = self.schema().entry(table)?;
        for rel in &entry.relationships {
            let (RelationshipKind::Reference, Some(collection)) = (rel.kind, rel.inverse) else {
                continue;
            };
            let Some(owner_key) = row.get_by_name(rel.foreign_key_storage).and_then(Value::as_key)
            else {
                continue;
            };
            let Some(owner) = self.live(owner_key) else {
                continue;
            };
            if !owner.binding(collection)?.is_some_and(|b| b.loaded)
                || owner.contains_member(collection, key)?
            {
                continue;
            }
            // Our own instance if we track the key, otherwise a fresh copy.
            let Some(instance) = self.adopt(entry, row)? else {
                continue;
            };
            if instance.reference_key(rel.property)? != Some(owner_key) {
                continue;
            }
            owner.push_member(collection, &instance)?;
            instance.cache_reference(rel.property, &owner)?;
            self.notify(owner_key, collection);
        }
        Ok(())
    }

    /// Drop a deleted row from every loaded collection that holds it.
    fn remote_deleted(&self, key: EntityKey, table: &str) -> Result<()> {
        for rel in self.schema().collections_of(table) {
            let owners = self.map.borrow().live_in_table(rel.table);
            for (_, owner) in owners {
                if owner.binding(rel.property)?.is_some_and(|b| b.loaded)
                    && owner.remove_member(rel.property, key)?.is_some()
                {
                    self.notify(owner.key(), rel.property);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::SessionConfig;
    use crate::record::EntityState;
    use crate::resolver::TrackedExt;
    use crate::test_support::{User, UserRole, seed_user, setup};
    use entitrack_core::Entity;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn added_child_appears_in_loaded_sibling_collection() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &["admin"]);
        let a = store.open_session();
        let b = store.open_session();
        let user_a = a.find::<User>(key).unwrap().unwrap();
        let user_b = b.find::<User>(key).unwrap().unwrap();
        assert_eq!(user_b.collection::<UserRole>("roles").unwrap().len(), 1);

        let role = UserRole::new("editor");
        user_a.add_to("roles", &role).unwrap();
        a.commit().unwrap();

        let roles_b = user_b.borrow().roles.to_vec();
        assert_eq!(roles_b.len(), 2);
        let copy = &roles_b[1];
        assert!(!Rc::ptr_eq(copy, &role));
        assert_eq!(copy.borrow().name, "editor");
        assert_eq!(copy.entity_state(), EntityState::Unchanged);
        assert_eq!(copy.owning_session(), Some(b.clone()));
    }

    #[test]
    fn unloaded_sibling_collections_are_left_alone() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &[]);
        let a = store.open_session();
        let b = store.open_session();
        let user_a = a.find::<User>(key).unwrap().unwrap();
        let user_b = b.find::<User>(key).unwrap().unwrap();

        user_a.add_to("roles", &UserRole::new("editor")).unwrap();
        a.commit().unwrap();

        assert!(user_b.borrow().roles.is_empty());
        assert_eq!(user_b.collection::<UserRole>("roles").unwrap().len(), 1);
    }

    #[test]
    fn modified_columns_are_copied_without_state_change() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &[]);
        let a = store.open_session();
        let b = store.open_session();
        let user_a = a.find::<User>(key).unwrap().unwrap();
        let user_b = b.find::<User>(key).unwrap().unwrap();

        let heard = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&heard);
        b.on_mutation(move |_, field| sink.borrow_mut().push(field.to_string()));

        user_a.borrow_mut().set_name("Peter").unwrap();
        a.commit().unwrap();

        assert_eq!(user_b.borrow().name(), "Peter");
        assert_eq!(b.state_of(key), Some(EntityState::Unchanged));
        assert_eq!(*heard.borrow(), vec!["name".to_string()]);
    }

    #[test]
    fn deleted_child_leaves_sibling_collection() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &["admin", "editor"]);
        let a = store.open_session();
        let b = store.open_session();
        let user_a = a.find::<User>(key).unwrap().unwrap();
        let user_b = b.find::<User>(key).unwrap().unwrap();
        let roles_a = user_a.collection::<UserRole>("roles").unwrap();
        assert_eq!(user_b.collection::<UserRole>("roles").unwrap().len(), 2);

        a.delete(&roles_a[0]).unwrap();
        a.commit().unwrap();

        let remaining = user_b.borrow().roles.to_vec();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].borrow().key(), roles_a[1].borrow().key());
    }

    #[test]
    fn opted_out_and_closed_siblings_are_skipped() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &[]);
        let a = store.open_session();
        let quiet = store.open_session_with(SessionConfig {
            accept_sync: false,
            ..SessionConfig::default()
        });
        let closed = store.open_session();
        let user_a = a.find::<User>(key).unwrap().unwrap();
        let user_quiet = quiet.find::<User>(key).unwrap().unwrap();
        let user_closed = closed.find::<User>(key).unwrap().unwrap();
        closed.close();

        user_a.borrow_mut().set_name("Peter").unwrap();
        a.commit().unwrap();

        assert_eq!(user_quiet.borrow().name(), "Alex");
        assert_eq!(user_closed.borrow().name(), "Alex");
    }

    #[test]
    fn dropped_sessions_are_pruned() {
        let (store, _mem) = setup();
        let a = store.open_session();
        {
            let _b = store.open_session();
            assert_eq!(store.session_count(), 2);
        }
        let user = User::new("Alex");
        a.attach_new(&user).unwrap();
        a.commit().unwrap();
        assert_eq!(store.session_count(), 1);
    }
}
