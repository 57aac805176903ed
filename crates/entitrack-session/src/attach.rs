//! Attaching entity graphs and adopting storage rows.
//!
//! Attaching is split in two phases. [`SessionInner::plan_attach`] walks the
//! graph depth-first and checks every entity without changing anything;
//! [`SessionInner::apply_attach`] then tracks the new entities and fixes up
//! foreign keys. An ownership or identity conflict anywhere in the graph
//! therefore leaves the session untouched.

use crate::record::EntityState;
use crate::{SessionInner, wrong_table};
use entitrack_core::{
    AnyEntity, AnyEntityRef, CollectionBinding, EntityKey, Error, RelationshipKind, Result, Row,
    StaleReferenceError, TableEntry,
};
use std::collections::HashMap;
use std::rc::Rc;

/// A collection member whose back reference must point at its owner.
pub(crate) struct BackLink {
    pub(crate) owner: AnyEntityRef,
    /// Collection navigation on the owner
    pub(crate) collection: &'static str,
    pub(crate) element: AnyEntityRef,
    /// Reference navigation on the element
    pub(crate) inverse: &'static str,
}

/// Everything a successful attach will change.
#[derive(Default)]
pub(crate) struct AttachPlan {
    /// Untracked entities, parents before dependents.
    pub(crate) entities: Vec<AnyEntityRef>,
    pub(crate) back_links: Vec<BackLink>,
}

impl AttachPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.back_links.is_empty()
    }
}

struct Planner<'a> {
    session: &'a SessionInner,
    seen: HashMap<EntityKey, AnyEntityRef>,
    plan: AttachPlan,
}

impl Planner<'_> {
    fn visit(&mut self, entity: &AnyEntityRef) -> Result<()> {
        let key = entity.key();
        if let Some(seen) = self.seen.get(&key) {
            if Rc::ptr_eq(seen, entity) {
                return Ok(());
            }
            return Err(Error::DuplicateIdentity { key });
        }
        if let Some(owner) = entity.session() {
            if owner.session_id() != self.session.id {
                return Err(self.session.ownership_error(entity.as_ref(), owner.session_id()));
            }
            // Already ours: the recursion stops here.
            return Ok(());
        }
        if let Some(live) = self.session.live(key) {
            if !Rc::ptr_eq(&live, entity) {
                return Err(Error::DuplicateIdentity { key });
            }
        }
        self.seen.insert(key, Rc::clone(entity));

        let table = entity.table_name();
        let schema = self.session.schema();
        for rel in schema.relationships(table) {
            if rel.kind != RelationshipKind::Reference {
                continue;
            }
            if let Some((cached_key, target)) = entity.reference_cached(rel.property)? {
                let stored = entity.reference_key(rel.property)?;
                if stored != Some(cached_key) {
                    return Err(Error::StaleReference(StaleReferenceError {
                        table,
                        relationship: rel.property.to_string(),
                        stored,
                        cached: cached_key,
                    }));
                }
                self.visit(&target)?;
            }
        }

        self.plan.entities.push(Rc::clone(entity));

        for rel in schema.relationships(table) {
            let (RelationshipKind::Collection, Some(inverse)) = (rel.kind, rel.inverse) else {
                continue;
            };
            // Members of non-cascade collections are attached on their own.
            if !rel.cascade_delete {
                continue;
            }
            for member in entity.members(rel.property)? {
                if self.session.owns(member.as_ref())
                    && self.session.state(member.key()) == Some(EntityState::Deleted)
                {
                    return Err(Error::InvalidState {
                        key: member.key(),
                        state: EntityState::Deleted.as_str(),
                        operation: "attach",
                    });
                }
                self.plan.back_links.push(BackLink {
                    owner: Rc::clone(entity),
                    collection: rel.property,
                    element: Rc::clone(&member),
                    inverse,
                });
                self.visit(&member)?;
            }
        }
        Ok(())
    }
}

impl SessionInner {
    /// Check a graph for attachment. Changes nothing.
    pub(crate) fn plan_attach(&self, roots: &[&AnyEntityRef]) -> Result<AttachPlan> {
        self.ensure_open()?;
        let mut planner = Planner {
            session: self,
            seen: HashMap::new(),
            plan: AttachPlan::default(),
        };
        for root in roots {
            self.schema().entry(root.table_name())?;
            planner.visit(root)?;
        }
        Ok(planner.plan)
    }

    pub(crate) fn apply_attach(&self, plan: AttachPlan) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        for entity in &plan.entities {
            self.map.borrow_mut().insert(entity, EntityState::Added);
            entity.bind_session(self.link());
            // Nothing can be stored for a new owner yet.
            for rel in self.schema().relationships(entity.table_name()) {
                if rel.kind == RelationshipKind::Collection {
                    entity.set_binding(rel.property, Some(CollectionBinding::loaded(rel.property)))?;
                }
            }
        }

        for link in &plan.back_links {
            let owner_key = link.owner.key();
            let element_key = link.element.key();
            let previous = link.element.reference_key(link.inverse)?;
            if previous != Some(owner_key) {
                self.register_mutation(element_key)?;
                if let Some(old) = previous.and_then(|k| self.live(k)) {
                    old.remove_member(link.collection, element_key)?;
                }
            }
            link.element
                .assign_reference(link.inverse, Some(&link.owner))?;
            if previous != Some(owner_key) {
                self.notify(element_key, link.inverse);
            }
        }

        for entity in &plan.entities {
            self.link_into_owners(entity)?;
        }
        tracing::debug!(
            session = %self.id,
            attached = plan.entities.len(),
            back_links = plan.back_links.len(),
            "Attached entity graph"
        );
        Ok(())
    }

    /// Track `root` and every untracked entity it reaches.
    pub(crate) fn attach_new(&self, root: &AnyEntityRef) -> Result<()> {
        let plan = self.plan_attach(&[root])?;
        self.apply_attach(plan)
    }

    /// Append `entity` to the loaded inverse collections of the owners it
    /// references.
    pub(crate) fn link_into_owners(&self, entity: &AnyEntityRef) -> Result<()> {
        for rel in self.schema().relationships(entity.table_name()) {
            let (RelationshipKind::Reference, Some(collection)) = (rel.kind, rel.inverse) else {
                continue;
            };
            let Some(owner) = entity
                .reference_key(rel.property)?
                .and_then(|k| self.live(k))
            else {
                continue;
            };
            if owner.binding(collection)?.is_some_and(|b| b.loaded)
                && owner.push_member(collection, entity)?
            {
                entity.cache_reference(rel.property, &owner)?;
            }
        }
        Ok(())
    }

    /// Track an instance for a storage row, reusing the identity map.
    ///
    /// Returns `None` when the key is tracked as `Deleted`.
    pub(crate) fn adopt(&self, entry: &TableEntry, row: &Row) -> Result<Option<AnyEntityRef>> {
        let key = row_key(entry, row)?;
        {
            let map = self.map.borrow();
            if let Some(record) = map.get(key) {
                if record.table != entry.table.name() {
                    return Err(wrong_table(entry.table.name(), record.table));
                }
                if record.state == EntityState::Deleted {
                    return Ok(None);
                }
                if let Some(live) = record.entity() {
                    return Ok(Some(live));
                }
            }
        }
        // A partial projection would write defaults back on the next commit.
        let complete = entry
            .table
            .storage_columns()
            .all(|c| row.contains_column(c.storage_name));
        let entity = if complete {
            entry.materialize(row)?
        } else {
            let full = self
                .store
                .backend
                .borrow()
                .find_by_key(&entry.table, key)?;
            entry.materialize(full.as_ref().unwrap_or(row))?
        };
        entity.bind_session(self.link());
        self.map.borrow_mut().insert(&entity, EntityState::Unchanged);
        Ok(Some(entity))
    }

    /// Reload every stored column of a tracked entity.
    pub(crate) fn refresh(&self, entity: &AnyEntityRef) -> Result<()> {
        self.ensure_open()?;
        let key = entity.key();
        let state = self.owned_state(entity.as_ref(), "refresh")?;
        if matches!(state, EntityState::Added | EntityState::Deleted) {
            return Err(Error::InvalidState {
                key,
                state: state.as_str(),
                operation: "refresh",
            });
        }
        let entry = self.schema().entry(entity.table_name())?;
        let row = self
            .store
            .backend
            .borrow()
            .find_by_key(&entry.table, key)?
            .ok_or(Error::UnknownEntity {
                key,
                operation: "refresh",
            })?;

        let references: Vec<_> = entry
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::Reference)
            .collect();
        for column in entry.table.storage_columns() {
            let Some(value) = row.get_by_name(column.storage_name) else {
                continue;
            };
            if entity.column(column.name).as_ref() == Some(value) {
                continue;
            }
            entity.set_column(column.name, value)?;
            for rel in references.iter().filter(|r| r.foreign_key == column.name) {
                entity.forget_reference(rel.property)?;
            }
        }
        if let Some(record) = self.map.borrow_mut().get_mut(key) {
            record.transition(EntityState::Unchanged);
        }
        tracing::debug!(session = %self.id, key = %key, "Refreshed from storage");
        Ok(())
    }
}

/// The primary key stored in `row`.
pub(crate) fn row_key(entry: &TableEntry, row: &Row) -> Result<EntityKey> {
    let column = entry.table.key_column();
    let storage = entry.table.storage_name_of(column).unwrap_or(column);
    let value = row
        .get_by_name(storage)
        .ok_or_else(|| Error::column_type(storage, "UUID", "missing"))?;
    value
        .as_key()
        .ok_or_else(|| Error::column_type(storage, "UUID", value.type_name()))
}

/// Keys of `entity`'s stored columns that differ from `row`.
pub(crate) fn changed_columns(
    entry: &TableEntry,
    entity: &dyn AnyEntity,
    row: &Row,
) -> Vec<&'static str> {
    entry
        .table
        .storage_columns()
        .filter(|c| {
            row.get_by_name(c.storage_name)
                .is_some_and(|v| entity.column(c.name).as_ref() != Some(v))
        })
        .map(|c| c.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::record::EntityState;
    use crate::test_support::{User, UserRole, UserType, seed_user, setup};
    use entitrack_core::{Entity, Error, Reference};
    use std::rc::Rc;

    #[test]
    fn attach_walks_references_and_collections() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let kind = UserType::new("staff");
        let user = User::new("Alex");
        let roles = [UserRole::new("admin"), UserRole::new("editor")];
        user.borrow_mut().user_type = Reference::to(&kind);
        for role in &roles {
            user.borrow_mut().roles.push_untracked(Rc::clone(role));
        }

        session.attach_new(&user).unwrap();

        assert_eq!(session.tracked_count(), 4);
        let user_key = user.borrow().key();
        for role in &roles {
            assert_eq!(role.borrow().user.key(), Some(user_key));
            assert_eq!(
                session.state_of(role.borrow().key()),
                Some(EntityState::Added)
            );
        }
        // Parents are saved before their dependents.
        let order: Vec<_> = session.changes().iter().map(|c| c.table).collect();
        assert_eq!(order, vec!["user_types", "users", "user_roles", "user_roles"]);
        assert!(user.borrow().roles.is_loaded());
    }

    #[test]
    fn cycles_terminate() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        let role = UserRole::new("admin");
        role.borrow_mut().user = Reference::to(&user);
        user.borrow_mut().roles.push_untracked(Rc::clone(&role));

        session.attach_new(&role).unwrap();
        assert_eq!(session.tracked_count(), 2);
    }

    #[test]
    fn duplicate_instance_is_rejected_without_changes() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        session.attach_new(&user).unwrap();

        let twin = User::new("Alex");
        twin.borrow_mut().id = user.borrow().id;
        let err = session.attach_new(&twin).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity { .. }));
        assert!(!twin.borrow().link().is_attached());
        assert_eq!(session.tracked_count(), 1);
    }

    #[test]
    fn failed_graph_attach_tracks_nothing() {
        let (store, _mem) = setup();
        let first = store.open_session();
        let second = store.open_session();
        let foreign_role = UserRole::new("admin");
        first.attach_new(&foreign_role).unwrap();

        let user = User::new("Alex");
        let own_role = UserRole::new("editor");
        user.borrow_mut().roles.push_untracked(Rc::clone(&own_role));
        user.borrow_mut().roles.push_untracked(Rc::clone(&foreign_role));

        let err = second.attach_new(&user).unwrap_err();
        assert!(matches!(err, Error::Ownership(_)));
        assert_eq!(second.tracked_count(), 0);
        assert_eq!(own_role.borrow().user.key(), None);
    }

    #[test]
    fn stale_cache_blocks_attach() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        let role = UserRole::new("admin");
        role.borrow_mut().user = Reference::to(&user);
        role.borrow_mut().set_user_id(None).unwrap();

        let err = session.attach_new(&role).unwrap_err();
        assert!(matches!(err, Error::StaleReference(_)));
    }

    #[test]
    fn adopted_rows_reuse_live_instances() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &[]);
        let session = store.open_session();

        let first = session.find::<User>(key).unwrap().unwrap();
        let all = session.all::<User>().unwrap();
        assert_eq!(all.len(), 1);
        assert!(Rc::ptr_eq(&first, &all[0]));
        assert_eq!(session.state_of(key), Some(EntityState::Unchanged));
    }

    #[test]
    fn refresh_reloads_out_of_band_writes() {
        let (store, mem) = setup();
        let key = seed_user(&store, "Alex", &[]);
        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();
        user.borrow_mut().set_name("Local").unwrap();

        let table = User::table();
        let mut row = mem.get_row("users", key).unwrap();
        row = entitrack_core::Row::from_pairs(row.iter().map(|(name, value)| {
            let value = if name == "statistics" {
                "busy".into()
            } else {
                value.clone()
            };
            (name.to_string(), value)
        }));
        mem.put_row(&table, row).unwrap();

        session.refresh(&user).unwrap();
        assert_eq!(user.borrow().name(), "Alex");
        assert_eq!(user.borrow().statistics.as_deref(), Some("busy"));
        assert_eq!(session.state_of(key), Some(EntityState::Unchanged));
    }

    #[test]
    fn refresh_rejects_added_entities() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        session.attach_new(&user).unwrap();
        let err = session.refresh(&user).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
