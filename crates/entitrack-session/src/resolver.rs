//! Lazy relationship resolution.
//!
//! References resolve through the stored foreign key and a weak cache;
//! collections are loaded with one query the first time they are read.
//! Relationship writes keep the other side consistent in memory: setting a
//! reference moves the entity between the materialized inverse collections,
//! and collection edits rewrite the elements' foreign keys.
//!
//! Entities reach this through [`TrackedExt`], implemented for every
//! [`EntityRef`].

use crate::attach::AttachPlan;
use crate::record::EntityState;
use crate::{Session, SessionInner, session_of, typed, wrong_table};
use entitrack_core::{
    AnyEntity, AnyEntityRef, CollectionBinding, CollectionEdit, Entity, EntityRef, Error,
    RelationshipDescriptor, RelationshipKind, Result, SchemaErrorKind, StaleReferenceError, erase,
};
use entitrack_query::Select;
use std::rc::Rc;

/// Relationship access on tracked entities.
pub trait TrackedExt<T: Entity> {
    /// The session tracking this entity.
    fn owning_session(&self) -> Option<Session>;

    /// Lifecycle state; `Detached` when no session tracks the entity.
    fn entity_state(&self) -> EntityState;

    /// Resolve a single-valued relationship, loading it if needed.
    fn reference<R: Entity>(&self, nav: &str) -> Result<Option<EntityRef<R>>>;

    /// Point a single-valued relationship at `target`.
    fn set_reference<R: Entity>(&self, nav: &str, target: Option<&EntityRef<R>>) -> Result<()>;

    /// The members of a collection, loading it on first access.
    fn collection<C: Entity>(&self, nav: &str) -> Result<Vec<EntityRef<C>>>;

    /// Bind a collection without loading it. Idempotent.
    fn initialize_collection(&self, nav: &str) -> Result<CollectionBinding>;

    /// Apply a structural edit to a collection.
    fn edit<C: Entity>(&self, nav: &str, edit: CollectionEdit<C>) -> Result<()>;

    fn add_to<C: Entity>(&self, nav: &str, item: &EntityRef<C>) -> Result<()> {
        self.edit(nav, CollectionEdit::Add(Rc::clone(item)))
    }

    fn remove_from<C: Entity>(&self, nav: &str, item: &EntityRef<C>) -> Result<()> {
        self.edit(nav, CollectionEdit::Remove(Rc::clone(item)))
    }

    fn move_within<C: Entity>(&self, nav: &str, from: usize, to: usize) -> Result<()> {
        self.edit::<C>(nav, CollectionEdit::Move { from, to })
    }
}

impl<T: Entity> TrackedExt<T> for EntityRef<T> {
    fn owning_session(&self) -> Option<Session> {
        Session::of(&**self)
    }

    fn entity_state(&self) -> EntityState {
        let key = self.borrow().key();
        session_of(&**self)
            .and_then(|s| s.state(key))
            .unwrap_or(EntityState::Detached)
    }

    fn reference<R: Entity>(&self, nav: &str) -> Result<Option<EntityRef<R>>> {
        resolve_reference(&erase(self), nav)?
            .map(typed::<R>)
            .transpose()
    }

    fn set_reference<R: Entity>(&self, nav: &str, target: Option<&EntityRef<R>>) -> Result<()> {
        let owner = erase(self);
        let target = target.map(erase);
        match session_of(&**self) {
            Some(session) => session.set_reference(&owner, nav, target.as_ref()),
            None => owner.assign_reference(nav, target.as_ref()),
        }
    }

    fn collection<C: Entity>(&self, nav: &str) -> Result<Vec<EntityRef<C>>> {
        let owner = erase(self);
        let session = session_of(&**self).ok_or_else(|| detached::<T>(nav))?;
        let rel = session.collection_relationship(T::TABLE_NAME, nav)?;
        session.load_collection(&owner, &rel)?;
        owner
            .members(rel.property)?
            .into_iter()
            .map(typed::<C>)
            .collect()
    }

    fn initialize_collection(&self, nav: &str) -> Result<CollectionBinding> {
        let owner = erase(self);
        let session = session_of(&**self).ok_or_else(|| detached::<T>(nav))?;
        session.ensure_open()?;
        let rel = session.collection_relationship(T::TABLE_NAME, nav)?;
        bind(&owner, &rel)
    }

    fn edit<C: Entity>(&self, nav: &str, edit: CollectionEdit<C>) -> Result<()> {
        let owner = erase(self);
        let edit = match edit {
            CollectionEdit::Add(item) => Edit::Add(erase(&item)),
            CollectionEdit::Remove(item) => Edit::Remove(erase(&item)),
            CollectionEdit::Move { from, to } => Edit::Move { from, to },
            other => {
                return Err(Error::UnsupportedEdit {
                    collection: format!("{}.{}", T::TABLE_NAME, nav),
                    edit: other.name(),
                });
            }
        };
        match session_of(&**self) {
            Some(session) => {
                let rel = session.collection_relationship(T::TABLE_NAME, nav)?;
                session.edit_collection(&owner, &rel, edit)
            }
            None => edit_detached::<T, C>(&owner, nav, edit),
        }
    }
}

/// A structural edit with the element type erased.
enum Edit {
    Add(AnyEntityRef),
    Remove(AnyEntityRef),
    Move { from: usize, to: usize },
}

fn detached<T: Entity>(nav: &str) -> Error {
    Error::Detached {
        table: T::TABLE_NAME,
        relationship: nav.to_string(),
    }
}

fn bind(owner: &AnyEntityRef, rel: &RelationshipDescriptor) -> Result<CollectionBinding> {
    if let Some(binding) = owner.binding(rel.property)? {
        return Ok(binding);
    }
    let binding = CollectionBinding::new(rel.property);
    owner.set_binding(rel.property, Some(binding))?;
    Ok(binding)
}

/// Resolve a reference: the consistent cache, a lookup, or nothing.
pub(crate) fn resolve_reference(owner: &AnyEntityRef, nav: &str) -> Result<Option<AnyEntityRef>> {
    let stored = owner.reference_key(nav)?;
    if let Some((cached, target)) = owner.reference_cached(nav)? {
        if stored == Some(cached) {
            return Ok(Some(target));
        }
        return Err(Error::StaleReference(StaleReferenceError {
            table: owner.table_name(),
            relationship: nav.to_string(),
            stored,
            cached,
        }));
    }
    let Some(key) = stored else {
        return Ok(None);
    };
    let session = session_of(owner.as_ref()).ok_or_else(|| Error::Detached {
        table: owner.table_name(),
        relationship: nav.to_string(),
    })?;
    let rel = session.schema().relationship(owner.table_name(), nav)?;
    let target = session.find_any(rel.related_table, key)?;
    if let Some(target) = &target {
        owner.cache_reference(nav, target)?;
    }
    Ok(target)
}

/// Edits on a graph that no session tracks yet: plain data changes.
fn edit_detached<T: Entity, C: Entity>(owner: &AnyEntityRef, nav: &str, edit: Edit) -> Result<()> {
    let table = T::table();
    let inverse = table
        .column(nav)
        .and_then(|c| c.inverse)
        .filter(|inv| inv.element_table == C::TABLE_NAME)
        .ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::ColumnNotFound,
                format!("{} has no collection '{}' of {}", T::TABLE_NAME, nav, C::TABLE_NAME),
            )
        })?;
    match edit {
        Edit::Add(item) => {
            item.assign_reference(inverse.inverse_property, Some(owner))?;
            owner.push_member(nav, &item)?;
        }
        Edit::Remove(item) => {
            let key = item.key();
            owner.remove_member(nav, key)?;
            let optional = C::table()
                .column(inverse.inverse_property)
                .and_then(|r| r.foreign_key)
                .and_then(|fk| C::table().column(fk).map(|c| c.nullable))
                .unwrap_or(false);
            if optional && item.reference_key(inverse.inverse_property)? == Some(owner.key()) {
                item.assign_reference(inverse.inverse_property, None)?;
            }
        }
        Edit::Move { from, to } => owner.move_member(nav, from, to)?,
    }
    Ok(())
}

impl SessionInner {
    pub(crate) fn collection_relationship(
        &self,
        table: &str,
        nav: &str,
    ) -> Result<RelationshipDescriptor> {
        let rel = self.schema().relationship(table, nav)?;
        if rel.kind != RelationshipKind::Collection || rel.inverse.is_none() {
            return Err(Error::schema(
                SchemaErrorKind::ColumnNotFound,
                format!("{}.{} is not a collection", table, nav),
            ));
        }
        Ok(rel.clone())
    }

    /// Fail unless `entity` is ours and not deleted.
    fn ensure_editable(&self, entity: &dyn AnyEntity, operation: &'static str) -> Result<()> {
        let state = self.owned_state(entity, operation)?;
        if state == EntityState::Deleted {
            return Err(Error::InvalidState {
                key: entity.key(),
                state: state.as_str(),
                operation,
            });
        }
        Ok(())
    }

    /// Fail if `entity` is ours and deleted.
    fn ensure_not_deleted(&self, entity: &dyn AnyEntity, operation: &'static str) -> Result<()> {
        if self.owns(entity) && self.state(entity.key()) == Some(EntityState::Deleted) {
            return Err(Error::InvalidState {
                key: entity.key(),
                state: EntityState::Deleted.as_str(),
                operation,
            });
        }
        Ok(())
    }

    pub(crate) fn set_reference(
        &self,
        owner: &AnyEntityRef,
        nav: &str,
        target: Option<&AnyEntityRef>,
    ) -> Result<()> {
        self.ensure_open()?;
        let table = owner.table_name();
        let rel = self.schema().relationship(table, nav)?.clone();
        if rel.kind != RelationshipKind::Reference {
            return Err(Error::schema(
                SchemaErrorKind::ColumnNotFound,
                format!("{}.{} is not a reference", table, nav),
            ));
        }
        if let Some(target) = target {
            if target.table_name() != rel.related_table {
                return Err(wrong_table(rel.related_table, target.table_name()));
            }
        }

        let owner_key = owner.key();
        let old_key = owner.reference_key(nav)?;
        let new_key = target.map(|t| t.key());
        if old_key == new_key {
            if let Some(target) = target.filter(|t| self.owns(t.as_ref())) {
                owner.cache_reference(nav, target)?;
            }
            return Ok(());
        }

        self.ensure_editable(owner.as_ref(), "set reference")?;
        let plan = match target {
            Some(target) => {
                self.ensure_not_deleted(target.as_ref(), "reference")?;
                self.plan_attach(&[target])?
            }
            None => AttachPlan::default(),
        };

        let old_owner = match owner.reference_cached(nav)? {
            Some((_, cached)) => Some(cached),
            None => old_key.and_then(|k| self.live(k)),
        };
        self.register_mutation(owner_key)?;
        owner.assign_reference(nav, target)?;
        self.apply_attach(plan)?;
        if let Some(collection) = rel.inverse {
            if let Some(old) = old_owner {
                old.remove_member(collection, owner_key)?;
            }
            if let Some(new) = target {
                if new.binding(collection)?.is_some_and(|b| b.loaded) {
                    new.push_member(collection, owner)?;
                }
            }
        }
        self.notify(owner_key, rel.property);
        tracing::trace!(session = %self.id, key = %owner_key, relationship = rel.property, "Reference set");
        Ok(())
    }

    /// Load a collection once. Later calls return immediately.
    pub(crate) fn load_collection(
        &self,
        owner: &AnyEntityRef,
        rel: &RelationshipDescriptor,
    ) -> Result<()> {
        self.ensure_open()?;
        if bind(owner, rel)?.loaded {
            return Ok(());
        }
        let Some(inverse) = rel.inverse else {
            return Ok(());
        };
        let owner_key = owner.key();
        let entry = self.schema().entry(rel.related_table)?;
        let select = Select::projection(&entry.table, true)
            .filter_eq(rel.foreign_key_storage, owner_key);
        let (sql, params) = select.build();
        let rows = self.store.backend.borrow().query(&sql, &params)?;

        for row in &rows {
            let Some(member) = self.adopt(entry, row)? else {
                continue;
            };
            // Moved to another owner in memory.
            if member.reference_key(inverse)? != Some(owner_key) {
                continue;
            }
            owner.push_member(rel.property, &member)?;
            member.cache_reference(inverse, owner)?;
        }

        let pending = self.map.borrow().live_in_table(rel.related_table);
        for (state, member) in pending {
            if matches!(state, EntityState::Added | EntityState::Modified)
                && member.reference_key(inverse)? == Some(owner_key)
            {
                owner.push_member(rel.property, &member)?;
                member.cache_reference(inverse, owner)?;
            }
        }

        owner.set_binding(rel.property, Some(CollectionBinding::loaded(rel.property)))?;
        tracing::debug!(
            session = %self.id,
            owner = %owner_key,
            collection = rel.property,
            rows = rows.len(),
            "Collection loaded"
        );
        Ok(())
    }

    fn edit_collection(
        &self,
        owner: &AnyEntityRef,
        rel: &RelationshipDescriptor,
        edit: Edit,
    ) -> Result<()> {
        self.ensure_open()?;
        match edit {
            Edit::Add(item) => self.add_member(owner, rel, &item),
            Edit::Remove(item) => self.remove_member(owner, rel, &item),
            Edit::Move { from, to } => {
                self.owned_state(owner.as_ref(), "move")?;
                self.load_collection(owner, rel)?;
                owner.move_member(rel.property, from, to)?;
                self.notify(owner.key(), rel.property);
                Ok(())
            }
        }
    }

    fn add_member(
        &self,
        owner: &AnyEntityRef,
        rel: &RelationshipDescriptor,
        item: &AnyEntityRef,
    ) -> Result<()> {
        self.ensure_editable(owner.as_ref(), "add to collection")?;
        if item.table_name() != rel.related_table {
            return Err(wrong_table(rel.related_table, item.table_name()));
        }
        self.ensure_not_deleted(item.as_ref(), "add to collection")?;
        self.load_collection(owner, rel)?;
        let plan = self.plan_attach(&[item])?;

        let Some(inverse) = rel.inverse else {
            return Ok(());
        };
        let owner_key = owner.key();
        let item_key = item.key();
        let previous = item.reference_key(inverse)?;
        let moved = previous != Some(owner_key);
        let old_owner = previous
            .filter(|k| *k != owner_key)
            .and_then(|k| self.live(k));
        if moved && self.owns(item.as_ref()) {
            self.register_mutation(item_key)?;
        }
        item.assign_reference(inverse, Some(owner))?;
        self.apply_attach(plan)?;
        if let Some(old) = old_owner {
            old.remove_member(rel.property, item_key)?;
        }
        owner.push_member(rel.property, item)?;
        if moved {
            self.notify(item_key, inverse);
        }
        self.notify(owner_key, rel.property);
        Ok(())
    }

    fn remove_member(
        &self,
        owner: &AnyEntityRef,
        rel: &RelationshipDescriptor,
        item: &AnyEntityRef,
    ) -> Result<()> {
        self.ensure_editable(owner.as_ref(), "remove from collection")?;
        self.load_collection(owner, rel)?;
        let Some(inverse) = rel.inverse else {
            return Ok(());
        };
        let owner_key = owner.key();
        let item_key = item.key();
        let is_member = owner.contains_member(rel.property, item_key)?;
        if !is_member && item.reference_key(inverse)? != Some(owner_key) {
            return Ok(());
        }

        if rel.cascade_delete {
            if self.owns(item.as_ref()) {
                self.delete_entity(item)?;
            }
            owner.remove_member(rel.property, item_key)?;
        } else if rel.optional {
            if self.owns(item.as_ref()) {
                self.register_mutation(item_key)?;
            }
            item.assign_reference(inverse, None)?;
            owner.remove_member(rel.property, item_key)?;
            self.notify(item_key, inverse);
        } else {
            // A required key cannot be nulled; only the in-memory list changes.
            owner.remove_member(rel.property, item_key)?;
        }
        self.notify(owner_key, rel.property);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{User, UserRole, UserType, seed_user, setup};
    use entitrack_core::{EntityKey, Reference};
    use std::cell::RefCell;

    #[test]
    fn lazy_collection_loads_once() {
        let (store, mem) = setup();
        let key = seed_user(&store, "Alex", &["admin", "editor", "viewer"]);
        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();

        mem.reset_stats();
        let roles = user.collection::<UserRole>("roles").unwrap();
        assert_eq!(roles.len(), 3);
        assert_eq!(mem.stats().queries, 1);

        let again = user.collection::<UserRole>("roles").unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(mem.stats().queries, 1);
        for role in &roles {
            let back = role.reference::<User>("user").unwrap().unwrap();
            assert!(Rc::ptr_eq(&back, &user));
        }
    }

    #[test]
    fn initialize_collection_is_idempotent() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &["admin"]);
        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();

        let first = user.initialize_collection("roles").unwrap();
        let second = user.initialize_collection("roles").unwrap();
        assert_eq!(first, second);
        assert!(!first.loaded);
    }

    #[test]
    fn reference_loads_lazily_and_caches() {
        let (store, mem) = setup();
        let writer = store.open_session();
        let kind = UserType::new("staff");
        let user = User::new("Alex");
        user.borrow_mut().user_type = Reference::to(&kind);
        writer.attach_new(&user).unwrap();
        writer.commit().unwrap();
        let key = user.borrow().id;
        writer.close();

        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();
        mem.reset_stats();
        let loaded = user.reference::<UserType>("user_type").unwrap().unwrap();
        assert_eq!(loaded.borrow().type_name, "staff");
        let cached = user.reference::<UserType>("user_type").unwrap().unwrap();
        assert!(Rc::ptr_eq(&loaded, &cached));
        assert_eq!(mem.stats().finds, 1);
    }

    #[test]
    fn null_reference_is_none_and_detached_load_fails() {
        let user = User::new("Alex");
        assert!(user.reference::<UserType>("user_type").unwrap().is_none());

        user.borrow_mut().user_type = Reference::from_key(EntityKey::new());
        let err = user.reference::<UserType>("user_type").unwrap_err();
        assert!(matches!(err, Error::Detached { .. }));
        assert!(matches!(
            user.collection::<UserRole>("roles"),
            Err(Error::Detached { .. })
        ));
    }

    #[test]
    fn stale_cache_is_reported() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        let role = UserRole::new("admin");
        role.borrow_mut().user = Reference::to(&user);
        session.attach_new(&role).unwrap();

        role.borrow_mut().set_user_id(Some(EntityKey::new())).unwrap();
        let err = role.reference::<User>("user").unwrap_err();
        assert!(matches!(err, Error::StaleReference(_)));
    }

    #[test]
    fn set_reference_moves_between_loaded_collections() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let alex = User::new("Alex");
        let peter = User::new("Peter");
        let role = UserRole::new("admin");
        alex.borrow_mut().roles.push_untracked(Rc::clone(&role));
        session.attach_new(&alex).unwrap();
        session.attach_new(&peter).unwrap();
        session.commit().unwrap();

        let heard = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&heard);
        session.on_mutation(move |_, field| sink.borrow_mut().push(field.to_string()));

        role.set_reference("user", Some(&peter)).unwrap();

        assert_eq!(alex.borrow().roles.len(), 0);
        assert_eq!(peter.borrow().roles.len(), 1);
        assert_eq!(role.borrow().user.key(), Some(peter.borrow().id));
        assert_eq!(role.entity_state(), EntityState::Modified);
        assert_eq!(*heard.borrow(), vec!["user".to_string()]);

        // Same key again is a no-op.
        role.set_reference("user", Some(&peter)).unwrap();
        assert_eq!(heard.borrow().len(), 1);
    }

    #[test]
    fn set_reference_attaches_new_target() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        session.attach_new(&user).unwrap();
        session.commit().unwrap();

        let kind = UserType::new("staff");
        user.set_reference("user_type", Some(&kind)).unwrap();
        assert_eq!(kind.entity_state(), EntityState::Added);
        assert_eq!(user.entity_state(), EntityState::Modified);
    }

    #[test]
    fn add_sets_foreign_key_and_tracks() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &["admin"]);
        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();

        let role = UserRole::new("editor");
        user.add_to("roles", &role).unwrap();

        assert_eq!(role.borrow().user.key(), Some(key));
        assert_eq!(role.entity_state(), EntityState::Added);
        assert_eq!(user.collection::<UserRole>("roles").unwrap().len(), 2);
    }

    #[test]
    fn remove_from_cascade_collection_deletes() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &["admin", "editor"]);
        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();
        let roles = user.collection::<UserRole>("roles").unwrap();

        user.remove_from("roles", &roles[0]).unwrap();
        assert_eq!(roles[0].entity_state(), EntityState::Deleted);
        assert_eq!(user.borrow().roles.len(), 1);
    }

    #[test]
    fn move_reorders_only() {
        let (store, _mem) = setup();
        let key = seed_user(&store, "Alex", &["admin", "editor"]);
        let session = store.open_session();
        let user = session.find::<User>(key).unwrap().unwrap();
        let before = user.collection::<UserRole>("roles").unwrap();

        user.move_within::<UserRole>("roles", 0, 1).unwrap();
        let after = user.collection::<UserRole>("roles").unwrap();
        assert!(Rc::ptr_eq(&before[0], &after[1]));
        assert_eq!(user.entity_state(), EntityState::Unchanged);
        assert!(session.changes().is_empty());
    }

    #[test]
    fn structural_edits_other_than_add_remove_move_fail() {
        let (store, _mem) = setup();
        let session = store.open_session();
        let user = User::new("Alex");
        session.attach_new(&user).unwrap();

        let err = user.edit::<UserRole>("roles", CollectionEdit::Clear).unwrap_err();
        match err {
            Error::UnsupportedEdit { collection, edit } => {
                assert_eq!(collection, "users.roles");
                assert_eq!(edit, "clear");
            }
            other => panic!("unexpected error: {other}"),
        }
        let replace = CollectionEdit::Replace {
            index: 0,
            item: UserRole::new("x"),
        };
        assert!(matches!(
            user.edit("roles", replace),
            Err(Error::UnsupportedEdit { .. })
        ));
    }

    #[test]
    fn detached_edits_are_plain_data_changes() {
        let user = User::new("Alex");
        let role = UserRole::new("admin");
        user.add_to("roles", &role).unwrap();
        assert_eq!(role.borrow().user.key(), Some(user.borrow().id));
        assert_eq!(user.borrow().roles.len(), 1);

        user.remove_from("roles", &role).unwrap();
        assert_eq!(role.borrow().user.key(), None);
        assert!(user.borrow().roles.is_empty());
        assert_eq!(role.entity_state(), EntityState::Detached);
    }
}
