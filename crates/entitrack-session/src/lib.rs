//! Session and Unit of Work for entitrack.
//!
//! `entitrack-session` is the **change-tracking layer**. It keeps one live
//! instance per key, records what changed, resolves relationships lazily and
//! writes everything back in one transaction.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: at most one live instance per key per session.
//! - **Unit of work**: pending inserts, updates and deletes, flushed atomically
//!   in insertion order.
//! - **Relationships**: lazy references and collections, with inverse sides
//!   kept consistent in memory.
//! - **Cascade delete**: deletes follow cascade-flagged relationships.
//! - **Synchronization**: commits are replayed into sibling sessions on the
//!   same [`Store`].
//!
//! # Design Notes
//!
//! - **Single-threaded**: `Rc`/`RefCell` throughout; sessions are not `Send`.
//! - **Weak by default**: unchanged entities are held weakly; a pending change
//!   pins the entity until commit.
//! - **Validate, then apply**: an operation that fails leaves no state behind.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::new(MemoryStore::new(), schema);
//! let session = store.open_session();
//!
//! let user = User::new("Alex");
//! session.attach_new(&user)?;
//! session.commit()?;
//!
//! let roles = user.collection::<UserRole>("roles")?;
//! ```

pub mod attach;
pub mod cascade;
pub mod identity_map;
pub mod record;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod unit_of_work;

#[cfg(test)]
mod test_support;

pub use identity_map::IdentityMap;
pub use record::{EntityHandle, EntityState, TrackedRecord};
pub use resolver::TrackedExt;
pub use store::Store;
pub use unit_of_work::{CommitSummary, FlushPlan, PendingCounts, PendingOp};

use entitrack_core::{
    AnyEntity, AnyEntityRef, Entity, EntityKey, EntityRef, Error, OwnershipError,
    RelationshipKind, Result, Schema, SessionLink, TypeError, downcast, erase,
};
use entitrack_query::Select;
use serde::Serialize;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use store::StoreInner;
use uuid::Uuid;

// ============================================================================
// Session Events
// ============================================================================

/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` from a before-commit callback aborts the commit.
type SessionEventFn = Box<dyn FnMut() -> Result<()>>;

/// Callback invoked once per field set, relationship change or collection
/// edit, with the entity key and the field or navigation name.
type MutationSink = Rc<dyn Fn(EntityKey, &str)>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn slot(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before the flush plan is computed.
    BeforeCommit,
    /// Fired after the transaction committed and states were updated.
    AfterCommit,
    /// Fired after a failed commit was rolled back.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Replay committed changes into sibling sessions.
    pub synchronize: bool,
    /// Accept changes replayed from sibling sessions.
    pub accept_sync: bool,
    /// Drop records of entities that were released, after each commit.
    pub prune_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            synchronize: true,
            accept_sync: true,
            prune_on_commit: true,
        }
    }
}

/// A pending change, as reported by [`Session::changes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub key: EntityKey,
    pub table: &'static str,
    pub state: EntityState,
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    pub session: Uuid,
    /// Records in the identity map, dead ones included.
    pub tracked: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub closed: bool,
}

// ============================================================================
// Session
// ============================================================================

pub(crate) struct SessionInner {
    pub(crate) id: Uuid,
    self_weak: Weak<SessionInner>,
    pub(crate) store: Rc<StoreInner>,
    pub(crate) config: SessionConfig,
    pub(crate) map: RefCell<IdentityMap>,
    closed: Cell<bool>,
    events: RefCell<SessionEventCallbacks>,
    sinks: RefCell<Vec<MutationSink>>,
}

/// The owning session of an entity, if it has a live one.
pub(crate) fn session_of(entity: &dyn AnyEntity) -> Option<Rc<SessionInner>> {
    entity
        .session()?
        .into_any()
        .downcast::<SessionInner>()
        .ok()
}

pub(crate) fn wrong_table(expected: &'static str, actual: &str) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.to_string(),
        column: None,
        rust_type: None,
    })
}

fn wrong_type<T: Entity>(actual: &str) -> Error {
    Error::Type(TypeError {
        expected: T::TABLE_NAME,
        actual: actual.to_string(),
        column: None,
        rust_type: Some(std::any::type_name::<T>()),
    })
}

/// Recover a typed handle, reporting a type error on mismatch.
pub(crate) fn typed<T: Entity>(entity: AnyEntityRef) -> Result<EntityRef<T>> {
    let table = entity.table_name();
    downcast::<T>(entity).ok_or_else(|| wrong_type::<T>(table))
}

impl SessionInner {
    pub(crate) fn schema(&self) -> &Schema {
        &self.store.schema
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.get() {
            return Err(Error::SessionClosed { session: self.id });
        }
        Ok(())
    }

    /// Weak back-link handed to entities.
    pub(crate) fn link(&self) -> Weak<dyn SessionLink> {
        let link: Weak<dyn SessionLink> = self.self_weak.clone();
        link
    }

    /// Does this session own `entity`?
    pub(crate) fn owns(&self, entity: &dyn AnyEntity) -> bool {
        entity.session().is_some_and(|s| s.session_id() == self.id)
    }

    pub(crate) fn live(&self, key: EntityKey) -> Option<AnyEntityRef> {
        self.map.borrow().live(key)
    }

    pub(crate) fn state(&self, key: EntityKey) -> Option<EntityState> {
        self.map.borrow().state(key)
    }

    /// State of an entity this session must own, for `operation`.
    pub(crate) fn owned_state(
        &self,
        entity: &dyn AnyEntity,
        operation: &'static str,
    ) -> Result<EntityState> {
        let key = entity.key();
        if let Some(owner) = entity.session() {
            if owner.session_id() != self.id {
                return Err(self.ownership_error(entity, owner.session_id()));
            }
        }
        match self.map.borrow().get(key) {
            Some(record) if self.owns(entity) => Ok(record.state),
            _ => Err(Error::UnknownEntity { key, operation }),
        }
    }

    pub(crate) fn ownership_error(&self, entity: &dyn AnyEntity, owner: Uuid) -> Error {
        Error::Ownership(OwnershipError {
            key: entity.key(),
            table: entity.table_name(),
            owner,
            requested_by: self.id,
        })
    }

    /// `Unchanged → Modified`; pending states are left alone.
    pub(crate) fn register_mutation(&self, key: EntityKey) -> Result<()> {
        self.ensure_open()?;
        let mut map = self.map.borrow_mut();
        let record = map.get_mut(key).ok_or(Error::UnknownEntity {
            key,
            operation: "register mutation",
        })?;
        match record.state {
            EntityState::Unchanged => {
                if !record.handle.is_live() {
                    return Err(Error::UnknownEntity {
                        key,
                        operation: "register mutation",
                    });
                }
                record.transition(EntityState::Modified);
                Ok(())
            }
            EntityState::Added | EntityState::Modified => Ok(()),
            state @ (EntityState::Deleted | EntityState::Detached) => Err(Error::InvalidState {
                key,
                state: state.as_str(),
                operation: "modify",
            }),
        }
    }

    /// Call every mutation sink.
    pub(crate) fn notify(&self, key: EntityKey, field: &str) {
        let sinks: Vec<MutationSink> = self.sinks.borrow().clone();
        for sink in sinks {
            sink(key, field);
        }
    }

    /// Fire `event`. Callbacks registered while firing run next time.
    pub(crate) fn fire(&self, event: SessionEvent) -> Result<()> {
        let mut callbacks = std::mem::take(self.events.borrow_mut().slot(event));
        let result = callbacks.iter_mut().try_for_each(|cb| cb());
        let mut events = self.events.borrow_mut();
        let slot = events.slot(event);
        callbacks.append(slot);
        *slot = callbacks;
        result
    }

    /// Unbind `entity` and drop its collection bindings.
    ///
    /// An entity borrowed further up the stack, such as one whose setter is
    /// running a mutation sink, stays bound.
    pub(crate) fn release(&self, entity: &AnyEntityRef) {
        if entity.unbind_session() {
            self.clear_bindings(entity);
        } else {
            tracing::warn!(
                session = %self.id,
                key = %entity.key(),
                "Entity is borrowed, leaving it bound"
            );
        }
    }

    /// Drop every collection binding of `entity`.
    pub(crate) fn clear_bindings(&self, entity: &AnyEntityRef) {
        for rel in self.schema().relationships(entity.table_name()) {
            if rel.kind == RelationshipKind::Collection {
                if let Err(err) = entity.set_binding(rel.property, None) {
                    tracing::trace!(error = %err, "Could not clear collection binding");
                }
            }
        }
    }

    /// Find by key, going to storage when the map has no live instance.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub(crate) fn find_any(&self, table: &str, key: EntityKey) -> Result<Option<AnyEntityRef>> {
        self.ensure_open()?;
        let entry = self.schema().entry(table)?;
        let dead = {
            let map = self.map.borrow();
            match map.get(key) {
                Some(record) => {
                    if record.table != entry.table.name() {
                        return Err(wrong_table(entry.table.name(), record.table));
                    }
                    if record.state == EntityState::Deleted {
                        return Ok(None);
                    }
                    if let Some(entity) = record.entity() {
                        return Ok(Some(entity));
                    }
                    true
                }
                None => false,
            }
        };
        if dead {
            self.map.borrow_mut().remove(key);
        }

        let row = self
            .store
            .backend
            .borrow()
            .find_by_key(&entry.table, key)?;
        tracing::debug!(found = row.is_some(), "Loaded from storage");
        match row {
            Some(row) => self.adopt(entry, &row),
            None => Ok(None),
        }
    }

    /// Empty the map, releasing every live entity. Returns the record count.
    fn release_all(&self) -> usize {
        let records = self.map.borrow_mut().drain();
        let count = records.len();
        for record in records {
            if let Some(entity) = record.entity() {
                self.release(&entity);
            }
        }
        count
    }

    pub(crate) fn clear_changes(&self) -> Result<()> {
        self.ensure_open()?;
        let count = self.release_all();
        tracing::debug!(session = %self.id, released = count, "Tracking cleared");
        Ok(())
    }

    /// Detach every entity and empty the map.
    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let count = self.release_all();
        self.store.unregister(self.id);
        tracing::debug!(session = %self.id, released = count, "Session closed");
    }
}

impl SessionLink for SessionInner {
    fn session_id(&self) -> Uuid {
        self.id
    }

    fn entity_mutated(&self, key: EntityKey, field: &str) -> Result<()> {
        self.register_mutation(key)?;
        self.notify(key, field);
        Ok(())
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// The central unit-of-work manager.
///
/// A cheap handle: clones refer to the same session. Obtain one from
/// [`Store::open_session`].
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    pub(crate) fn open(store: Rc<StoreInner>, config: SessionConfig) -> Self {
        let inner = Rc::new_cyclic(|self_weak| SessionInner {
            id: Uuid::new_v4(),
            self_weak: self_weak.clone(),
            store,
            config,
            map: RefCell::new(IdentityMap::new()),
            closed: Cell::new(false),
            events: RefCell::new(SessionEventCallbacks::default()),
            sinks: RefCell::new(Vec::new()),
        });
        inner.store.register(Rc::downgrade(&inner));
        tracing::debug!(session = %inner.id, "Session opened");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<SessionInner>) -> Self {
        Self { inner }
    }

    /// The session owning `entity`, if any.
    pub fn of(entity: &dyn AnyEntity) -> Option<Session> {
        session_of(entity).map(Self::from_inner)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    pub fn store(&self) -> Store {
        Store {
            inner: Rc::clone(&self.inner.store),
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a callback fired before commit. An error aborts the commit.
    pub fn on_before_commit(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.inner.events.borrow_mut().before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.inner.events.borrow_mut().after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.inner
            .events
            .borrow_mut()
            .after_rollback
            .push(Box::new(f));
    }

    /// Register a mutation sink.
    ///
    /// The sink runs while the mutated entity may still be borrowed; it must
    /// not borrow the entity itself.
    pub fn on_mutation(&self, f: impl Fn(EntityKey, &str) + 'static) {
        self.inner.sinks.borrow_mut().push(Rc::new(f));
    }

    // ========================================================================
    // Identity map / unit of work
    // ========================================================================

    /// Track a new entity and, depth-first, everything it reaches.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    pub fn attach_new<T: Entity>(&self, entity: &EntityRef<T>) -> Result<()> {
        self.inner.attach_new(&erase(entity))
    }

    /// Get by key: the identity-map instance if alive, otherwise from storage.
    pub fn find<T: Entity>(&self, key: EntityKey) -> Result<Option<EntityRef<T>>> {
        self.inner.schema().entry_of::<T>()?;
        self.inner
            .find_any(T::TABLE_NAME, key)?
            .map(typed::<T>)
            .transpose()
    }

    /// Mark a tracked entity as modified.
    pub fn register_mutation(&self, key: EntityKey) -> Result<()> {
        self.inner.register_mutation(key)
    }

    /// Mark an entity, and everything it cascades to, for deletion.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    pub fn delete<T: Entity>(&self, entity: &EntityRef<T>) -> Result<()> {
        self.inner.delete_entity(&erase(entity))
    }

    /// Delete several entities. Stops at the first error.
    pub fn delete_all<T: Entity>(&self, entities: &[EntityRef<T>]) -> Result<()> {
        entities.iter().try_for_each(|e| self.delete(e))
    }

    /// Flush every pending change in one transaction.
    pub fn commit(&self) -> Result<CommitSummary> {
        self.inner.commit()
    }

    /// Detach every tracked entity. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Stop tracking everything without closing.
    ///
    /// Pending changes are dropped and every entity becomes detached. The
    /// session stays registered and usable.
    pub fn clear_changes(&self) -> Result<()> {
        self.inner.clear_changes()
    }

    /// Reload every stored column from storage and reset to `Unchanged`.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    pub fn refresh<T: Entity>(&self, entity: &EntityRef<T>) -> Result<()> {
        self.inner.refresh(&erase(entity))
    }

    /// Write a detached entity immediately and track it as `Unchanged`.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    pub fn insert<T: Entity>(&self, entity: &EntityRef<T>) -> Result<()> {
        self.inner.insert(&erase(entity))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query and return tracked instances.
    #[tracing::instrument(level = "debug", skip(self, select), fields(table = T::TABLE_NAME))]
    pub fn query<T: Entity>(&self, select: &Select) -> Result<Vec<EntityRef<T>>> {
        self.inner.ensure_open()?;
        let entry = self.inner.schema().entry_of::<T>()?;
        if select.table() != T::TABLE_NAME {
            return Err(wrong_table(T::TABLE_NAME, select.table()));
        }
        let (sql, params) = select.build();
        let rows = self.inner.store.backend.borrow().query(&sql, &params)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(entity) = self.inner.adopt(entry, row)? {
                out.push(typed::<T>(entity)?);
            }
        }
        tracing::debug!(rows = rows.len(), returned = out.len(), "Query complete");
        Ok(out)
    }

    /// Run a query and return plain instances the session does not track.
    ///
    /// Rows are materialized fresh, so local edits to tracked instances are
    /// not visible and the results never reach storage.
    #[tracing::instrument(level = "debug", skip(self, select), fields(table = T::TABLE_NAME))]
    pub fn query_untracked<T: Entity>(&self, select: &Select) -> Result<Vec<EntityRef<T>>> {
        self.inner.ensure_open()?;
        let entry = self.inner.schema().entry_of::<T>()?;
        if select.table() != T::TABLE_NAME {
            return Err(wrong_table(T::TABLE_NAME, select.table()));
        }
        let (sql, params) = select.build();
        let rows = self.inner.store.backend.borrow().query(&sql, &params)?;
        rows.iter()
            .map(|row| typed::<T>(entry.materialize(row)?))
            .collect()
    }

    /// Every row of `T`'s table, untracked.
    pub fn all_untracked<T: Entity>(&self) -> Result<Vec<EntityRef<T>>> {
        let table = &self.inner.schema().entry_of::<T>()?.table;
        self.query_untracked::<T>(&Select::projection(table, true))
    }

    pub fn first<T: Entity>(&self, select: &Select) -> Result<Option<EntityRef<T>>> {
        Ok(self
            .query::<T>(&select.clone().limit(1))?
            .into_iter()
            .next())
    }

    /// Every row of `T`'s table, private columns included.
    pub fn all<T: Entity>(&self) -> Result<Vec<EntityRef<T>>> {
        let table = &self.inner.schema().entry_of::<T>()?.table;
        self.query::<T>(&Select::projection(table, true))
    }

    /// Whether storage holds a row for `key`. The identity map is not consulted.
    pub fn exists<T: Entity>(&self, key: EntityKey) -> Result<bool> {
        self.inner.ensure_open()?;
        let entry = self.inner.schema().entry_of::<T>()?;
        Ok(self
            .inner
            .store
            .backend
            .borrow()
            .find_by_key(&entry.table, key)?
            .is_some())
    }

    /// Number of stored rows of `T`.
    pub fn count<T: Entity>(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        self.inner.schema().entry_of::<T>()?;
        let (sql, params) = Select::new(T::TABLE_NAME).build_count();
        let value = self
            .inner
            .store
            .backend
            .borrow()
            .execute_scalar(&sql, &params)?;
        let count = value.as_ref().and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// State of the entity with `key`, if tracked.
    pub fn state_of(&self, key: EntityKey) -> Option<EntityState> {
        self.inner.state(key)
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.inner.map.borrow().contains(key)
    }

    /// Records with a pending change, in save order.
    pub fn changes(&self) -> Vec<ChangeEntry> {
        self.inner
            .map
            .borrow()
            .ordered()
            .into_iter()
            .filter(|r| r.state.is_pending())
            .map(|r| ChangeEntry {
                key: r.key,
                table: r.table,
                state: r.state,
            })
            .collect()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts::from_map(&self.inner.map.borrow())
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.map.borrow().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let map = self.inner.map.borrow();
        let counts = PendingCounts::from_map(&map);
        SessionDebugInfo {
            session: self.inner.id,
            tracked: map.len(),
            added: counts.added,
            modified: counts.modified,
            deleted: counts.deleted,
            unchanged: map
                .iter()
                .filter(|r| r.state == EntityState::Unchanged)
                .count(),
            closed: self.inner.is_closed(),
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("tracked", &self.inner.map.borrow().len())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}
