//! Tracked entity records.

use entitrack_core::{AnyEntityRef, EntityKey, WeakAnyEntity};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;
use std::rc::Rc;

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// New, will be inserted on commit.
    Added,
    /// Loaded and changed, will be written on commit.
    Modified,
    /// Will be deleted on commit.
    Deleted,
    /// In sync with storage.
    Unchanged,
    /// No longer tracked (session closed).
    Detached,
}

impl EntityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
            EntityState::Unchanged => "Unchanged",
            EntityState::Detached => "Detached",
        }
    }

    /// Does this state produce a storage operation on commit?
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a record holds its entity.
///
/// Records with a pending change pin the entity so the change cannot be lost
/// when the application drops its last handle.
#[derive(Clone)]
pub enum EntityHandle {
    Strong(AnyEntityRef),
    Weak(WeakAnyEntity),
}

impl EntityHandle {
    pub fn upgrade(&self) -> Option<AnyEntityRef> {
        match self {
            EntityHandle::Strong(entity) => Some(Rc::clone(entity)),
            EntityHandle::Weak(weak) => weak.upgrade(),
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, EntityHandle::Strong(_))
    }

    /// Is the entity still alive?
    pub fn is_live(&self) -> bool {
        match self {
            EntityHandle::Strong(_) => true,
            EntityHandle::Weak(weak) => weak.strong_count() > 0,
        }
    }

    /// Does this handle point at `entity`?
    pub fn points_to(&self, entity: &AnyEntityRef) -> bool {
        self.upgrade().is_some_and(|e| Rc::ptr_eq(&e, entity))
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityHandle::Strong(_) => f.write_str("Strong"),
            EntityHandle::Weak(weak) if weak.strong_count() > 0 => f.write_str("Weak"),
            EntityHandle::Weak(_) => f.write_str("Weak(dead)"),
        }
    }
}

/// One entry of the identity map.
#[derive(Debug, Clone)]
pub struct TrackedRecord {
    pub key: EntityKey,
    pub table: &'static str,
    pub type_id: TypeId,
    /// Monotonic per session; fixes save order only.
    pub insertion_order: u64,
    pub state: EntityState,
    pub handle: EntityHandle,
}

impl TrackedRecord {
    pub fn entity(&self) -> Option<AnyEntityRef> {
        self.handle.upgrade()
    }

    /// Move to `state`, pinning or releasing the entity to match.
    ///
    /// Pinning needs a live entity; a dead weak record stays weak.
    pub fn transition(&mut self, state: EntityState) {
        tracing::trace!(key = %self.key, table = self.table, from = %self.state, to = %state, "State transition");
        self.state = state;
        if state.is_pending() {
            if let Some(entity) = self.handle.upgrade() {
                self.handle = EntityHandle::Strong(entity);
            }
        } else if let EntityHandle::Strong(entity) = &self.handle {
            self.handle = EntityHandle::Weak(Rc::downgrade(entity));
        }
    }
}
