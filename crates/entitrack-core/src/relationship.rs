//! Relationship slots stored inside entities.
//!
//! - [`Reference<T>`] is a single-valued relationship: it stores the foreign
//!   key and a weak cache of the related object.
//! - [`Collection<T>`] is the one-to-many side: it owns its members and
//!   carries a [`CollectionBinding`] once the session has taken charge of it.
//!
//! Both are plain data. Lazy resolution and change propagation live in the
//! session crate and reach these slots through [`ReferenceSlot`] and
//! [`CollectionSlot`].

use crate::Result;
use crate::entity::{AnyEntityRef, Entity, EntityRef, downcast};
use crate::error::{Error, TypeError};
use crate::key::EntityKey;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Type-erased access to a [`Reference`].
pub trait ReferenceSlot {
    /// Stored foreign key.
    fn key(&self) -> Option<EntityKey>;

    /// Overwrite the stored key. The cache is left as is.
    fn set_key(&mut self, key: Option<EntityKey>);

    /// The cached object and its key, if the object is still alive.
    fn cached(&self) -> Option<(EntityKey, AnyEntityRef)>;

    /// Set both key and cache.
    fn assign(&mut self, target: Option<(EntityKey, AnyEntityRef)>) -> Result<()>;

    /// Set the cache only.
    fn cache(&mut self, key: EntityKey, target: AnyEntityRef) -> Result<()>;

    /// Drop the cache.
    fn forget(&mut self);
}

/// Type-erased access to a [`Collection`].
pub trait CollectionSlot {
    fn binding(&self) -> Option<CollectionBinding>;

    fn set_binding(&mut self, binding: Option<CollectionBinding>);

    fn members(&self) -> Vec<AnyEntityRef>;

    fn contains(&self, key: EntityKey) -> bool;

    /// Append unless present. Returns whether the item was added.
    fn push(&mut self, key: EntityKey, item: AnyEntityRef) -> Result<bool>;

    fn remove(&mut self, key: EntityKey) -> Option<AnyEntityRef>;

    fn move_item(&mut self, from: usize, to: usize) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn wrong_type<T: Entity>(actual: &'static str) -> Error {
    Error::Type(TypeError {
        expected: T::TABLE_NAME,
        actual: actual.to_string(),
        column: None,
        rust_type: Some(std::any::type_name::<T>()),
    })
}

/// Single-valued relationship holding a foreign key and a weak cache.
///
/// The cache never keeps the related object alive; a dropped target is
/// simply reloaded on the next access.
pub struct Reference<T: Entity> {
    key: Option<EntityKey>,
    cached: Option<(EntityKey, Weak<RefCell<T>>)>,
}

impl<T: Entity> Reference<T> {
    /// An empty reference.
    pub const fn empty() -> Self {
        Self {
            key: None,
            cached: None,
        }
    }

    /// A reference holding only a key; the object is loaded on access.
    pub const fn from_key(key: EntityKey) -> Self {
        Self {
            key: Some(key),
            cached: None,
        }
    }

    /// A reference pointing at a live object.
    pub fn to(target: &EntityRef<T>) -> Self {
        let key = target.borrow().key();
        Self {
            key: Some(key),
            cached: Some((key, Rc::downgrade(target))),
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.key
    }

    pub fn set_key(&mut self, key: Option<EntityKey>) {
        self.key = key;
    }

    /// The cached object, without any consistency check.
    pub fn cached(&self) -> Option<EntityRef<T>> {
        self.cached.as_ref().and_then(|(_, weak)| weak.upgrade())
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.cached.is_none()
    }
}

impl<T: Entity> Default for Reference<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Entity> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            cached: self.cached.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("table", &T::TABLE_NAME)
            .field("key", &self.key)
            .field("cached", &self.cached.as_ref().map(|(k, _)| *k))
            .finish()
    }
}

impl<T: Entity> ReferenceSlot for Reference<T> {
    fn key(&self) -> Option<EntityKey> {
        self.key
    }

    fn set_key(&mut self, key: Option<EntityKey>) {
        self.key = key;
    }

    fn cached(&self) -> Option<(EntityKey, AnyEntityRef)> {
        let (key, weak) = self.cached.as_ref()?;
        let target = weak.upgrade()?;
        Some((*key, target as AnyEntityRef))
    }

    fn assign(&mut self, target: Option<(EntityKey, AnyEntityRef)>) -> Result<()> {
        match target {
            Some((key, target)) => {
                let table = target.table_name();
                let typed = downcast::<T>(target).ok_or_else(|| wrong_type::<T>(table))?;
                self.key = Some(key);
                self.cached = Some((key, Rc::downgrade(&typed)));
            }
            None => {
                self.key = None;
                self.cached = None;
            }
        }
        Ok(())
    }

    fn cache(&mut self, key: EntityKey, target: AnyEntityRef) -> Result<()> {
        let table = target.table_name();
        let typed = downcast::<T>(target).ok_or_else(|| wrong_type::<T>(table))?;
        self.cached = Some((key, Rc::downgrade(&typed)));
        Ok(())
    }

    fn forget(&mut self) {
        self.cached = None;
    }
}

/// Runtime state of a collection the session has taken charge of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionBinding {
    /// Navigation name of the relationship this collection satisfies.
    pub relationship: &'static str,
    /// Whether every dependent row has been loaded from storage.
    pub loaded: bool,
}

impl CollectionBinding {
    pub const fn new(relationship: &'static str) -> Self {
        Self {
            relationship,
            loaded: false,
        }
    }

    pub const fn loaded(relationship: &'static str) -> Self {
        Self {
            relationship,
            loaded: true,
        }
    }
}

/// One-to-many relationship: the dependents that point at their owner.
pub struct Collection<T: Entity> {
    items: Vec<(EntityKey, EntityRef<T>)>,
    binding: Option<CollectionBinding>,
}

impl<T: Entity> Collection<T> {
    pub const fn new() -> Self {
        Self {
            items: Vec::new(),
            binding: None,
        }
    }

    /// Append an item without any tracking.
    ///
    /// Meant for building a graph before it is handed to a session; once the
    /// owner is attached, edits go through the session so foreign keys and
    /// states follow.
    pub fn push_untracked(&mut self, item: EntityRef<T>) {
        let key = item.borrow().key();
        if !self.items.iter().any(|(k, _)| *k == key) {
            self.items.push((key, item));
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&EntityRef<T>> {
        self.items.get(index).map(|(_, item)| item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef<T>> {
        self.items.iter().map(|(_, item)| item)
    }

    pub fn keys(&self) -> impl Iterator<Item = EntityKey> {
        self.items.iter().map(|(k, _)| *k)
    }

    pub fn contains_key(&self, key: EntityKey) -> bool {
        self.items.iter().any(|(k, _)| *k == key)
    }

    /// Snapshot of the members.
    pub fn to_vec(&self) -> Vec<EntityRef<T>> {
        self.iter().cloned().collect()
    }

    pub fn binding(&self) -> Option<CollectionBinding> {
        self.binding
    }

    pub fn is_loaded(&self) -> bool {
        self.binding.is_some_and(|b| b.loaded)
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("table", &T::TABLE_NAME)
            .field("len", &self.items.len())
            .field("binding", &self.binding)
            .finish()
    }
}

impl<T: Entity> CollectionSlot for Collection<T> {
    fn binding(&self) -> Option<CollectionBinding> {
        self.binding
    }

    fn set_binding(&mut self, binding: Option<CollectionBinding>) {
        self.binding = binding;
    }

    fn members(&self) -> Vec<AnyEntityRef> {
        self.items
            .iter()
            .map(|(_, item)| Rc::clone(item) as AnyEntityRef)
            .collect()
    }

    fn contains(&self, key: EntityKey) -> bool {
        self.contains_key(key)
    }

    fn push(&mut self, key: EntityKey, item: AnyEntityRef) -> Result<bool> {
        if self.contains_key(key) {
            return Ok(false);
        }
        let table = item.table_name();
        let typed = downcast::<T>(item).ok_or_else(|| wrong_type::<T>(table))?;
        self.items.push((key, typed));
        Ok(true)
    }

    fn remove(&mut self, key: EntityKey) -> Option<AnyEntityRef> {
        let index = self.items.iter().position(|(k, _)| *k == key)?;
        let (_, item) = self.items.remove(index);
        Some(item as AnyEntityRef)
    }

    fn move_item(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.items.len() || to >= self.items.len() {
            return Err(Error::UnsupportedEdit {
                collection: T::TABLE_NAME.to_string(),
                edit: "move out of range",
            });
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        Ok(())
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A structural edit requested on a collection.
///
/// Only `Add`, `Remove` and `Move` are accepted by the session.
pub enum CollectionEdit<T: Entity> {
    Add(EntityRef<T>),
    Remove(EntityRef<T>),
    Move { from: usize, to: usize },
    Replace { index: usize, item: EntityRef<T> },
    Clear,
}

impl<T: Entity> CollectionEdit<T> {
    pub const fn name(&self) -> &'static str {
        match self {
            CollectionEdit::Add(_) => "add",
            CollectionEdit::Remove(_) => "remove",
            CollectionEdit::Move { .. } => "move",
            CollectionEdit::Replace { .. } => "replace",
            CollectionEdit::Clear => "clear",
        }
    }
}
