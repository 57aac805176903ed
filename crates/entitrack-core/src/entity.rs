//! The `Entity` trait and its type-erased counterpart.
//!
//! Application types implement [`Entity`] by hand: they expose their columns
//! by name, hold an [`EntityLink`] back to their owning session, and expose
//! relationship slots ([`Reference`](crate::Reference) and
//! [`Collection`](crate::Collection)) through [`Entity::navigation`].
//!
//! Live instances are shared as [`EntityRef<T>`] (`Rc<RefCell<T>>`). The
//! session works with them through [`AnyEntity`], which is implemented for
//! every `RefCell<T: Entity>`.

use crate::Result;
use crate::error::{Error, SchemaErrorKind};
use crate::key::EntityKey;
use crate::relationship::{CollectionBinding, CollectionSlot, ReferenceSlot};
use crate::row::Row;
use crate::schema::TableSchema;
use crate::value::Value;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// A shared, mutable handle to a live entity.
pub type EntityRef<T> = Rc<RefCell<T>>;

/// A type-erased handle to a live entity.
pub type AnyEntityRef = Rc<dyn AnyEntity>;

/// A non-owning, type-erased handle to a live entity.
pub type WeakAnyEntity = Weak<dyn AnyEntity>;

/// The session side of an entity's back-link.
///
/// Implemented by the session crate; entities only ever hold it weakly.
pub trait SessionLink {
    /// Identifier of the session.
    fn session_id(&self) -> uuid::Uuid;

    /// Record that `field` of the entity `key` changed.
    ///
    /// Fails when the entity may not be mutated (deleted, unknown, closed
    /// session). Callers must not apply the change in that case.
    fn entity_mutated(&self, key: EntityKey, field: &str) -> Result<()>;

    /// Upcast for recovering the concrete session type.
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Non-owning handle from an entity back to the session that tracks it.
#[derive(Clone, Default)]
pub struct EntityLink {
    session: Option<Weak<dyn SessionLink>>,
}

impl EntityLink {
    /// The owning session, if the entity is attached and the session is alive.
    pub fn session(&self) -> Option<Rc<dyn SessionLink>> {
        self.session.as_ref().and_then(Weak::upgrade)
    }

    /// Whether the entity is currently tracked by a live session.
    pub fn is_attached(&self) -> bool {
        self.session().is_some()
    }

    pub fn bind(&mut self, session: Weak<dyn SessionLink>) {
        self.session = Some(session);
    }

    pub fn unbind(&mut self) {
        self.session = None;
    }

    /// Notify the owning session that `field` is about to change.
    ///
    /// A detached entity accepts every change silently.
    pub fn touch(&self, key: EntityKey, field: &str) -> Result<()> {
        match self.session() {
            Some(session) => session.entity_mutated(key, field),
            None => Ok(()),
        }
    }

    /// Assign `value` to `slot`, notifying the session first.
    ///
    /// Returns `Ok(false)` when the value is unchanged. If the session rejects
    /// the mutation the slot keeps its old value.
    pub fn set_field<V: PartialEq>(
        &self,
        key: EntityKey,
        field: &str,
        slot: &mut V,
        value: V,
    ) -> Result<bool> {
        if *slot == value {
            return Ok(false);
        }
        self.touch(key, field)?;
        *slot = value;
        Ok(true)
    }
}

impl fmt::Debug for EntityLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session() {
            Some(session) => write!(f, "EntityLink(session {})", session.session_id()),
            None => f.write_str("EntityLink(detached)"),
        }
    }
}

/// A borrowed relationship slot.
pub enum Navigation<'a> {
    Reference(&'a dyn ReferenceSlot),
    Collection(&'a dyn CollectionSlot),
}

/// A mutably borrowed relationship slot.
pub enum NavigationMut<'a> {
    Reference(&'a mut dyn ReferenceSlot),
    Collection(&'a mut dyn CollectionSlot),
}

/// Trait for types that can be tracked by a session.
///
/// `Default` must produce an empty instance with a fresh key; rows are
/// materialized by filling such an instance through [`Entity::set_column`].
///
/// Column names passed to `column`/`set_column` are the descriptor names
/// from [`Entity::table`], not storage names.
pub trait Entity: Default + 'static {
    /// Name of the table this type maps to.
    const TABLE_NAME: &'static str;

    /// Build the schema descriptor for this type.
    ///
    /// Called once when the type is registered with a
    /// [`SchemaBuilder`](crate::SchemaBuilder).
    fn table() -> TableSchema;

    /// The primary key.
    fn key(&self) -> EntityKey;

    fn link(&self) -> &EntityLink;

    fn link_mut(&mut self) -> &mut EntityLink;

    /// Read a stored column.
    fn column(&self, name: &str) -> Option<Value>;

    /// Write a stored column without notifying the session.
    fn set_column(&mut self, name: &str, value: &Value) -> Result<()>;

    /// Borrow a relationship slot by navigation name.
    fn navigation(&self, _name: &str) -> Option<Navigation<'_>> {
        None
    }

    /// Mutably borrow a relationship slot by navigation name.
    fn navigation_mut(&mut self, _name: &str) -> Option<NavigationMut<'_>> {
        None
    }
}

/// Build an entity from a storage row.
///
/// Columns missing from the row keep their default value.
pub fn materialize<T: Entity>(table: &TableSchema, row: &Row) -> Result<T> {
    let mut entity = T::default();
    for column in table.storage_columns() {
        if let Some(value) = row.get_by_name(column.storage_name) {
            entity.set_column(column.name, value)?;
        }
    }
    Ok(entity)
}

/// Same as [`materialize`] but returns a type-erased shared handle.
pub fn materialize_any<T: Entity>(table: &TableSchema, row: &Row) -> Result<AnyEntityRef> {
    Ok(Rc::new(RefCell::new(materialize::<T>(table, row)?)) as AnyEntityRef)
}

/// Recover a typed handle from an erased one.
pub fn downcast<T: Entity>(entity: AnyEntityRef) -> Option<EntityRef<T>> {
    entity.into_any().downcast::<RefCell<T>>().ok()
}

/// Erase the type of a handle.
pub fn erase<T: Entity>(entity: &EntityRef<T>) -> AnyEntityRef {
    Rc::clone(entity) as AnyEntityRef
}

/// Object-safe view of a live entity used by the session.
///
/// Every method borrows the underlying `RefCell` only for the duration of
/// the call.
pub trait AnyEntity {
    fn table_name(&self) -> &'static str;

    fn entity_type(&self) -> TypeId;

    fn key(&self) -> EntityKey;

    fn session(&self) -> Option<Rc<dyn SessionLink>>;

    fn bind_session(&self, session: Weak<dyn SessionLink>);

    /// Returns `false`, leaving the link alone, while the entity is borrowed.
    fn unbind_session(&self) -> bool;

    /// Render the stored columns as a row keyed by storage name.
    fn to_row(&self, table: &TableSchema) -> Row;

    fn column(&self, name: &str) -> Option<Value>;

    fn set_column(&self, name: &str, value: &Value) -> Result<()>;

    fn reference_key(&self, nav: &str) -> Result<Option<EntityKey>>;

    /// The cached related object and its key, if alive.
    fn reference_cached(&self, nav: &str) -> Result<Option<(EntityKey, AnyEntityRef)>>;

    /// Point a reference at `target`, updating both key and cache.
    fn assign_reference(&self, nav: &str, target: Option<&AnyEntityRef>) -> Result<()>;

    /// Cache `target` without touching the stored key.
    fn cache_reference(&self, nav: &str, target: &AnyEntityRef) -> Result<()>;

    /// Drop the cached object, keeping the stored key.
    fn forget_reference(&self, nav: &str) -> Result<()>;

    fn binding(&self, nav: &str) -> Result<Option<CollectionBinding>>;

    fn set_binding(&self, nav: &str, binding: Option<CollectionBinding>) -> Result<()>;

    fn members(&self, nav: &str) -> Result<Vec<AnyEntityRef>>;

    fn contains_member(&self, nav: &str, key: EntityKey) -> Result<bool>;

    /// Append `item` unless a member with the same key is present.
    fn push_member(&self, nav: &str, item: &AnyEntityRef) -> Result<bool>;

    fn remove_member(&self, nav: &str, key: EntityKey) -> Result<Option<AnyEntityRef>>;

    fn move_member(&self, nav: &str, from: usize, to: usize) -> Result<()>;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

fn missing_navigation<T: Entity>(nav: &str, kind: &str) -> Error {
    Error::schema(
        SchemaErrorKind::ColumnNotFound,
        format!("{} has no {} navigation '{}'", T::TABLE_NAME, kind, nav),
    )
}

fn reference_of<'a, T: Entity>(entity: &'a T, nav: &str) -> Result<&'a dyn ReferenceSlot> {
    match entity.navigation(nav) {
        Some(Navigation::Reference(slot)) => Ok(slot),
        _ => Err(missing_navigation::<T>(nav, "reference")),
    }
}

fn reference_of_mut<'a, T: Entity>(
    entity: &'a mut T,
    nav: &str,
) -> Result<&'a mut dyn ReferenceSlot> {
    match entity.navigation_mut(nav) {
        Some(NavigationMut::Reference(slot)) => Ok(slot),
        _ => Err(missing_navigation::<T>(nav, "reference")),
    }
}

fn collection_of<'a, T: Entity>(entity: &'a T, nav: &str) -> Result<&'a dyn CollectionSlot> {
    match entity.navigation(nav) {
        Some(Navigation::Collection(slot)) => Ok(slot),
        _ => Err(missing_navigation::<T>(nav, "collection")),
    }
}

fn collection_of_mut<'a, T: Entity>(
    entity: &'a mut T,
    nav: &str,
) -> Result<&'a mut dyn CollectionSlot> {
    match entity.navigation_mut(nav) {
        Some(NavigationMut::Collection(slot)) => Ok(slot),
        _ => Err(missing_navigation::<T>(nav, "collection")),
    }
}

impl<T: Entity> AnyEntity for RefCell<T> {
    fn table_name(&self) -> &'static str {
        T::TABLE_NAME
    }

    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn key(&self) -> EntityKey {
        self.borrow().key()
    }

    fn session(&self) -> Option<Rc<dyn SessionLink>> {
        self.borrow().link().session()
    }

    fn bind_session(&self, session: Weak<dyn SessionLink>) {
        self.borrow_mut().link_mut().bind(session);
    }

    fn unbind_session(&self) -> bool {
        match self.try_borrow_mut() {
            Ok(mut entity) => {
                entity.link_mut().unbind();
                true
            }
            Err(_) => false,
        }
    }

    fn to_row(&self, table: &TableSchema) -> Row {
        let entity = self.borrow();
        Row::from_pairs(table.storage_columns().map(|column| {
            (
                column.storage_name,
                entity.column(column.name).unwrap_or(Value::Null),
            )
        }))
    }

    fn column(&self, name: &str) -> Option<Value> {
        self.borrow().column(name)
    }

    fn set_column(&self, name: &str, value: &Value) -> Result<()> {
        self.borrow_mut().set_column(name, value)
    }

    fn reference_key(&self, nav: &str) -> Result<Option<EntityKey>> {
        let entity = self.borrow();
        Ok(reference_of(&*entity, nav)?.key())
    }

    fn reference_cached(&self, nav: &str) -> Result<Option<(EntityKey, AnyEntityRef)>> {
        let entity = self.borrow();
        Ok(reference_of(&*entity, nav)?.cached())
    }

    fn assign_reference(&self, nav: &str, target: Option<&AnyEntityRef>) -> Result<()> {
        // Read the target key before borrowing self: the target may be self.
        let target = target.map(|t| (t.key(), Rc::clone(t)));
        let mut entity = self.borrow_mut();
        reference_of_mut(&mut *entity, nav)?.assign(target)
    }

    fn cache_reference(&self, nav: &str, target: &AnyEntityRef) -> Result<()> {
        let key = target.key();
        let mut entity = self.borrow_mut();
        reference_of_mut(&mut *entity, nav)?.cache(key, Rc::clone(target))
    }

    fn forget_reference(&self, nav: &str) -> Result<()> {
        let mut entity = self.borrow_mut();
        reference_of_mut(&mut *entity, nav)?.forget();
        Ok(())
    }

    fn binding(&self, nav: &str) -> Result<Option<CollectionBinding>> {
        let entity = self.borrow();
        Ok(collection_of(&*entity, nav)?.binding())
    }

    fn set_binding(&self, nav: &str, binding: Option<CollectionBinding>) -> Result<()> {
        let mut entity = self.borrow_mut();
        collection_of_mut(&mut *entity, nav)?.set_binding(binding);
        Ok(())
    }

    fn members(&self, nav: &str) -> Result<Vec<AnyEntityRef>> {
        let entity = self.borrow();
        Ok(collection_of(&*entity, nav)?.members())
    }

    fn contains_member(&self, nav: &str, key: EntityKey) -> Result<bool> {
        let entity = self.borrow();
        Ok(collection_of(&*entity, nav)?.contains(key))
    }

    fn push_member(&self, nav: &str, item: &AnyEntityRef) -> Result<bool> {
        let key = item.key();
        let mut entity = self.borrow_mut();
        collection_of_mut(&mut *entity, nav)?.push(key, Rc::clone(item))
    }

    fn remove_member(&self, nav: &str, key: EntityKey) -> Result<Option<AnyEntityRef>> {
        let mut entity = self.borrow_mut();
        Ok(collection_of_mut(&mut *entity, nav)?.remove(key))
    }

    fn move_member(&self, nav: &str, from: usize, to: usize) -> Result<()> {
        let mut entity = self.borrow_mut();
        collection_of_mut(&mut *entity, nav)?.move_item(from, to)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
