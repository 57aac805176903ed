//! Core types and traits for entitrack.
//!
//! This crate provides the pieces shared by every other entitrack crate:
//!
//! - [`EntityKey`], [`Value`] and [`Row`] for identity and data exchange
//! - [`Entity`] and [`AnyEntity`] for mapping application structs
//! - [`Reference`] and [`Collection`] relationship slots
//! - [`Schema`] descriptors and derived [`RelationshipDescriptor`]s
//! - the [`Storage`] backend trait
//! - the [`Error`] taxonomy

pub mod entity;
pub mod error;
pub mod key;
pub mod relationship;
pub mod row;
pub mod schema;
pub mod storage;
pub mod value;

pub use entity::{
    AnyEntity, AnyEntityRef, Entity, EntityLink, EntityRef, Navigation, NavigationMut,
    SessionLink, WeakAnyEntity, downcast, erase, materialize, materialize_any,
};
pub use error::{
    Error, OwnershipError, Result, SchemaError, SchemaErrorKind, StaleReferenceError,
    StorageError, StorageErrorKind, TypeError,
};
pub use key::EntityKey;
pub use relationship::{
    Collection, CollectionBinding, CollectionEdit, CollectionSlot, Reference, ReferenceSlot,
};
pub use row::{FromValue, Row, RowColumns};
pub use schema::{
    ColumnInfo, InverseCollection, RelationshipDescriptor, RelationshipKind, Schema,
    SchemaBuilder, TableEntry, TableSchema, is_identifier,
};
pub use storage::Storage;
pub use value::Value;
