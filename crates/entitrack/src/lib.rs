//! entitrack - change-tracking entity sessions over a relational store.
//!
//! entitrack keeps an in-memory object graph consistent with a relational
//! backend:
//!
//! - One live instance per key per session (identity map)
//! - Automatic change tracking and atomic commit (unit of work)
//! - Lazy references and collections with consistent inverse sides
//! - Cascade delete along flagged relationships
//! - Cross-session synchronization after every commit
//!
//! # Quick Start
//!
//! ```ignore
//! use entitrack::prelude::*;
//!
//! let store = Store::builder()
//!     .register::<User>()
//!     .register::<UserRole>()
//!     .in_memory()?;
//! let session = store.open_session();
//!
//! // Attach a new graph
//! let user = User::new("Alex");
//! user.add_to("roles", &UserRole::new("admin"))?;
//! session.attach_new(&user)?;
//! session.commit()?;
//!
//! // Load it back elsewhere
//! let other = store.open_session();
//! let again = other.find::<User>(user.borrow().key())?.expect("committed");
//! let roles = again.collection::<UserRole>("roles")?;
//! ```
//!
//! # Crates
//!
//! - `entitrack-core`: keys, values, rows, entities, relationship slots, schema
//! - `entitrack-query`: SELECT and COUNT construction
//! - `entitrack-memory`: transactional in-memory backend
//! - `entitrack-session`: sessions, unit of work, relationships, sync

pub use entitrack_core::{
    AnyEntity, AnyEntityRef, Collection, CollectionEdit, ColumnInfo, Entity, EntityKey,
    EntityLink, EntityRef, Error, FromValue, Navigation, NavigationMut, OwnershipError,
    Reference, RelationshipDescriptor, RelationshipKind, Result, Row, Schema, SchemaBuilder,
    SchemaError, SchemaErrorKind, StaleReferenceError, Storage, StorageError, StorageErrorKind,
    TableSchema, TypeError, Value,
};

pub use entitrack_query::{Comparison, Condition, OrderBy, OrderDirection, Select, select};

pub use entitrack_memory::{MemoryStats, MemoryStore};

pub use entitrack_session::{
    ChangeEntry, CommitSummary, EntityState, PendingCounts, Session, SessionConfig,
    SessionDebugInfo, Store, TrackedExt,
};

pub mod builder;
pub use builder::{StoreBuilder, StoreExt};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entitrack::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Collection,
        CollectionEdit,
        ColumnInfo,
        // Entities
        Entity,
        EntityKey,
        EntityLink,
        EntityRef,
        // Sessions
        EntityState,
        Error,
        MemoryStore,
        Navigation,
        NavigationMut,
        Reference,
        Result,
        Row,
        Schema,
        // Queries
        Select,
        Session,
        SessionConfig,
        Store,
        StoreBuilder,
        StoreExt,
        TableSchema,
        TrackedExt,
        Value,
        select,
    };
}
