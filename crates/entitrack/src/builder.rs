//! Store construction.
//!
//! A [`StoreBuilder`] collects entity registrations and hands the validated
//! schema, together with a backend, to a new [`Store`].
//!
//! # Example
//!
//! ```rust,ignore
//! use entitrack::prelude::*;
//!
//! let store = Store::builder()
//!     .register::<User>()
//!     .register::<UserRole>()
//!     .in_memory()?;
//! ```

use entitrack_core::{Entity, Result, SchemaBuilder, Storage};
use entitrack_memory::MemoryStore;
use entitrack_session::Store;

/// Builder for [`Store`] instances.
#[derive(Debug, Default)]
pub struct StoreBuilder {
    schema: SchemaBuilder,
    tables: Vec<&'static str>,
}

impl StoreBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. Relationships are resolved at build time, so
    /// registration order does not matter.
    #[must_use]
    pub fn register<T: Entity>(mut self) -> Self {
        self.schema = self.schema.register::<T>();
        self.tables.push(T::TABLE_NAME);
        self
    }

    /// Tables registered so far, in registration order.
    pub fn tables(&self) -> &[&'static str] {
        &self.tables
    }

    /// Validate the schema and open a store over `backend`.
    pub fn build_with(self, backend: impl Storage + 'static) -> Result<Store> {
        let schema = self.schema.build()?;
        tracing::info!(
            backend = backend.name(),
            tables = self.tables.len(),
            "Opening store"
        );
        Ok(Store::new(backend, schema))
    }

    /// Validate the schema and open a store over a fresh [`MemoryStore`].
    pub fn in_memory(self) -> Result<Store> {
        self.build_with(MemoryStore::new())
    }
}

/// Entry point mirroring [`Store::new`] for callers that prefer a builder.
pub trait StoreExt {
    fn builder() -> StoreBuilder;
}

impl StoreExt for Store {
    fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }
}
