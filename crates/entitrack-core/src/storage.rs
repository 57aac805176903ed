//! The storage backend seam.
//!
//! A [`Storage`] is a synchronous, row-level store. The session only ever
//! writes whole rows keyed by primary key, reads single rows by key, and runs
//! the small SELECT/COUNT subset produced by `entitrack-query`.
//!
//! Only one transaction may be open at a time. Backends report misuse
//! (nested `begin`, `commit` without `begin`) as
//! [`StorageErrorKind::Transaction`](crate::StorageErrorKind::Transaction).

use crate::Result;
use crate::key::EntityKey;
use crate::row::Row;
use crate::schema::TableSchema;
use crate::value::Value;

/// A relational store the session flushes into.
pub trait Storage {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str {
        "storage"
    }

    /// Write `row` into `table`, replacing any row with the same key.
    fn insert_or_replace(&mut self, table: &TableSchema, row: &Row) -> Result<()>;

    /// Delete the row with `key`. Deleting a missing row is not an error.
    fn delete(&mut self, table: &TableSchema, key: EntityKey) -> Result<()>;

    /// Fetch one row by primary key, with every stored column.
    fn find_by_key(&self, table: &TableSchema, key: EntityKey) -> Result<Option<Row>>;

    /// Run a SELECT with positional `?` parameters.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement returning a single value (e.g. `COUNT(*)`).
    fn execute_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn insert_or_replace(&mut self, table: &TableSchema, row: &Row) -> Result<()> {
        (**self).insert_or_replace(table, row)
    }

    fn delete(&mut self, table: &TableSchema, key: EntityKey) -> Result<()> {
        (**self).delete(table, key)
    }

    fn find_by_key(&self, table: &TableSchema, key: EntityKey) -> Result<Option<Row>> {
        (**self).find_by_key(table, key)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        (**self).execute_scalar(sql, params)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }
}
