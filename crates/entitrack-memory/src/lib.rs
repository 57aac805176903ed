//! In-memory storage backend for entitrack.
//!
//! [`MemoryStore`] keeps rows per table in insertion order and interprets the
//! SELECT subset produced by `entitrack-query`. Transactions snapshot the whole
//! data set on `begin` and restore it on `rollback`.
//!
//! Handles are cheap clones sharing one data set, so a test can keep a handle
//! for inspection (or out-of-band writes) after boxing another into a store.
//!
//! Tables come into existence on first write; reading a table that was never
//! written yields no rows.

pub mod parse;

use entitrack_core::{
    EntityKey, Error, Result, Row, RowColumns, Storage, StorageError, StorageErrorKind,
    TableSchema, Value,
};
use entitrack_query::{Comparison, Condition, OrderDirection};
use parse::{ParsedSelect, Projection, parse_select};
use serde::Serialize;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub queries: u64,
    pub finds: u64,
    pub writes: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    key_column: String,
    rows: Vec<Row>,
    index: HashMap<EntityKey, usize>,
}

impl MemoryTable {
    fn new(key_column: &str) -> Self {
        Self {
            key_column: key_column.to_string(),
            ..Self::default()
        }
    }

    fn key_of(&self, row: &Row) -> Option<EntityKey> {
        row.get_by_name(&self.key_column).and_then(Value::as_key)
    }

    fn upsert(&mut self, key: EntityKey, row: Row) {
        match self.index.get(&key) {
            Some(&i) => self.rows[i] = row,
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(row);
            }
        }
    }

    fn remove(&mut self, key: EntityKey) -> bool {
        let Some(i) = self.index.remove(&key) else {
            return false;
        };
        self.rows.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        true
    }

    fn get(&self, key: EntityKey) -> Option<&Row> {
        self.index.get(&key).map(|&i| &self.rows[i])
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    tables: HashMap<String, MemoryTable>,
    snapshot: Option<HashMap<String, MemoryTable>>,
    /// Writes still allowed before injected failures start
    remaining_writes: Option<usize>,
    stats: MemoryStats,
}

impl MemoryData {
    fn table_mut(&mut self, table: &TableSchema) -> &mut MemoryTable {
        self.tables
            .entry(table.name().to_string())
            .or_insert_with(|| MemoryTable::new(table.key_column()))
    }

    fn consume_write(&mut self, table: &str) -> Result<()> {
        match self.remaining_writes {
            Some(0) => Err(Error::storage(
                StorageErrorKind::Write,
                format!("injected write failure on '{}'", table),
            )),
            Some(ref mut n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// A transactional in-memory [`Storage`] backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<MemoryData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more writes succeed, then fail every write until
    /// [`clear_failures`](Self::clear_failures).
    pub fn fail_after_writes(&self, n: usize) {
        self.inner.borrow_mut().remaining_writes = Some(n);
    }

    pub fn clear_failures(&self) {
        self.inner.borrow_mut().remaining_writes = None;
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner.borrow().stats
    }

    pub fn reset_stats(&self) {
        self.inner.borrow_mut().stats = MemoryStats::default();
    }

    /// Write a row directly, bypassing statistics and failure injection.
    pub fn put_row(&self, table: &TableSchema, row: Row) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        let target = data.table_mut(table);
        let key = target.key_of(&row).ok_or_else(|| missing_key(table))?;
        target.upsert(key, row);
        Ok(())
    }

    /// Fetch a row directly, bypassing statistics.
    pub fn get_row(&self, table: &str, key: EntityKey) -> Option<Row> {
        self.inner
            .borrow()
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    /// All rows of a table in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .borrow()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .borrow()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    fn select(&self, parsed: &ParsedSelect) -> Vec<Row> {
        let data = self.inner.borrow();
        let Some(table) = data.tables.get(&parsed.table) else {
            return Vec::new();
        };
        let mut rows: Vec<&Row> = table
            .rows
            .iter()
            .filter(|row| parsed.conditions.iter().all(|c| satisfies(row, c)))
            .collect();

        if !parsed.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for order in &parsed.order_by {
                    let left = a.get_by_name(&order.column).unwrap_or(&Value::Null);
                    let right = b.get_by_name(&order.column).unwrap_or(&Value::Null);
                    let ord = left.compare(right).unwrap_or(Ordering::Equal);
                    let ord = match order.direction {
                        OrderDirection::Asc => ord,
                        OrderDirection::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let rows = rows
            .into_iter()
            .skip(parsed.offset)
            .take(parsed.limit.unwrap_or(usize::MAX));
        match &parsed.projection {
            Projection::Columns(names) => {
                let columns = Arc::new(RowColumns::new(names.clone()));
                rows.map(|r| r.project(&columns)).collect()
            }
            Projection::All | Projection::Count => rows.cloned().collect(),
        }
    }
}

fn missing_key(table: &TableSchema) -> Error {
    Error::storage(
        StorageErrorKind::Constraint,
        format!(
            "row for '{}' has no usable key in column '{}'",
            table.name(),
            table.key_column()
        ),
    )
}

fn satisfies(row: &Row, condition: &Condition) -> bool {
    let stored = row.get_by_name(condition.column()).unwrap_or(&Value::Null);
    match condition {
        Condition::IsNull(_) => stored.is_null(),
        Condition::IsNotNull(_) => !stored.is_null(),
        Condition::Compare { op, value, .. } => {
            if stored.is_null() || value.is_null() {
                return false;
            }
            match op {
                Comparison::Eq => stored.matches(value),
                Comparison::NotEq => !stored.matches(value),
                Comparison::Lt => stored.compare(value) == Some(Ordering::Less),
                Comparison::Le => matches!(
                    stored.compare(value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                Comparison::Gt => stored.compare(value) == Some(Ordering::Greater),
                Comparison::Ge => matches!(
                    stored.compare(value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
            }
        }
    }
}

fn transaction_error(message: &str) -> Error {
    Error::Storage(StorageError {
        kind: StorageErrorKind::Transaction,
        message: message.to_string(),
        sql: None,
        source: None,
    })
}

impl Storage for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn insert_or_replace(&mut self, table: &TableSchema, row: &Row) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        data.consume_write(table.name())?;
        let target = data.table_mut(table);
        let key = target.key_of(row).ok_or_else(|| missing_key(table))?;
        target.upsert(key, row.clone());
        data.stats.writes += 1;
        tracing::trace!(table = table.name(), key = %key, "Row written");
        Ok(())
    }

    fn delete(&mut self, table: &TableSchema, key: EntityKey) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        data.consume_write(table.name())?;
        let removed = data.table_mut(table).remove(key);
        data.stats.deletes += 1;
        tracing::trace!(table = table.name(), key = %key, removed, "Row deleted");
        Ok(())
    }

    fn find_by_key(&self, table: &TableSchema, key: EntityKey) -> Result<Option<Row>> {
        let mut data = self.inner.borrow_mut();
        data.stats.finds += 1;
        Ok(data
            .tables
            .get(table.name())
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let parsed = parse_select(sql, params)?;
        self.inner.borrow_mut().stats.queries += 1;
        if parsed.projection == Projection::Count {
            let count = self.select(&parsed).len();
            return Ok(vec![Row::from_pairs([("COUNT(*)", count_value(count))])]);
        }
        let rows = self.select(&parsed);
        tracing::debug!(table = %parsed.table, rows = rows.len(), "Query executed");
        Ok(rows)
    }

    fn execute_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        let parsed = parse_select(sql, params)?;
        self.inner.borrow_mut().stats.queries += 1;
        let rows = self.select(&parsed);
        if parsed.projection == Projection::Count {
            return Ok(Some(count_value(rows.len())));
        }
        Ok(rows.first().and_then(|r| r.get(0)).cloned())
    }

    fn begin(&mut self) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        if data.snapshot.is_some() {
            return Err(transaction_error("transaction already open"));
        }
        data.snapshot = Some(data.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        if data.snapshot.take().is_none() {
            return Err(transaction_error("commit without an open transaction"));
        }
        data.stats.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let mut data = self.inner.borrow_mut();
        let snapshot = data
            .snapshot
            .take()
            .ok_or_else(|| transaction_error("rollback without an open transaction"))?;
        data.tables = snapshot;
        data.stats.rollbacks += 1;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.inner.borrow().snapshot.is_some()
    }
}

fn count_value(count: usize) -> Value {
    Value::BigInt(i64::try_from(count).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitrack_core::ColumnInfo;
    use entitrack_query::{OrderBy, Select};

    fn roles() -> TableSchema {
        TableSchema::new(
            "user_roles",
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("user_id").nullable(true),
                ColumnInfo::new("role_name"),
            ],
        )
    }

    fn role(owner: Option<EntityKey>, name: &str) -> (EntityKey, Row) {
        let key = EntityKey::new();
        let row = Row::from_pairs([
            ("id", Value::from(key)),
            ("user_id", Value::from(owner)),
            ("role_name", Value::from(name)),
        ]);
        (key, row)
    }

    #[test]
    fn upsert_find_and_delete() {
        let mut store = MemoryStore::new();
        let table = roles();
        let (key, row) = role(None, "admin");

        store.insert_or_replace(&table, &row).unwrap();
        store.insert_or_replace(&table, &row).unwrap();
        assert_eq!(store.row_count("user_roles"), 1);

        let found = store.find_by_key(&table, key).unwrap().unwrap();
        assert_eq!(found.get_named::<String>("role_name").unwrap(), "admin");

        store.delete(&table, key).unwrap();
        assert!(store.find_by_key(&table, key).unwrap().is_none());
        store.delete(&table, key).unwrap();

        let stats = store.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.deletes, 2);
        assert_eq!(stats.finds, 2);
    }

    #[test]
    fn query_filters_orders_and_counts() {
        let mut store = MemoryStore::new();
        let table = roles();
        let owner = EntityKey::new();
        for (o, name) in [(Some(owner), "b"), (None, "x"), (Some(owner), "a")] {
            let (_, row) = role(o, name);
            store.insert_or_replace(&table, &row).unwrap();
        }

        let (sql, params) = Select::projection(&table, false)
            .filter_eq("user_id", owner)
            .order_by(OrderBy::asc("role_name"))
            .build();
        let rows = store.query(&sql, &params).unwrap();
        let names: Vec<String> = rows
            .iter()
            .map(|r| r.get_named::<String>("role_name").unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(Arc::ptr_eq(&rows[0].column_info(), &rows[1].column_info()));
        assert_eq!(
            rows[0].column_names().collect::<Vec<_>>(),
            vec!["id", "user_id", "role_name"]
        );

        let (sql, params) = Select::new("user_roles").is_null("user_id").build_count();
        assert_eq!(
            store.execute_scalar(&sql, &params).unwrap(),
            Some(Value::BigInt(1))
        );

        let (sql, params) = Select::new("nothing_here").build();
        assert!(store.query(&sql, &params).unwrap().is_empty());
    }

    #[test]
    fn rollback_restores_snapshot() {
        let mut store = MemoryStore::new();
        let table = roles();
        let (kept, row) = role(None, "kept");
        store.insert_or_replace(&table, &row).unwrap();

        store.begin().unwrap();
        assert!(store.begin().is_err());
        let (_, other) = role(None, "temp");
        store.insert_or_replace(&table, &other).unwrap();
        store.delete(&table, kept).unwrap();
        store.rollback().unwrap();

        assert!(!store.in_transaction());
        assert_eq!(store.row_count("user_roles"), 1);
        assert!(store.get_row("user_roles", kept).is_some());
        assert!(store.commit().is_err());
    }

    #[test]
    fn injected_failures_hit_after_n_writes() {
        let mut store = MemoryStore::new();
        let table = roles();
        store.fail_after_writes(1);

        let (_, first) = role(None, "first");
        store.insert_or_replace(&table, &first).unwrap();
        let (_, second) = role(None, "second");
        let err = store.insert_or_replace(&table, &second).unwrap_err();
        assert!(err.is_storage_error());

        store.clear_failures();
        store.insert_or_replace(&table, &second).unwrap();
        assert_eq!(store.row_count("user_roles"), 2);
    }

    #[test]
    fn clones_share_data() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        let (key, row) = role(None, "shared");
        store.insert_or_replace(&roles(), &row).unwrap();
        assert!(observer.get_row("user_roles", key).is_some());
    }
}
