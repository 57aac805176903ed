//! SELECT query builder.

use crate::clause::{Comparison, Condition, Limit, Offset, OrderBy, Where};
use entitrack_core::{Entity, TableSchema, Value};

/// A SELECT query builder.
///
/// Column names are storage names. Parameters are positional (`?`).
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    table: String,
    /// Columns to select (empty = all)
    columns: Vec<String>,
    where_clause: Option<Where>,
    order_by: Vec<OrderBy>,
    limit: Option<Limit>,
    offset: Option<Offset>,
}

impl Select {
    /// Create a new `SELECT *` query on `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Select the default projection of a table.
    pub fn projection(table: &TableSchema, include_private: bool) -> Self {
        let columns = table
            .projection(include_private)
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            columns,
            ..Self::new(table.name())
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Select specific columns.
    pub fn columns(mut self, cols: &[&str]) -> Self {
        self.columns = cols.iter().map(|&s| s.to_string()).collect();
        self
    }

    /// Add a WHERE condition.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(condition),
            None => Where::new(condition),
        });
        self
    }

    /// `column = value`; a NULL value becomes `column IS NULL`.
    pub fn filter_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            return self.is_null(column);
        }
        self.filter(Condition::Compare {
            column: column.into(),
            op: Comparison::Eq,
            value,
        })
    }

    pub fn filter_cmp(
        self,
        column: impl Into<String>,
        op: Comparison,
        value: impl Into<Value>,
    ) -> Self {
        self.filter(Condition::Compare {
            column: column.into(),
            op,
            value: value.into(),
        })
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.filter(Condition::IsNull(column.into()))
    }

    pub fn is_not_null(self, column: impl Into<String>) -> Self {
        self.filter(Condition::IsNotNull(column.into()))
    }

    /// Add ORDER BY clause.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(Limit(n));
        self
    }

    /// Set OFFSET.
    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(Offset(n));
        self
    }

    /// Build the SQL query and parameters.
    pub fn build(&self) -> (String, Vec<Value>) {
        let mut sql = String::from("SELECT ");
        if self.columns.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.columns.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&self.table);

        let params = self.push_where(&mut sql);

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            let order_strs: Vec<_> = self.order_by.iter().map(OrderBy::to_sql).collect();
            sql.push_str(&order_strs.join(", "));
        }
        if let Some(Limit(n)) = self.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        if let Some(Offset(n)) = self.offset {
            sql.push_str(&format!(" OFFSET {}", n));
        }
        tracing::trace!(sql = %sql, params = params.len(), "Built SELECT");
        (sql, params)
    }

    /// Build a `SELECT COUNT(*)` over the same table and filters.
    ///
    /// Ordering, limit and offset are ignored.
    pub fn build_count(&self) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let params = self.push_where(&mut sql);
        (sql, params)
    }

    fn push_where(&self, sql: &mut String) -> Vec<Value> {
        match &self.where_clause {
            Some(clause) if !clause.is_empty() => {
                let (where_sql, params) = clause.build();
                sql.push_str(" WHERE ");
                sql.push_str(&where_sql);
                params
            }
            _ => Vec::new(),
        }
    }
}

/// Start a query over the default projection of `T`'s table.
pub fn select<T: Entity>() -> Select {
    Select::projection(&T::table(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitrack_core::{ColumnInfo, EntityKey};

    fn roles() -> TableSchema {
        TableSchema::new(
            "user_roles",
            vec![
                ColumnInfo::key("id"),
                ColumnInfo::new("user_id").nullable(true),
                ColumnInfo::new("role_name"),
                ColumnInfo::new("audit").private(true),
            ],
        )
    }

    #[test]
    fn test_select_all_columns() {
        let (sql, params) = Select::new("users").build();
        assert_eq!(sql, "SELECT * FROM users");
        assert!(params.is_empty());
    }

    #[test]
    fn test_projection_skips_private_columns() {
        let (sql, _) = Select::projection(&roles(), false).build();
        assert_eq!(sql, "SELECT id, user_id, role_name FROM user_roles");

        let (sql, _) = Select::projection(&roles(), true).build();
        assert_eq!(sql, "SELECT id, user_id, role_name, audit FROM user_roles");
    }

    #[test]
    fn test_collection_load_query() {
        let owner = EntityKey::new();
        let (sql, params) = Select::projection(&roles(), false)
            .filter_eq("user_id", owner)
            .order_by(OrderBy::asc("role_name"))
            .build();
        assert_eq!(
            sql,
            "SELECT id, user_id, role_name FROM user_roles WHERE user_id = ? ORDER BY role_name ASC"
        );
        assert_eq!(params, vec![Value::from(owner)]);
    }

    #[test]
    fn test_filter_eq_null_becomes_is_null() {
        let (sql, params) = Select::new("user_roles")
            .filter_eq("user_id", Value::Null)
            .build();
        assert_eq!(sql, "SELECT * FROM user_roles WHERE user_id IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_limit_offset_and_count() {
        let query = Select::new("users")
            .filter_cmp("age", Comparison::Gt, 18)
            .order_by(OrderBy::desc("age"))
            .limit(10)
            .offset(20);
        let (sql, params) = query.build();
        assert_eq!(
            sql,
            "SELECT * FROM users WHERE age > ? ORDER BY age DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(params, vec![Value::Int(18)]);

        let (count_sql, count_params) = query.build_count();
        assert_eq!(count_sql, "SELECT COUNT(*) FROM users WHERE age > ?");
        assert_eq!(count_params, vec![Value::Int(18)]);
    }
}
