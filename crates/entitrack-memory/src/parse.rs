//! Adapter from `sqlparser` ASTs to the SELECT subset emitted by
//! `entitrack-query`.
//!
//! Supported shape:
//!
//! ```text
//! SELECT (* | COUNT(*) | col[, col]*) FROM table
//!   [WHERE cond [AND cond]*]
//!   [ORDER BY col [ASC|DESC][, ...]]
//!   [LIMIT n] [OFFSET n]
//!
//! cond := col (= | <> | != | < | <= | > | >=) ? | col IS [NOT] NULL
//! ```
//!
//! Statements are parsed with the SQLite dialect, which reads `?` as a
//! positional placeholder. Placeholders are bound to `params` in the order
//! they appear.

use entitrack_core::{Error, Result, StorageError, StorageErrorKind, Value};
use entitrack_query::{Comparison, Condition, OrderBy, OrderDirection};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::slice;

/// What a parsed statement returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Count,
    Columns(Vec<String>),
}

/// A parsed SELECT with its parameters bound.
#[derive(Debug, Clone)]
pub struct ParsedSelect {
    pub table: String,
    pub projection: Projection,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

fn syntax(message: impl Into<String>, sql: &str) -> Error {
    Error::Storage(
        StorageError {
            kind: StorageErrorKind::Syntax,
            message: message.into(),
            sql: None,
            source: None,
        }
        .with_sql(sql),
    )
}

/// Parse `sql` and bind `params` to its placeholders.
pub fn parse_select(sql: &str, params: &[Value]) -> Result<ParsedSelect> {
    let mut statements =
        Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|e| syntax(e.to_string(), sql))?;
    if statements.len() != 1 {
        return Err(syntax("expected exactly one statement", sql));
    }
    let sql_ast::Statement::Query(query) = statements.remove(0) else {
        return Err(syntax("unsupported statement", sql));
    };
    SelectAdapter {
        sql,
        params: params.iter(),
    }
    .convert_query(*query)
}

struct SelectAdapter<'a> {
    sql: &'a str,
    params: slice::Iter<'a, Value>,
}

impl SelectAdapter<'_> {
    fn error(&self, message: impl Into<String>) -> Error {
        syntax(message, self.sql)
    }

    fn convert_query(mut self, query: sql_ast::Query) -> Result<ParsedSelect> {
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(self.error("only plain SELECT queries are supported"));
        };
        let select = *select;

        let table = match select.from.as_slice() {
            [from] if from.joins.is_empty() => match &from.relation {
                sql_ast::TableFactor::Table { name, .. } => self.table_name(name)?,
                other => return Err(self.error(format!("unsupported FROM item '{}'", other))),
            },
            _ => return Err(self.error("expected a single table in FROM")),
        };

        let projection = self.convert_projection(&select.projection)?;

        let mut conditions = Vec::new();
        if let Some(selection) = select.selection {
            self.convert_where(selection, &mut conditions)?;
        }
        if self.params.next().is_some() {
            return Err(self.error("too many parameters"));
        }

        let order_by = self.convert_order_by(query.order_by)?;
        let (limit, offset) = self.convert_limit_clause(query.limit_clause)?;

        Ok(ParsedSelect {
            table,
            projection,
            conditions,
            order_by,
            limit,
            offset: offset.unwrap_or(0),
        })
    }

    fn table_name(&self, name: &sql_ast::ObjectName) -> Result<String> {
        match name.0.as_slice() {
            [part] => Ok(part.to_string()),
            _ => Err(self.error(format!("unsupported table name '{}'", name))),
        }
    }

    fn convert_projection(&self, items: &[sql_ast::SelectItem]) -> Result<Projection> {
        match items {
            [sql_ast::SelectItem::Wildcard(_)] => return Ok(Projection::All),
            [item] if item.to_string().eq_ignore_ascii_case("COUNT(*)") => {
                return Ok(Projection::Count);
            }
            _ => {}
        }
        items
            .iter()
            .map(|item| match item {
                sql_ast::SelectItem::UnnamedExpr(sql_ast::Expr::Identifier(ident)) => {
                    Ok(ident.value.clone())
                }
                other => Err(self.error(format!("unsupported column expression '{}'", other))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Projection::Columns)
    }

    /// Flatten an AND tree into conditions, binding placeholders left to right.
    fn convert_where(&mut self, expr: sql_ast::Expr, out: &mut Vec<Condition>) -> Result<()> {
        match expr {
            sql_ast::Expr::Nested(inner) => self.convert_where(*inner, out),
            sql_ast::Expr::BinaryOp {
                left,
                op: sql_ast::BinaryOperator::And,
                right,
            } => {
                self.convert_where(*left, out)?;
                self.convert_where(*right, out)
            }
            sql_ast::Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    sql_ast::BinaryOperator::Eq => Comparison::Eq,
                    sql_ast::BinaryOperator::NotEq => Comparison::NotEq,
                    sql_ast::BinaryOperator::Lt => Comparison::Lt,
                    sql_ast::BinaryOperator::LtEq => Comparison::Le,
                    sql_ast::BinaryOperator::Gt => Comparison::Gt,
                    sql_ast::BinaryOperator::GtEq => Comparison::Ge,
                    other => return Err(self.error(format!("unsupported operator '{}'", other))),
                };
                let column = self.column(&left)?;
                if !is_placeholder(&right) {
                    return Err(self.error(format!("expected a placeholder, found '{}'", right)));
                }
                let value = self
                    .params
                    .next()
                    .cloned()
                    .ok_or_else(|| self.error("not enough parameters"))?;
                out.push(Condition::Compare { column, op, value });
                Ok(())
            }
            sql_ast::Expr::IsNull(inner) => {
                out.push(Condition::IsNull(self.column(&inner)?));
                Ok(())
            }
            sql_ast::Expr::IsNotNull(inner) => {
                out.push(Condition::IsNotNull(self.column(&inner)?));
                Ok(())
            }
            other => Err(self.error(format!("unsupported condition '{}'", other))),
        }
    }

    fn column(&self, expr: &sql_ast::Expr) -> Result<String> {
        match expr {
            sql_ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
            other => Err(self.error(format!("expected a column, found '{}'", other))),
        }
    }

    fn convert_order_by(&self, order_by: Option<sql_ast::OrderBy>) -> Result<Vec<OrderBy>> {
        let Some(order_by) = order_by else {
            return Ok(Vec::new());
        };
        let sql_ast::OrderByKind::Expressions(exprs) = order_by.kind else {
            return Err(self.error("ORDER BY ALL is not supported"));
        };
        exprs
            .into_iter()
            .map(|item| {
                let descending = item.options.asc == Some(false);
                Ok(OrderBy {
                    column: self.column(&item.expr)?,
                    direction: if descending {
                        OrderDirection::Desc
                    } else {
                        OrderDirection::Asc
                    },
                })
            })
            .collect()
    }

    fn convert_limit_clause(
        &self,
        clause: Option<sql_ast::LimitClause>,
    ) -> Result<(Option<usize>, Option<usize>)> {
        match clause {
            None => Ok((None, None)),
            Some(sql_ast::LimitClause::LimitOffset { limit, offset, .. }) => {
                let limit = limit.map(|e| self.number(&e, "LIMIT")).transpose()?;
                let offset = offset.map(|o| self.number(&o.value, "OFFSET")).transpose()?;
                Ok((limit, offset))
            }
            Some(sql_ast::LimitClause::OffsetCommaLimit { offset, limit, .. }) => Ok((
                Some(self.number(&limit, "LIMIT")?),
                Some(self.number(&offset, "OFFSET")?),
            )),
        }
    }

    fn number(&self, expr: &sql_ast::Expr, clause: &str) -> Result<usize> {
        if let sql_ast::Expr::Value(v) = expr {
            if let sql_ast::Value::Number(n, _) = &v.value {
                return n
                    .parse::<usize>()
                    .map_err(|_| self.error(format!("invalid {} '{}'", clause, n)));
            }
        }
        Err(self.error(format!("only numeric {} is supported", clause)))
    }
}

fn is_placeholder(expr: &sql_ast::Expr) -> bool {
    matches!(expr, sql_ast::Expr::Value(v) if matches!(v.value, sql_ast::Value::Placeholder(_)))
}
