//! SQL clause types (WHERE, ORDER BY, LIMIT).

use entitrack_core::Value;

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::NotEq => "<>",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }

    /// Parse the SQL spelling of an operator.
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" => Comparison::Eq,
            "<>" | "!=" => Comparison::NotEq,
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            _ => return None,
        })
    }
}

/// One predicate of a WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column <op> ?`
    Compare {
        column: String,
        op: Comparison,
        value: Value,
    },
    /// `column IS NULL`
    IsNull(String),
    /// `column IS NOT NULL`
    IsNotNull(String),
}

impl Condition {
    pub fn column(&self) -> &str {
        match self {
            Condition::Compare { column, .. }
            | Condition::IsNull(column)
            | Condition::IsNotNull(column) => column,
        }
    }

    fn build(&self, params: &mut Vec<Value>) -> String {
        match self {
            Condition::Compare { column, op, value } => {
                params.push(value.clone());
                format!("{} {} ?", column, op.as_sql())
            }
            Condition::IsNull(column) => format!("{} IS NULL", column),
            Condition::IsNotNull(column) => format!("{} IS NOT NULL", column),
        }
    }
}

/// WHERE clause: a conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where {
    conditions: Vec<Condition>,
}

impl Where {
    pub fn new(condition: Condition) -> Self {
        Self {
            conditions: vec![condition],
        }
    }

    /// Add an AND condition.
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Build the clause body (without `WHERE`) and its parameters.
    pub fn build(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self
            .conditions
            .iter()
            .map(|c| c.build(&mut params))
            .collect::<Vec<_>>()
            .join(" AND ");
        (sql, params)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Generate SQL for this ORDER BY clause.
    pub fn to_sql(&self) -> String {
        match self.direction {
            OrderDirection::Asc => format!("{} ASC", self.column),
            OrderDirection::Desc => format!("{} DESC", self.column),
        }
    }
}

/// LIMIT clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(pub u64);

/// OFFSET clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset(pub u64);
