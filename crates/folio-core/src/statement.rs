//! Structured statements passed to a [`Connection`](crate::Connection).
//!
//! Statements are data, not SQL text. Stores execute them directly; the query
//! crate renders them to SQL for logging and diagnostics.

use crate::expr::Expr;
use crate::row::Row;
use crate::value::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(expr: impl Into<OrderExpr>) -> Self {
        Self {
            expr: expr.into().0,
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(expr: impl Into<OrderExpr>) -> Self {
        Self {
            expr: expr.into().0,
            direction: OrderDirection::Desc,
        }
    }
}

/// Conversion helper so `OrderBy::asc("title")` names a column while
/// `OrderBy::asc(expr)` orders by an arbitrary expression.
#[derive(Debug, Clone)]
pub struct OrderExpr(pub Expr);

impl From<&str> for OrderExpr {
    fn from(column: &str) -> Self {
        OrderExpr(Expr::col(column))
    }
}

impl From<Expr> for OrderExpr {
    fn from(expr: Expr) -> Self {
        OrderExpr(expr)
    }
}

/// What a SELECT reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table { name: String, alias: String },
    /// A nested SELECT, used to page owners before joining collections
    Derived { select: Box<Select>, alias: String },
}

impl Source {
    pub fn alias(&self) -> &str {
        match self {
            Source::Table { alias, .. } | Source::Derived { alias, .. } => alias,
        }
    }
}

/// LEFT JOIN of a table onto the current source.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    pub on: Expr,
}

/// One output column with its label.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub label: String,
}

impl SelectItem {
    pub fn new(expr: Expr, label: impl Into<String>) -> Self {
        Self {
            expr,
            label: label.into(),
        }
    }
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub from: Source,
    pub joins: Vec<Join>,
    /// Output columns; empty selects every column of `from`
    pub columns: Vec<SelectItem>,
    pub filter: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn from_table(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            from: Source::Table {
                name: table.into(),
                alias: alias.into(),
            },
            joins: Vec::new(),
            columns: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn from_derived(select: Select, alias: impl Into<String>) -> Self {
        Self {
            from: Source::Derived {
                select: Box::new(select),
                alias: alias.into(),
            },
            ..Self::from_table("", "")
        }
    }

    pub fn column(mut self, expr: Expr, label: impl Into<String>) -> Self {
        self.columns.push(SelectItem::new(expr, label));
        self
    }

    pub fn left_join(mut self, table: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        self.joins.push(Join {
            table: table.into(),
            alias: alias.into(),
            on,
        });
        self
    }

    /// AND a predicate onto the filter.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(Expr::and_opt(self.filter.take(), predicate));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Does any output column aggregate the row set?
    pub fn is_aggregate(&self) -> bool {
        self.columns.iter().any(|c| c.expr.is_aggregate())
    }
}

/// An INSERT of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    /// Column/value pairs; `Value::Default` asks for the store default
    pub values: Vec<(String, Value)>,
    /// Columns whose stored values are returned (generated keys, tokens)
    pub returning: Vec<String>,
}

/// A set-based or keyed UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    /// Column assignments; the right side may reference the row's columns
    pub set: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
    pub returning: Vec<String>,
}

/// A set-based or keyed DELETE.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub filter: Option<Expr>,
}

/// Any write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert(i) => &i.table,
            Statement::Update(u) => &u.table,
            Statement::Delete(d) => &d.table,
        }
    }

    pub fn returning(&self) -> &[String] {
        match self {
            Statement::Insert(i) => &i.returning,
            Statement::Update(u) => &u.returning,
            Statement::Delete(_) => &[],
        }
    }
}

impl From<Insert> for Statement {
    fn from(stmt: Insert) -> Self {
        Statement::Insert(stmt)
    }
}

impl From<Update> for Statement {
    fn from(stmt: Update) -> Self {
        Statement::Update(stmt)
    }
}

impl From<Delete> for Statement {
    fn from(stmt: Delete) -> Self {
        Statement::Delete(stmt)
    }
}

/// Result of executing a write.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    /// One row per affected row, holding the `returning` columns
    pub returned: Vec<Row>,
}

impl ExecuteResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            returned: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_builder_accumulates_filters() {
        let select = Select::from_table("books", "t0")
            .filter(Expr::col("price").gt(10))
            .filter(Expr::col("title").starts_with("D"))
            .order_by(OrderBy::desc("title"))
            .limit(5);

        assert_eq!(
            select.filter,
            Some(
                Expr::col("price")
                    .gt(10)
                    .and(Expr::col("title").starts_with("D"))
            )
        );
        assert_eq!(select.order_by[0].direction, OrderDirection::Desc);
        assert_eq!(select.from.alias(), "t0");
        assert!(!select.is_aggregate());
        assert!(
            Select::from_table("books", "t0")
                .column(Expr::count_star(), "n")
                .is_aggregate()
        );
    }
}
