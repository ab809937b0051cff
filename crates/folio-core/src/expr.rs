//! Predicate and value expressions.
//!
//! Expressions are plain data: the query layer builds them, the store
//! evaluates them, and the SQL renderer prints them. Nothing here executes.

use crate::value::Value;

/// An expression usable in filters, projections, setters and ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference with optional table alias
    Column {
        /// Optional table alias
        table: Option<String>,
        /// Column name
        name: String,
    },

    /// Literal value
    Literal(Value),

    /// Binary operation (e.g., a = b, a + b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation (e.g., NOT a, -a)
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Scalar function call
    Function { func: Func, args: Vec<Expr> },

    /// Aggregate over the filtered row set; `arg: None` is COUNT(*)
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
    },

    /// IN expression
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// BETWEEN expression
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE / NOT LIKE pattern (`%` and `_` wildcards)
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
        case_insensitive: bool,
    },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// String concatenation (||)
    Concat,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "||",
        }
    }

    /// Get the precedence of this operator (higher = binds tighter).
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Concat => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
        }
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Scalar functions every store must evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Lower,
    Upper,
    Length,
    Coalesce,
    /// Smallest non-NULL argument
    Least,
    /// Largest non-NULL argument
    Greatest,
    Abs,
}

impl Func {
    pub const fn as_str(self) -> &'static str {
        match self {
            Func::Lower => "LOWER",
            Func::Upper => "UPPER",
            Func::Length => "LENGTH",
            Func::Coalesce => "COALESCE",
            Func::Least => "LEAST",
            Func::Greatest => "GREATEST",
            Func::Abs => "ABS",
        }
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub const fn as_str(self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

impl Expr {
    /// Create a column reference expression.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Create a qualified column reference (alias.column).
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    /// Create a literal value expression.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Create a NULL literal.
    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    // ==================== Comparison Operators ====================

    /// Equal to (=)
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    /// Not equal to (<>)
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    /// Less than (<)
    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    /// Less than or equal to (<=)
    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    /// Greater than (>)
    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    /// Greater than or equal to (>=)
    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    /// Apply an arbitrary comparison operator.
    pub fn compare(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        self.binary(op, other)
    }

    // ==================== Logical Operators ====================

    /// Logical AND
    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    /// Logical OR
    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    /// Logical NOT
    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    /// AND together an optional left side and a right side.
    pub fn and_opt(left: Option<Expr>, right: Expr) -> Expr {
        match left {
            Some(left) => left.and(right),
            None => right,
        }
    }

    // ==================== Null Checks ====================

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    // ==================== Pattern Matching ====================

    /// LIKE pattern
    pub fn like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
            case_insensitive: false,
        }
    }

    /// Case-insensitive LIKE pattern
    pub fn ilike(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
            case_insensitive: true,
        }
    }

    /// Check if column contains the given substring (LIKE '%pattern%').
    pub fn contains(self, pattern: impl AsRef<str>) -> Self {
        self.like(format!("%{}%", pattern.as_ref()))
    }

    /// Check if column starts with the given prefix (LIKE 'pattern%').
    pub fn starts_with(self, pattern: impl AsRef<str>) -> Self {
        self.like(format!("{}%", pattern.as_ref()))
    }

    /// Check if column ends with the given suffix (LIKE '%pattern').
    pub fn ends_with(self, pattern: impl AsRef<str>) -> Self {
        self.like(format!("%{}", pattern.as_ref()))
    }

    // ==================== Membership ====================

    pub fn in_list(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in_list(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: false,
        }
    }

    // ==================== Arithmetic ====================

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    /// String concatenation (||)
    pub fn concat(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Concat, other)
    }

    // ==================== Functions ====================

    pub fn function(func: Func, args: Vec<Expr>) -> Self {
        Expr::Function { func, args }
    }

    pub fn lower(self) -> Self {
        Expr::function(Func::Lower, vec![self])
    }

    pub fn upper(self) -> Self {
        Expr::function(Func::Upper, vec![self])
    }

    pub fn length(self) -> Self {
        Expr::function(Func::Length, vec![self])
    }

    pub fn coalesce(self, fallback: impl Into<Expr>) -> Self {
        Expr::function(Func::Coalesce, vec![self, fallback.into()])
    }

    /// Smallest of the given expressions, ignoring NULLs.
    pub fn least(args: Vec<Expr>) -> Self {
        Expr::function(Func::Least, args)
    }

    /// Largest of the given expressions, ignoring NULLs.
    pub fn greatest(args: Vec<Expr>) -> Self {
        Expr::function(Func::Greatest, args)
    }

    // ==================== Aggregates ====================

    pub fn count_star() -> Self {
        Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
        }
    }

    fn aggregate(self, func: AggregateFunc) -> Self {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(self)),
        }
    }

    pub fn count(self) -> Self {
        self.aggregate(AggregateFunc::Count)
    }

    pub fn sum(self) -> Self {
        self.aggregate(AggregateFunc::Sum)
    }

    pub fn avg(self) -> Self {
        self.aggregate(AggregateFunc::Avg)
    }

    pub fn min(self) -> Self {
        self.aggregate(AggregateFunc::Min)
    }

    pub fn max(self) -> Self {
        self.aggregate(AggregateFunc::Max)
    }

    // ==================== Inspection ====================

    /// Does this expression contain an aggregate anywhere?
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Column { .. } | Expr::Literal(_) => false,
            Expr::Binary { left, right, .. } => left.is_aggregate() || right.is_aggregate(),
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Like { expr, .. } => {
                expr.is_aggregate()
            }
            Expr::Function { args, .. } => args.iter().any(Expr::is_aggregate),
            Expr::In { expr, values, .. } => {
                expr.is_aggregate() || values.iter().any(Expr::is_aggregate)
            }
            Expr::Between {
                expr, low, high, ..
            } => expr.is_aggregate() || low.is_aggregate() || high.is_aggregate(),
        }
    }

    /// Collect every column name referenced by this expression.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column { name, .. } => out.push(name),
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Like { expr, .. } => {
                expr.collect_columns(out);
            }
            Expr::Function { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_columns(out);
                }
            }
            Expr::In { expr, values, .. } => {
                expr.collect_columns(out);
                values.iter().for_each(|v| v.collect_columns(out));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
        }
    }

    /// Qualify every unqualified column with the given alias.
    pub fn qualify(self, alias: &str) -> Expr {
        let q = |e: Box<Expr>| Box::new(e.qualify(alias));
        match self {
            Expr::Column { table: None, name } => Expr::Column {
                table: Some(alias.to_string()),
                name,
            },
            other @ (Expr::Column { .. } | Expr::Literal(_)) => other,
            Expr::Binary { left, op, right } => Expr::Binary {
                left: q(left),
                op,
                right: q(right),
            },
            Expr::Unary { op, expr } => Expr::Unary { op, expr: q(expr) },
            Expr::Function { func, args } => Expr::Function {
                func,
                args: args.into_iter().map(|a| a.qualify(alias)).collect(),
            },
            Expr::Aggregate { func, arg } => Expr::Aggregate {
                func,
                arg: arg.map(q),
            },
            Expr::In {
                expr,
                values,
                negated,
            } => Expr::In {
                expr: q(expr),
                values: values.into_iter().map(|v| v.qualify(alias)).collect(),
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: q(expr),
                low: q(low),
                high: q(high),
                negated,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: q(expr),
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => Expr::Like {
                expr: q(expr),
                pattern,
                negated,
                case_insensitive,
            },
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(Value::Text(value.to_string()))
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Literal(Value::Text(value))
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Literal(Value::Int(value))
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Literal(Value::BigInt(value))
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Literal(Value::Double(value))
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Literal(Value::Bool(value))
    }
}

/// Shorthand for [`Expr::col`].
pub fn col(name: impl Into<String>) -> Expr {
    Expr::col(name)
}

/// Shorthand for [`Expr::lit`].
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::lit(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_leaves_qualified_columns_alone() {
        let expr = col("title")
            .eq("Dune")
            .and(Expr::qualified("t1", "name").is_not_null());
        let qualified = expr.qualify("t0");

        assert_eq!(
            qualified,
            Expr::qualified("t0", "title")
                .eq("Dune")
                .and(Expr::qualified("t1", "name").is_not_null())
        );
    }

    #[test]
    fn aggregate_detection_and_column_listing() {
        let expr = col("price").sum().add(lit(1));
        assert!(expr.is_aggregate());
        assert!(!col("price").gt(10).is_aggregate());

        let filter = col("a").eq(1).and(col("b").between(1, 2).or(col("c").like("x%")));
        assert_eq!(filter.columns(), vec!["a", "b", "c"]);
    }
}
