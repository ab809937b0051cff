//! Expression evaluation over in-memory rows.
//!
//! Predicates use three-valued logic: a comparison with NULL yields NULL,
//! and a filter keeps a row only when its predicate is exactly TRUE.

use std::cmp::Ordering;

use folio_core::error::{Error, QueryError, QueryErrorKind, Result};
use folio_core::validate::cached_regex;
use folio_core::{AggregateFunc, BinaryOp, Expr, Func, UnaryOp, Value};

/// Qualified column names of a row being evaluated: `(alias, column)`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Layout {
    columns: Vec<(String, String)>,
}

impl Layout {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append the columns of one source under `alias`.
    pub(crate) fn push_source<S: AsRef<str>>(&mut self, alias: &str, columns: &[S]) {
        self.columns
            .extend(columns.iter().map(|c| (alias.to_string(), c.as_ref().to_string())));
    }

    pub(crate) fn len(&self) -> usize {
        self.columns.len()
    }

    /// Column names belonging to `alias`, in order, with their positions.
    pub(crate) fn source_columns(&self, alias: &str) -> Vec<(usize, &str)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, (a, _))| a == alias)
            .map(|(i, (_, c))| (i, c.as_str()))
            .collect()
    }

    fn resolve(&self, table: Option<&str>, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|(a, c)| c == name && table.is_none_or(|t| t == a))
            .ok_or_else(|| {
                let shown = match table {
                    Some(t) => format!("{t}.{name}"),
                    None => name.to_string(),
                };
                Error::Query(QueryError {
                    kind: QueryErrorKind::NotFound,
                    sql: None,
                    message: format!("no such column: {shown}"),
                })
            })
    }
}

fn type_mismatch(op: &str, left: &Value, right: &Value) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: None,
        message: format!(
            "cannot apply {op} to {} and {}",
            left.type_name(),
            right.type_name()
        ),
    })
}

/// Is this predicate value TRUE?
pub(crate) fn is_true(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

/// Evaluate an expression against one row.
pub(crate) fn eval(expr: &Expr, layout: &Layout, row: &[Value]) -> Result<Value> {
    match expr {
        Expr::Column { table, name } => {
            let index = layout.resolve(table.as_deref(), name)?;
            Ok(row.get(index).cloned().unwrap_or(Value::Null))
        }
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Binary { left, op, right } => {
            let l = eval(left, layout, row)?;
            // AND/OR short-circuit on a decided left side
            match (op, &l) {
                (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let r = eval(right, layout, row)?;
            binary(*op, &l, &r)
        }
        Expr::Unary { op, expr } => {
            let v = eval(expr, layout, row)?;
            unary(*op, &v)
        }
        Expr::Function { func, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, layout, row))
                .collect::<Result<Vec<_>>>()?;
            function(*func, &values)
        }
        Expr::Aggregate { .. } => Err(Error::unsupported(
            "aggregate used outside an aggregated select",
        )),
        Expr::In {
            expr,
            values,
            negated,
        } => {
            let needle = eval(expr, layout, row)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for candidate in values {
                let candidate = eval(candidate, layout, row)?;
                match needle.compare(&candidate) {
                    Some(Ordering::Equal) => return Ok(Value::Bool(!negated)),
                    None if candidate.is_null() => saw_null = true,
                    _ => {}
                }
            }
            Ok(if saw_null {
                Value::Null
            } else {
                Value::Bool(*negated)
            })
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval(expr, layout, row)?;
            let lo = eval(low, layout, row)?;
            let hi = eval(high, layout, row)?;
            let inside = and3(
                &compare(BinaryOp::Ge, &v, &lo),
                &compare(BinaryOp::Le, &v, &hi),
            );
            Ok(if *negated { not3(&inside) } else { inside })
        }
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, layout, row)?;
            Ok(Value::Bool(v.is_null() != *negated))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
            case_insensitive,
        } => {
            let v = eval(expr, layout, row)?;
            let Some(text) = text_of(&v) else {
                return Ok(Value::Null);
            };
            let matched = like(&text, pattern, *case_insensitive)?;
            Ok(Value::Bool(matched != *negated))
        }
    }
}

/// Evaluate an expression over a group of rows, computing aggregates.
///
/// Non-aggregate parts of the expression are taken from the first row.
pub(crate) fn eval_group(expr: &Expr, layout: &Layout, rows: &[Vec<Value>]) -> Result<Value> {
    match expr {
        Expr::Aggregate { func, arg } => aggregate(*func, arg.as_deref(), layout, rows),
        Expr::Binary { left, op, right } if expr.is_aggregate() => {
            let l = eval_group(left, layout, rows)?;
            let r = eval_group(right, layout, rows)?;
            binary(*op, &l, &r)
        }
        Expr::Unary { op, expr: inner } if expr.is_aggregate() => {
            unary(*op, &eval_group(inner, layout, rows)?)
        }
        Expr::Function { func, args } if expr.is_aggregate() => {
            let values = args
                .iter()
                .map(|a| eval_group(a, layout, rows))
                .collect::<Result<Vec<_>>>()?;
            function(*func, &values)
        }
        _ => match rows.first() {
            Some(row) => eval(expr, layout, row),
            None => Ok(Value::Null),
        },
    }
}

fn aggregate(
    func: AggregateFunc,
    arg: Option<&Expr>,
    layout: &Layout,
    rows: &[Vec<Value>],
) -> Result<Value> {
    let Some(arg) = arg else {
        return Ok(Value::BigInt(rows.len() as i64));
    };
    let values = rows
        .iter()
        .map(|row| eval(arg, layout, row))
        .filter(|v| !matches!(v, Ok(Value::Null)))
        .collect::<Result<Vec<_>>>()?;

    match func {
        AggregateFunc::Count => Ok(Value::BigInt(values.len() as i64)),
        AggregateFunc::Min => Ok(values
            .into_iter()
            .min_by(Value::sort_cmp)
            .unwrap_or(Value::Null)),
        AggregateFunc::Max => Ok(values
            .into_iter()
            .max_by(Value::sort_cmp)
            .unwrap_or(Value::Null)),
        AggregateFunc::Sum => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            values
                .iter()
                .skip(1)
                .try_fold(values[0].clone(), |acc, v| arithmetic(BinaryOp::Add, &acc, v))
        }
        AggregateFunc::Avg => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let mut total = 0.0;
            for v in &values {
                total += v.as_f64().ok_or_else(|| type_mismatch("AVG", v, v))?;
            }
            Ok(Value::Double(total / values.len() as f64))
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::And => Ok(and3(l, r)),
        BinaryOp::Or => Ok(not3(&and3(&not3(l), &not3(r)))),
        op if op.is_comparison() => Ok(compare(op, l, r)),
        BinaryOp::Concat => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            match (text_of(l), text_of(r)) {
                (Some(a), Some(b)) => Ok(Value::Text(a + &b)),
                _ => Err(type_mismatch("||", l, r)),
            }
        }
        op => arithmetic(op, l, r),
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Value {
    let Some(ord) = l.compare(r) else {
        return Value::Null;
    };
    Value::Bool(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Ne => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Le => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::Ge => ord != Ordering::Less,
        _ => false,
    })
}

fn and3(l: &Value, r: &Value) -> Value {
    match (l.as_bool(), r.as_bool()) {
        (Some(false), _) | (_, Some(false)) => Value::Bool(false),
        (Some(true), Some(true)) => Value::Bool(true),
        _ => Value::Null,
    }
}

fn not3(v: &Value) -> Value {
    match v.as_bool() {
        Some(b) => Value::Bool(!b),
        None => Value::Null,
    }
}

fn unary(op: UnaryOp, v: &Value) -> Result<Value> {
    match op {
        UnaryOp::Not => Ok(not3(v)),
        UnaryOp::Neg => match v {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::BigInt(i) => Ok(Value::BigInt(-i)),
            Value::Double(d) => Ok(Value::Double(-d)),
            Value::Decimal(s) => Ok(Value::Decimal(match s.strip_prefix('-') {
                Some(abs) => abs.to_string(),
                None => format!("-{s}"),
            })),
            other => Err(type_mismatch("-", other, other)),
        },
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if let (Some(a), Some(b), false, false) = (
        l.as_i64(),
        r.as_i64(),
        matches!(l, Value::Timestamp(_) | Value::Bool(_)),
        matches!(r, Value::Bool(_)),
    ) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div if b == 0 => return Ok(Value::Null),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Mod if b == 0 => return Ok(Value::Null),
            BinaryOp::Mod => a.checked_rem(b),
            _ => None,
        };
        return result
            .map(Value::BigInt)
            .ok_or_else(|| type_mismatch(op.as_str(), l, r));
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(type_mismatch(op.as_str(), l, r));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Ok(Value::Null),
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        _ => return Err(type_mismatch(op.as_str(), l, r)),
    };
    Ok(Value::Double(result))
}

fn function(func: Func, args: &[Value]) -> Result<Value> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    match func {
        Func::Lower | Func::Upper | Func::Length if first.is_null() => Ok(Value::Null),
        Func::Lower => Ok(Value::Text(
            text_of(&first).unwrap_or_default().to_lowercase(),
        )),
        Func::Upper => Ok(Value::Text(
            text_of(&first).unwrap_or_default().to_uppercase(),
        )),
        Func::Length => Ok(Value::BigInt(
            text_of(&first).unwrap_or_default().chars().count() as i64,
        )),
        Func::Coalesce => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        Func::Least => Ok(args
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        Func::Greatest => Ok(args
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        Func::Abs => match &first {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::BigInt(i) => Ok(Value::BigInt(i.abs())),
            Value::Double(d) => Ok(Value::Double(d.abs())),
            Value::Decimal(s) => Ok(Value::Decimal(s.trim_start_matches('-').to_string())),
            other => Err(type_mismatch("ABS", other, other)),
        },
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Default | Value::Bytes(_) => None,
        Value::Text(s) | Value::Decimal(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::BigInt(i) | Value::Timestamp(i) => Some(i.to_string()),
        Value::Double(d) => Some(d.to_string()),
    }
}

/// Match SQL LIKE: `%` is any run, `_` any single character.
fn like(text: &str, pattern: &str, case_insensitive: bool) -> Result<bool> {
    let mut re = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        re.push_str("(?i)");
    }
    re.push_str("(?s)^");
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    re.push('$');
    let regex = cached_regex(&re).map_err(|e| Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: None,
        message: format!("invalid LIKE pattern '{pattern}': {e}"),
    }))?;
    Ok(regex.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        let mut layout = Layout::new();
        layout.push_source("b", &["id", "title", "price"]);
        layout.push_source("g", &["id", "name"]);
        layout
    }

    fn row() -> Vec<Value> {
        vec![
            Value::BigInt(1),
            Value::Text("Dune".into()),
            Value::Decimal("9.50".into()),
            Value::Null,
            Value::Null,
        ]
    }

    #[test]
    fn qualified_and_unqualified_columns() {
        let layout = layout();
        let row = row();
        assert_eq!(
            eval(&Expr::qualified("g", "id"), &layout, &row).unwrap(),
            Value::Null
        );
        assert_eq!(eval(&Expr::col("id"), &layout, &row).unwrap(), Value::BigInt(1));
        assert!(eval(&Expr::col("nope"), &layout, &row).is_err());
    }

    #[test]
    fn three_valued_logic() {
        let layout = layout();
        let row = row();
        let unknown = Expr::qualified("g", "name").eq("x");
        assert_eq!(eval(&unknown, &layout, &row).unwrap(), Value::Null);
        assert_eq!(
            eval(&unknown.clone().or(Expr::col("title").eq("Dune")), &layout, &row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(&unknown.clone().and(Expr::lit(false)), &layout, &row).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(eval(&unknown.not(), &layout, &row).unwrap(), Value::Null);
    }

    #[test]
    fn like_and_membership() {
        let layout = layout();
        let row = row();
        let check = |e: Expr| eval(&e, &layout, &row).unwrap();
        assert_eq!(check(Expr::col("title").starts_with("Du")), Value::Bool(true));
        assert_eq!(check(Expr::col("title").like("D_ne")), Value::Bool(true));
        assert_eq!(check(Expr::col("title").like("d%")), Value::Bool(false));
        assert_eq!(check(Expr::col("title").ilike("d%")), Value::Bool(true));
        assert_eq!(check(Expr::col("title").contains("u.")), Value::Bool(false));
        assert_eq!(check(Expr::col("id").in_list(vec![3, 1])), Value::Bool(true));
        assert_eq!(
            check(Expr::col("id").in_list(vec![Expr::lit(3), Expr::null()])),
            Value::Null
        );
        assert_eq!(check(Expr::col("price").between(9, 10)), Value::Bool(true));
    }

    #[test]
    fn arithmetic_and_functions() {
        let layout = layout();
        let row = row();
        let check = |e: Expr| eval(&e, &layout, &row).unwrap();
        assert_eq!(check(Expr::col("id").add(41)), Value::BigInt(42));
        assert_eq!(check(Expr::col("price").mul(2)), Value::Double(19.0));
        assert_eq!(check(Expr::col("id").div(0)), Value::Null);
        assert_eq!(
            check(Expr::col("title").concat(" (Updated)")),
            Value::Text("Dune (Updated)".into())
        );
        assert_eq!(check(Expr::col("title").upper()), Value::Text("DUNE".into()));
        assert_eq!(check(Expr::col("title").length()), Value::BigInt(4));
        assert_eq!(
            check(Expr::qualified("g", "name").coalesce("none")),
            Value::Text("none".into())
        );
        assert_eq!(
            check(Expr::greatest(vec![Expr::lit(3), Expr::null(), Expr::lit(8)])),
            Value::BigInt(8)
        );
    }

    #[test]
    fn aggregates_over_groups() {
        let mut layout = Layout::new();
        layout.push_source("t", &["n"]);
        let rows = vec![
            vec![Value::BigInt(4)],
            vec![Value::Null],
            vec![Value::BigInt(2)],
        ];
        let check = |e: Expr| eval_group(&e, &layout, &rows).unwrap();
        assert_eq!(check(Expr::count_star()), Value::BigInt(3));
        assert_eq!(check(Expr::col("n").count()), Value::BigInt(2));
        assert_eq!(check(Expr::col("n").sum()), Value::BigInt(6));
        assert_eq!(check(Expr::col("n").avg()), Value::Double(3.0));
        assert_eq!(check(Expr::col("n").min()), Value::BigInt(2));
        assert_eq!(check(Expr::col("n").max().add(1)), Value::BigInt(5));
        assert_eq!(
            eval_group(&Expr::col("n").sum(), &layout, &[]).unwrap(),
            Value::Null
        );
    }
}
