//! SQL rendering of structured statements.
//!
//! Rendering is for logs, diagnostics and DDL scripts; stores execute the
//! structured statements directly. Literals become numbered placeholders and
//! are returned alongside the SQL text.

use folio_core::{
    BinaryOp, Delete, Expr, Insert, OrderDirection, Select, Source, Statement, UnaryOp, Update,
    Value,
};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite dialect (uses ?1, ?2 placeholders)
    #[default]
    Sqlite,
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    Postgres,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
    /// SQL Server dialect (uses @p1, @p2 placeholders)
    SqlServer,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
            Dialect::SqlServer => format!("@p{index}"),
        }
    }

    /// Quote an identifier for this dialect, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
            Dialect::SqlServer => {
                let escaped = name.replace(']', "]]");
                format!("[{}]", escaped)
            }
        }
    }

    /// Check if this dialect supports ILIKE.
    pub const fn supports_ilike(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// Accumulates parameters while rendering one statement.
struct Renderer {
    dialect: Dialect,
    params: Vec<Value>,
}

impl Renderer {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn q(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn param(&mut self, value: Value) -> String {
        if matches!(value, Value::Default) {
            return "DEFAULT".to_string();
        }
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn expr(&mut self, expr: &Expr) -> String {
        self.expr_prec(expr, 0)
    }

    fn expr_prec(&mut self, expr: &Expr, parent: u8) -> String {
        match expr {
            Expr::Column { table, name } => match table {
                Some(t) => format!("{}.{}", self.q(t), self.q(name)),
                None => self.q(name),
            },

            Expr::Literal(value) => self.param(value.clone()),

            Expr::Binary { left, op, right } => {
                let prec = op.precedence();
                let left_sql = self.expr_prec(left, prec);
                // Right operands bind one tighter so a - (b - c) keeps its parens.
                let right_sql = self.expr_prec(right, prec + 1);
                let sql = match (op, self.dialect) {
                    (BinaryOp::Concat, Dialect::Mysql) => {
                        return format!("CONCAT({left_sql}, {right_sql})");
                    }
                    (BinaryOp::Concat, Dialect::SqlServer) => format!("{left_sql} + {right_sql}"),
                    _ => format!("{left_sql} {} {right_sql}", op.as_str()),
                };
                if prec < parent { format!("({sql})") } else { sql }
            }

            Expr::Unary { op, expr } => {
                let inner = self.expr_prec(expr, 6);
                match op {
                    UnaryOp::Not => format!("NOT {inner}"),
                    UnaryOp::Neg => format!("-{inner}"),
                }
            }

            Expr::Function { func, args } => {
                let args: Vec<_> = args.iter().map(|a| self.expr(a)).collect();
                let name = match (func.as_str(), self.dialect) {
                    ("LENGTH", Dialect::SqlServer) => "LEN",
                    (name, _) => name,
                };
                format!("{name}({})", args.join(", "))
            }

            Expr::Aggregate { func, arg } => match arg {
                Some(arg) => format!("{}({})", func.as_str(), self.expr(arg)),
                None => format!("{}(*)", func.as_str()),
            },

            Expr::In {
                expr,
                values,
                negated,
            } => {
                let expr_sql = self.expr_prec(expr, 4);
                let value_sqls: Vec<_> = values.iter().map(|v| self.expr(v)).collect();
                let not_str = if *negated { "NOT " } else { "" };
                self.wrap(parent, format!("{expr_sql} {not_str}IN ({})", value_sqls.join(", ")))
            }

            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let expr_sql = self.expr_prec(expr, 4);
                let low_sql = self.expr_prec(low, 4);
                let high_sql = self.expr_prec(high, 4);
                let not_str = if *negated { "NOT " } else { "" };
                self.wrap(
                    parent,
                    format!("{expr_sql} {not_str}BETWEEN {low_sql} AND {high_sql}"),
                )
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = self.expr_prec(expr, 4);
                let not_str = if *negated { " NOT" } else { "" };
                self.wrap(parent, format!("{expr_sql} IS{not_str} NULL"))
            }

            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => {
                let expr_sql = self.expr_prec(expr, 4);
                let param = self.param(Value::Text(pattern.clone()));
                let not_str = if *negated { "NOT " } else { "" };
                let sql = if *case_insensitive && self.dialect.supports_ilike() {
                    format!("{expr_sql} {not_str}ILIKE {param}")
                } else if *case_insensitive {
                    // Fallback for dialects without ILIKE
                    format!("LOWER({expr_sql}) {not_str}LIKE LOWER({param})")
                } else {
                    format!("{expr_sql} {not_str}LIKE {param}")
                };
                self.wrap(parent, sql)
            }
        }
    }

    fn wrap(&self, parent: u8, sql: String) -> String {
        // Predicates sit at comparison precedence.
        if parent > 3 { format!("({sql})") } else { sql }
    }

    fn select(&mut self, select: &Select) -> String {
        let mut sql = String::from("SELECT ");
        let top = match (self.dialect, select.limit, select.offset) {
            (Dialect::SqlServer, Some(limit), None) => Some(limit),
            _ => None,
        };
        if let Some(limit) = top {
            sql.push_str(&format!("TOP ({limit}) "));
        }

        if select.columns.is_empty() {
            sql.push_str(&format!("{}.*", self.q(select.from.alias())));
        } else {
            let cols: Vec<_> = select
                .columns
                .iter()
                .map(|c| format!("{} AS {}", self.expr(&c.expr), self.q(&c.label)))
                .collect();
            sql.push_str(&cols.join(", "));
        }

        sql.push_str(" FROM ");
        match &select.from {
            Source::Table { name, alias } => {
                sql.push_str(&format!("{} AS {}", self.q(name), self.q(alias)));
            }
            Source::Derived { select: inner, alias } => {
                let inner_sql = self.select(inner);
                sql.push_str(&format!("({inner_sql}) AS {}", self.q(alias)));
            }
        }

        for join in &select.joins {
            let on = self.expr(&join.on);
            sql.push_str(&format!(
                " LEFT JOIN {} AS {} ON {on}",
                self.q(&join.table),
                self.q(&join.alias)
            ));
        }

        if let Some(filter) = &select.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(filter));
        }

        if !select.order_by.is_empty() {
            let terms: Vec<_> = select
                .order_by
                .iter()
                .map(|o| {
                    let dir = match o.direction {
                        OrderDirection::Asc => "ASC",
                        OrderDirection::Desc => "DESC",
                    };
                    format!("{} {dir}", self.expr(&o.expr))
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        match self.dialect {
            Dialect::SqlServer => {
                if let Some(offset) = select.offset {
                    if select.order_by.is_empty() {
                        sql.push_str(" ORDER BY (SELECT NULL)");
                    }
                    sql.push_str(&format!(" OFFSET {offset} ROWS"));
                    if let Some(limit) = select.limit {
                        sql.push_str(&format!(" FETCH NEXT {limit} ROWS ONLY"));
                    }
                }
            }
            _ => {
                if let Some(limit) = select.limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                if let Some(offset) = select.offset {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }
            }
        }

        sql
    }

    fn returning(&self, columns: &[String]) -> String {
        if columns.is_empty() || !self.dialect.supports_returning() {
            return String::new();
        }
        let cols: Vec<_> = columns.iter().map(|c| self.q(c)).collect();
        format!(" RETURNING {}", cols.join(", "))
    }

    fn insert(&mut self, insert: &Insert) -> String {
        let cols: Vec<_> = insert.values.iter().map(|(c, _)| self.q(c)).collect();
        let vals: Vec<_> = insert
            .values
            .iter()
            .map(|(_, v)| self.param(v.clone()))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}){}",
            self.q(&insert.table),
            cols.join(", "),
            vals.join(", "),
            self.returning(&insert.returning)
        )
    }

    fn update(&mut self, update: &Update) -> String {
        let sets: Vec<_> = update
            .set
            .iter()
            .map(|(c, e)| format!("{} = {}", self.q(c), self.expr(e)))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", self.q(&update.table), sets.join(", "));
        if let Some(filter) = &update.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(filter));
        }
        sql.push_str(&self.returning(&update.returning));
        sql
    }

    fn delete(&mut self, delete: &Delete) -> String {
        let mut sql = format!("DELETE FROM {}", self.q(&delete.table));
        if let Some(filter) = &delete.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(filter));
        }
        sql
    }
}

/// Render an expression with its parameters.
pub fn render_expr(expr: &Expr, dialect: Dialect) -> (String, Vec<Value>) {
    let mut r = Renderer::new(dialect);
    let sql = r.expr(expr);
    (sql, r.params)
}

/// Render a SELECT with its parameters.
pub fn render_select(select: &Select, dialect: Dialect) -> (String, Vec<Value>) {
    let mut r = Renderer::new(dialect);
    let sql = r.select(select);
    (sql, r.params)
}

/// Render a write statement with its parameters.
pub fn render_statement(statement: &Statement, dialect: Dialect) -> (String, Vec<Value>) {
    let mut r = Renderer::new(dialect);
    let sql = match statement {
        Statement::Insert(i) => r.insert(i),
        Statement::Update(u) => r.update(u),
        Statement::Delete(d) => r.delete(d),
    };
    (sql, r.params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{OrderBy, col, lit};

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(Dialect::Sqlite.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
        assert_eq!(Dialect::SqlServer.quote_identifier("a]b"), "[a]]b]");
    }

    #[test]
    fn precedence_adds_parentheses_only_where_needed() {
        let expr = col("a").eq(1).or(col("b").eq(2)).and(col("c").eq(3));
        let (sql, params) = render_expr(&expr, Dialect::Postgres);
        assert_eq!(sql, "(\"a\" = $1 OR \"b\" = $2) AND \"c\" = $3");
        assert_eq!(params, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

        let (sql, _) = render_expr(&col("a").sub(col("b").sub(lit(1))), Dialect::Sqlite);
        assert_eq!(sql, "\"a\" - (\"b\" - ?1)");
    }

    #[test]
    fn select_with_join_order_and_paging() {
        let select = Select::from_table("books", "t0")
            .column(Expr::qualified("t0", "title"), "t0.title")
            .left_join(
                "genres",
                "t1",
                Expr::qualified("t1", "id").eq(Expr::qualified("t0", "genre_id")),
            )
            .filter(Expr::qualified("t0", "title").starts_with("D"))
            .order_by(OrderBy::desc(Expr::qualified("t0", "title")))
            .limit(10)
            .offset(20);

        let (sql, params) = render_select(&select, Dialect::Sqlite);
        assert_eq!(
            sql,
            "SELECT \"t0\".\"title\" AS \"t0.title\" FROM \"books\" AS \"t0\" \
             LEFT JOIN \"genres\" AS \"t1\" ON \"t1\".\"id\" = \"t0\".\"genre_id\" \
             WHERE \"t0\".\"title\" LIKE ?1 ORDER BY \"t0\".\"title\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(params, vec![Value::Text("D%".into())]);

        let (sql, _) = render_select(&select, Dialect::SqlServer);
        assert!(sql.ends_with("ORDER BY [t0].[title] DESC OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"));
    }

    #[test]
    fn bulk_update_renders_expression_setters() {
        let stmt = Statement::Update(Update {
            table: "books".into(),
            set: vec![("title".into(), col("title").concat(" (Updated)"))],
            filter: Some(col("genre_id").eq(1_i64)),
            returning: vec![],
        });
        let (sql, _) = render_statement(&stmt, Dialect::Mysql);
        assert_eq!(
            sql,
            "UPDATE `books` SET `title` = CONCAT(`title`, ?) WHERE `genre_id` = ?"
        );
        let (sql, _) = render_statement(&stmt, Dialect::SqlServer);
        assert_eq!(
            sql,
            "UPDATE [books] SET [title] = [title] + @p1 WHERE [genre_id] = @p2"
        );
    }

    #[test]
    fn insert_with_default_and_returning() {
        let stmt = Statement::Insert(Insert {
            table: "genres".into(),
            values: vec![
                ("name".into(), Value::Text("Poetry".into())),
                ("is_active".into(), Value::Default),
            ],
            returning: vec!["id".into()],
        });
        let (sql, params) = render_statement(&stmt, Dialect::Postgres);
        assert_eq!(
            sql,
            "INSERT INTO \"genres\" (\"name\", \"is_active\") VALUES ($1, DEFAULT) RETURNING \"id\""
        );
        assert_eq!(params.len(), 1);
    }
}
