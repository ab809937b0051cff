//! Table storage and statement execution.
//!
//! [`Tables`] is a full copy-on-write image of the database: cloning it is
//! cheap because each table's rows sit behind an `Arc`, and a write only
//! copies the rows of the tables it touches. Transactions work on a private
//! clone and replace the committed image on commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use folio_core::error::{Error, QueryError, QueryErrorKind, Result};
use folio_core::{
    ColumnInfo, Delete, Dependent, EntityDescriptor, ExecuteResult, FieldDescriptor, FieldType, Insert,
    KeyGeneration, ReferentialAction, Row, Schema, Select, Source, Statement, Update, Value,
};

use crate::eval::{Layout, eval, eval_group, is_true};

/// Stored values of one row, in field order.
pub(crate) type StoredRow = Vec<Value>;

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) entity: &'static EntityDescriptor,
    pub(crate) rows: Arc<Vec<StoredRow>>,
    /// Foreign keys elsewhere in the schema that point at this table
    dependents: Arc<[Dependent]>,
    next_id: i64,
}

impl Table {
    fn new(entity: &'static EntityDescriptor, dependents: Vec<Dependent>) -> Self {
        Self {
            entity,
            rows: Arc::new(Vec::new()),
            dependents: dependents.into(),
            next_id: 1,
        }
    }

    pub(crate) fn column_names(&self) -> Vec<String> {
        self.entity.columns().into_iter().map(String::from).collect()
    }

    fn column_index(&self, column: &str) -> Result<usize> {
        self.entity
            .fields
            .iter()
            .position(|f| f.column == column)
            .ok_or_else(|| no_such(format!("column {}.{}", self.entity.table, column)))
    }
}

/// The rows of every table plus the token sequence.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    tables: BTreeMap<String, Table>,
    token_counter: u64,
}

fn no_such(what: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: None,
        message: format!("no such {what}"),
    })
}

/// Row set produced while evaluating a SELECT, before projection.
struct Relation {
    layout: Layout,
    /// Alias of the FROM source; `SELECT *` expands to its columns
    from_alias: String,
    rows: Vec<Vec<Value>>,
}

impl Tables {
    pub(crate) fn new(schema: &Schema, token_seed: u64) -> Self {
        let tables = schema
            .entities()
            .iter()
            .map(|&e| (e.table.to_string(), Table::new(e, schema.dependents_of(e))))
            .collect();
        Self {
            tables,
            token_counter: token_seed,
        }
    }

    pub(crate) fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| no_such(format!("table {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| no_such(format!("table {name}")))
    }

    fn next_token(&mut self) -> Value {
        self.token_counter += 1;
        Value::Bytes(self.token_counter.to_be_bytes().to_vec())
    }

    // ==================== Reads ====================

    pub(crate) fn select(&self, select: &Select) -> Result<Vec<Row>> {
        let relation = self.relation(select)?;
        let Relation {
            layout,
            from_alias,
            mut rows,
        } = relation;

        if select.is_aggregate() {
            let names: Vec<String> = select.columns.iter().map(|c| c.label.clone()).collect();
            let values = select
                .columns
                .iter()
                .map(|c| eval_group(&c.expr, &layout, &rows))
                .collect::<Result<Vec<_>>>()?;
            return Ok(vec![Row::new(names, values)]);
        }

        if !select.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                let keys = select
                    .order_by
                    .iter()
                    .map(|o| eval(&o.expr, &layout, &row))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((keys, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for ((x, y), order) in a.iter().zip(b).zip(&select.order_by) {
                    let ord = x.sort_cmp(y);
                    let ord = match order.direction {
                        folio_core::OrderDirection::Asc => ord,
                        folio_core::OrderDirection::Desc => ord.reverse(),
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        let offset = select.offset.unwrap_or(0) as usize;
        let limit = select.limit.map_or(usize::MAX, |l| l as usize);
        let rows = rows.into_iter().skip(offset).take(limit);

        if select.columns.is_empty() {
            let source = layout.source_columns(&from_alias);
            let columns = Arc::new(ColumnInfo::new(
                source.iter().map(|(_, c)| c.to_string()).collect(),
            ));
            return Ok(rows
                .map(|row| {
                    let values = source.iter().map(|(i, _)| row[*i].clone()).collect();
                    Row::with_columns(Arc::clone(&columns), values)
                })
                .collect());
        }

        let columns = Arc::new(ColumnInfo::new(
            select.columns.iter().map(|c| c.label.clone()).collect(),
        ));
        rows.map(|row| {
            let values = select
                .columns
                .iter()
                .map(|c| eval(&c.expr, &layout, &row))
                .collect::<Result<Vec<_>>>()?;
            Ok(Row::with_columns(Arc::clone(&columns), values))
        })
        .collect()
    }

    /// FROM, joins and WHERE.
    fn relation(&self, select: &Select) -> Result<Relation> {
        let mut layout = Layout::new();
        let (from_alias, mut rows) = match &select.from {
            Source::Table { name, alias } => {
                let table = self.table(name)?;
                layout.push_source(alias, &table.column_names());
                (alias.clone(), table.rows.as_ref().clone())
            }
            Source::Derived { select: inner, alias } => {
                let inner_rows = self.select(inner)?;
                let labels: Vec<String> = if inner.columns.is_empty() {
                    inner_rows
                        .first()
                        .map(|r| r.column_names().map(String::from).collect())
                        .unwrap_or_default()
                } else {
                    inner.columns.iter().map(|c| c.label.clone()).collect()
                };
                layout.push_source(alias, &labels);
                (
                    alias.clone(),
                    inner_rows.into_iter().map(Row::into_values).collect(),
                )
            }
        };

        for join in &select.joins {
            let table = self.table(&join.table)?;
            let width = table.entity.fields.len();
            layout.push_source(&join.alias, &table.column_names());
            let mut joined = Vec::with_capacity(rows.len());
            for left in rows {
                let mut matched = false;
                for right in table.rows.iter() {
                    let mut combined = left.clone();
                    combined.extend(right.iter().cloned());
                    if is_true(&eval(&join.on, &layout, &combined)?) {
                        joined.push(combined);
                        matched = true;
                    }
                }
                if !matched {
                    let mut combined = left;
                    combined.extend(std::iter::repeat_n(Value::Null, width));
                    joined.push(combined);
                }
            }
            rows = joined;
        }

        if let Some(filter) = &select.filter {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if is_true(&eval(filter, &layout, &row)?) {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        debug_assert!(rows.iter().all(|r| r.len() == layout.len()));
        Ok(Relation {
            layout,
            from_alias,
            rows,
        })
    }

    // ==================== Writes ====================

    /// Apply one write. A failing statement leaves no partial effects.
    pub(crate) fn execute(&mut self, statement: &Statement) -> Result<ExecuteResult> {
        let before = self.clone();
        let result = match statement {
            Statement::Insert(insert) => self.insert(insert),
            Statement::Update(update) => self.update(update),
            Statement::Delete(delete) => self.delete(delete),
        };
        if result.is_err() {
            *self = before;
        }
        result
    }

    fn insert(&mut self, insert: &Insert) -> Result<ExecuteResult> {
        let table = self.table(&insert.table)?;
        let entity = table.entity;
        let mut row: StoredRow = vec![Value::Null; entity.fields.len()];
        let mut provided = vec![false; entity.fields.len()];

        for (column, value) in &insert.values {
            let index = table.column_index(column)?;
            let field = &entity.fields[index];
            row[index] = match value {
                Value::Default => store_default(field),
                other => coerce(entity, field, other.clone())?,
            };
            provided[index] = true;
        }

        let mut next_id = table.next_id;
        for (index, field) in entity.fields.iter().enumerate() {
            if field.is_token() {
                row[index] = self.next_token();
                continue;
            }
            if field.generated && entity.key_generation == KeyGeneration::Store {
                match row[index].as_i64() {
                    Some(explicit) => next_id = next_id.max(explicit + 1),
                    None => {
                        row[index] = generated_value(field, next_id);
                        next_id += 1;
                    }
                }
                continue;
            }
            if !provided[index] {
                row[index] = store_default(field);
            }
        }

        self.check_row(entity, &row, None)?;

        let table = self.table_mut(&insert.table)?;
        table.next_id = next_id;
        Arc::make_mut(&mut table.rows).push(row.clone());

        tracing::trace!(table = %insert.table, "row inserted");
        Ok(ExecuteResult {
            rows_affected: 1,
            returned: returning(entity, &insert.returning, std::slice::from_ref(&row))?,
        })
    }

    fn update(&mut self, update: &Update) -> Result<ExecuteResult> {
        let table = self.table(&update.table)?;
        let entity = table.entity;
        let mut layout = Layout::new();
        layout.push_source(entity.table, &table.column_names());

        let mut targets = Vec::new();
        for (column, expr) in &update.set {
            let index = table.column_index(column)?;
            let field = &entity.fields[index];
            if entity.is_key(field.name) {
                return Err(Error::unsupported(format!(
                    "key column {}.{} cannot be updated",
                    entity.table, column
                )));
            }
            targets.push((index, expr));
        }

        let mut changes = Vec::new();
        for (position, row) in table.rows.iter().enumerate() {
            if let Some(filter) = &update.filter {
                if !is_true(&eval(filter, &layout, row)?) {
                    continue;
                }
            }
            let mut new_row = row.clone();
            for (index, expr) in &targets {
                let value = eval(expr, &layout, row)?;
                new_row[*index] = coerce(entity, &entity.fields[*index], value)?;
            }
            changes.push((position, new_row));
        }

        let token_index = entity
            .fields
            .iter()
            .position(FieldDescriptor::is_token);
        for (position, new_row) in &mut changes {
            if let Some(t) = token_index {
                new_row[t] = self.next_token();
            }
            self.check_row(entity, new_row, Some(*position))?;
        }

        let updated: Vec<StoredRow> = changes.iter().map(|(_, r)| r.clone()).collect();
        let table = self.table_mut(&update.table)?;
        let rows = Arc::make_mut(&mut table.rows);
        for (position, new_row) in changes {
            rows[position] = new_row;
        }

        Ok(ExecuteResult {
            rows_affected: updated.len() as u64,
            returned: returning(entity, &update.returning, &updated)?,
        })
    }

    fn delete(&mut self, delete: &Delete) -> Result<ExecuteResult> {
        let table = self.table(&delete.table)?;
        let entity = table.entity;
        let mut layout = Layout::new();
        layout.push_source(entity.table, &table.column_names());

        let mut doomed = Vec::new();
        for (position, row) in table.rows.iter().enumerate() {
            let hit = match &delete.filter {
                Some(filter) => is_true(&eval(filter, &layout, row)?),
                None => true,
            };
            if hit {
                doomed.push(position);
            }
        }
        let affected = doomed.len() as u64;
        self.remove_rows(&delete.table, doomed)?;
        Ok(ExecuteResult::affected(affected))
    }

    /// Remove rows by position and apply ON DELETE actions of every foreign
    /// key that points at them.
    fn remove_rows(&mut self, table_name: &str, positions: Vec<usize>) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let doomed: HashSet<usize> = positions.into_iter().collect();
        let table = self.table_mut(table_name)?;
        let entity = table.entity;
        let dependents = Arc::clone(&table.dependents);
        let mut removed = Vec::with_capacity(doomed.len());
        let mut kept = Vec::with_capacity(table.rows.len() - doomed.len());
        for (position, row) in table.rows.iter().enumerate() {
            if doomed.contains(&position) {
                removed.push(row.clone());
            } else {
                kept.push(row.clone());
            }
        }
        table.rows = Arc::new(kept);
        tracing::trace!(table = table_name, rows = removed.len(), "rows deleted");

        for dependent in dependents.iter() {
            let (Some(fk), Some(child_index)) = (
                dependent.field.references,
                dependent.entity.field_index(dependent.field.name),
            ) else {
                continue;
            };
            let Some(ref_index) = entity.field_index(fk.field) else {
                continue;
            };
            let child_table = dependent.entity.table;
            let values: Vec<&Value> = removed
                .iter()
                .map(|r| &r[ref_index])
                .filter(|v| !v.is_null())
                .collect();
            let child = self.table(child_table)?;
            let hits: Vec<usize> = child
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| values.iter().any(|v| r[child_index] == **v))
                .map(|(i, _)| i)
                .collect();
            if hits.is_empty() {
                continue;
            }
            match dependent.on_delete {
                ReferentialAction::Cascade => self.remove_rows(child_table, hits)?,
                ReferentialAction::SetNull => {
                    let child_entity = child.entity;
                    let field = &child_entity.fields[child_index];
                    if field.required {
                        return Err(Error::constraint(format!(
                            "NOT NULL constraint failed: {}.{}",
                            child_entity.table, field.column
                        )));
                    }
                    let token_index = child_entity.token_index();
                    let mut tokens = Vec::new();
                    if token_index.is_some() {
                        for _ in &hits {
                            tokens.push(self.next_token());
                        }
                    }
                    let child = self.table_mut(child_table)?;
                    let rows = Arc::make_mut(&mut child.rows);
                    for (n, position) in hits.into_iter().enumerate() {
                        rows[position][child_index] = Value::Null;
                        if let (Some(t), Some(token)) = (token_index, tokens.get(n)) {
                            rows[position][t] = token.clone();
                        }
                    }
                }
                ReferentialAction::Restrict | ReferentialAction::NoAction => {
                    return Err(Error::constraint(format!(
                        "FOREIGN KEY constraint failed: {} is still referenced by {}.{}",
                        entity.table,
                        child_table,
                        child.entity.fields[child_index].column
                    )));
                }
            }
        }
        Ok(())
    }

    /// NOT NULL, primary key, unique index and foreign key checks for a row
    /// about to be stored. `replacing` is the position of the row it
    /// replaces, excluded from uniqueness checks.
    fn check_row(
        &self,
        entity: &'static EntityDescriptor,
        row: &[Value],
        replacing: Option<usize>,
    ) -> Result<()> {
        for (field, value) in entity.fields.iter().zip(row) {
            if field.required && value.is_null() {
                return Err(Error::constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    entity.table, field.column
                )));
            }
        }

        let table = self.table(entity.table)?;
        let others = move || {
            table
                .rows
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != replacing)
                .map(|(_, r)| r)
        };

        let key = entity.key_indices();
        if others().any(|r| key.iter().all(|&i| r[i] == row[i])) {
            return Err(Error::constraint(format!(
                "UNIQUE constraint failed: {} primary key",
                entity.table
            )));
        }

        for index in entity.indexes.iter().filter(|i| i.unique) {
            let cols: Vec<usize> = index
                .fields
                .iter()
                .filter_map(|f| entity.field_index(f))
                .collect();
            if cols.iter().any(|&i| row[i].is_null()) {
                continue;
            }
            if others().any(|r| cols.iter().all(|&i| r[i] == row[i])) {
                return Err(Error::constraint(format!(
                    "UNIQUE constraint failed: {} ({})",
                    index.name,
                    index.fields.join(", ")
                )));
            }
        }

        for (field, value) in entity.fields.iter().zip(row) {
            let Some(fk) = field.references else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let target = self.table(fk.target.table)?;
            let Some(target_index) = fk.target.field_index(fk.field) else {
                return Err(no_such(format!("column {}.{}", fk.target.table, fk.field)));
            };
            if !target.rows.iter().any(|r| r[target_index] == *value) {
                return Err(Error::constraint(format!(
                    "FOREIGN KEY constraint failed: {}.{} references missing {}",
                    entity.table, field.column, fk.target.table
                )));
            }
        }
        Ok(())
    }

    /// Every row of a table, labeled by column name.
    pub(crate) fn dump(&self, name: &str) -> Result<Vec<Row>> {
        let table = self.table(name)?;
        let columns = Arc::new(ColumnInfo::new(table.column_names()));
        Ok(table
            .rows
            .iter()
            .map(|r| Row::with_columns(Arc::clone(&columns), r.clone()))
            .collect())
    }
}

/// Row-at-a-time evaluation of a single-table SELECT over a snapshot.
pub(crate) struct Scan {
    rows: Arc<Vec<StoredRow>>,
    position: usize,
    layout: Layout,
    select: Select,
    columns: Arc<ColumnInfo>,
    to_skip: u64,
    remaining: u64,
}

impl Tables {
    /// A lazy scan for selects that need no joins, sorting or grouping.
    pub(crate) fn scan(&self, select: &Select) -> Result<Option<Scan>> {
        let Source::Table { name, alias } = &select.from else {
            return Ok(None);
        };
        if !select.joins.is_empty() || !select.order_by.is_empty() || select.is_aggregate() {
            return Ok(None);
        }
        let table = self.table(name)?;
        let mut layout = Layout::new();
        layout.push_source(alias, &table.column_names());
        let names = if select.columns.is_empty() {
            table.column_names()
        } else {
            select.columns.iter().map(|c| c.label.clone()).collect()
        };
        Ok(Some(Scan {
            rows: Arc::clone(&table.rows),
            position: 0,
            layout,
            select: select.clone(),
            columns: Arc::new(ColumnInfo::new(names)),
            to_skip: select.offset.unwrap_or(0),
            remaining: select.limit.unwrap_or(u64::MAX),
        }))
    }
}

impl Scan {
    pub(crate) fn next_row(&mut self) -> Result<Option<Row>> {
        while self.remaining > 0 && self.position < self.rows.len() {
            let row = &self.rows[self.position];
            self.position += 1;
            if let Some(filter) = &self.select.filter {
                if !is_true(&eval(filter, &self.layout, row)?) {
                    continue;
                }
            }
            if self.to_skip > 0 {
                self.to_skip -= 1;
                continue;
            }
            self.remaining -= 1;
            let values = if self.select.columns.is_empty() {
                row.clone()
            } else {
                self.select
                    .columns
                    .iter()
                    .map(|c| eval(&c.expr, &self.layout, row))
                    .collect::<Result<Vec<_>>>()?
            };
            return Ok(Some(Row::with_columns(Arc::clone(&self.columns), values)));
        }
        Ok(None)
    }
}

fn store_default(field: &FieldDescriptor) -> Value {
    field
        .store_default
        .map_or(Value::Null, |lit| lit.to_value(field.field_type))
}

fn generated_value(field: &FieldDescriptor, id: i64) -> Value {
    match field.field_type {
        FieldType::Int => i32::try_from(id).map_or(Value::BigInt(id), Value::Int),
        _ => Value::BigInt(id),
    }
}

/// Convert a value to the storage shape of a field, rejecting mismatches.
fn coerce(entity: &EntityDescriptor, field: &FieldDescriptor, value: Value) -> Result<Value> {
    let mismatch = |value: &Value| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: None,
            message: format!(
                "datatype mismatch: {}.{} is {}, got {}",
                entity.table,
                field.column,
                field.field_type.name(),
                value.type_name()
            ),
        })
    };
    Ok(match (field.field_type, value) {
        (_, Value::Null) => Value::Null,
        (FieldType::Int, Value::BigInt(i)) => {
            Value::Int(i32::try_from(i).map_err(|_| mismatch(&Value::BigInt(i)))?)
        }
        (FieldType::BigInt, Value::Int(i)) => Value::BigInt(i64::from(i)),
        (FieldType::Double, Value::Int(i)) => Value::Double(f64::from(i)),
        (FieldType::Double, Value::BigInt(i)) => Value::Double(i as f64),
        (FieldType::Decimal { scale, .. }, Value::Double(d)) => {
            Value::Decimal(format!("{:.*}", scale as usize, d))
        }
        (FieldType::Decimal { scale, .. }, Value::Int(i)) => {
            Value::Decimal(format!("{:.*}", scale as usize, f64::from(i)))
        }
        (FieldType::Decimal { scale, .. }, Value::BigInt(i)) => {
            Value::Decimal(format!("{:.*}", scale as usize, i as f64))
        }
        (FieldType::Bool, Value::Int(i)) => Value::Bool(i != 0),
        (FieldType::Bool, Value::BigInt(i)) => Value::Bool(i != 0),
        (field_type, value) if field_type.accepts(&value) => value,
        (_, value) => return Err(mismatch(&value)),
    })
}

fn returning(
    entity: &EntityDescriptor,
    columns: &[String],
    rows: &[StoredRow],
) -> Result<Vec<Row>> {
    if columns.is_empty() {
        return Ok(Vec::new());
    }
    let indices = columns
        .iter()
        .map(|c| {
            entity
                .fields
                .iter()
                .position(|f| f.column == c.as_str())
                .ok_or_else(|| no_such(format!("column {}.{}", entity.table, c)))
        })
        .collect::<Result<Vec<_>>>()?;
    let info = Arc::new(ColumnInfo::new(columns.to_vec()));
    Ok(rows
        .iter()
        .map(|r| {
            Row::with_columns(
                Arc::clone(&info),
                indices.iter().map(|&i| r[i].clone()).collect(),
            )
        })
        .collect())
}
