//! Statement planning.
//!
//! Reads plan into structured [`Select`]s: a flat owner select, a joined
//! select that pulls every included relationship through LEFT JOINs, or a
//! split plan of one owner select plus one select per included relationship
//! keyed by `IN (parent values)`. Entity columns are labeled `alias.column`
//! so one row can carry several kinds side by side.
//!
//! Writes plan into keyed INSERT/UPDATE/DELETE statements carrying the
//! concurrency-token predicate.

use folio_core::error::{Error, Result};
use folio_core::{
    Delete, EntityDescriptor, Expr, Insert, OrderBy, Record, RelationshipDescriptor, Select,
    SelectItem, Update, Value,
};

use crate::query::{BulkDelete, BulkUpdate, IncludeNode, Projection, Query, key_predicate};

/// Alias of the owner kind in every read plan.
pub const OWNER_ALIAS: &str = "t0";

/// Output columns of one kind, labeled `alias.column`.
pub fn entity_columns(entity: &EntityDescriptor, alias: &str) -> Vec<SelectItem> {
    entity
        .fields
        .iter()
        .map(|f| SelectItem::new(Expr::qualified(alias, f.column), format!("{alias}.{}", f.column)))
        .collect()
}

/// The kind's soft filter qualified by `alias`, unless bypassed.
pub fn soft_filter(entity: &EntityDescriptor, alias: &str, ignore: bool) -> Option<Expr> {
    if ignore {
        return None;
    }
    entity.soft_filter_expr().map(|e| e.qualify(alias))
}

fn owner_filter(query: &Query) -> Option<Expr> {
    let user = query.filter_expr().map(|f| f.clone().qualify(OWNER_ALIAS));
    match soft_filter(query.entity(), OWNER_ALIAS, query.ignores_filters()) {
        Some(soft) => Some(Expr::and_opt(user, soft)),
        None => user,
    }
}

fn qualified_order(query: &Query, alias: &str) -> Vec<OrderBy> {
    query
        .order()
        .iter()
        .map(|o| OrderBy {
            expr: o.expr.clone().qualify(alias),
            direction: o.direction,
        })
        .collect()
}

fn key_order(entity: &EntityDescriptor, alias: &str) -> Vec<OrderBy> {
    entity
        .key
        .iter()
        .filter_map(|k| entity.field(k))
        .map(|f| OrderBy::asc(Expr::qualified(alias, f.column)))
        .collect()
}

/// Flat select of the owner kind: filter, soft filter, order and paging.
pub fn owner_select(query: &Query) -> Select {
    let entity = query.entity();
    let mut select = Select::from_table(entity.table, OWNER_ALIAS);
    select.columns = entity_columns(entity, OWNER_ALIAS);
    select.filter = owner_filter(query);
    select.order_by = qualified_order(query, OWNER_ALIAS);
    select.limit = query.limit_value();
    select.offset = query.offset_value();
    select
}

/// Select of one row by key. `ignore_filters` is set for reloads, which
/// must see the row whatever its soft-filter state.
pub fn key_select(entity: &EntityDescriptor, key: &[Value], ignore_filters: bool) -> Result<Select> {
    let mut select = Select::from_table(entity.table, OWNER_ALIAS);
    select.columns = entity_columns(entity, OWNER_ALIAS);
    select.filter = Some(key_predicate(entity, key, Some(OWNER_ALIAS))?);
    if let Some(soft) = soft_filter(entity, OWNER_ALIAS, ignore_filters) {
        select = select.filter(soft);
    }
    Ok(select)
}

/// `SELECT COUNT(*)` over the rows the query would return.
pub fn count_select(query: &Query) -> Select {
    let paged = query.limit_value().is_some() || query.offset_value().is_some();
    let mut select = if paged {
        let inner = owner_select(query);
        Select::from_derived(inner, OWNER_ALIAS)
    } else {
        let mut s = Select::from_table(query.entity().table, OWNER_ALIAS);
        s.filter = owner_filter(query);
        s
    };
    select.columns = vec![SelectItem::new(Expr::count_star(), "count")];
    select
}

/// Select of a projection over the owner kind. Labels are the projection's.
pub fn projection_select(query: &Query, projection: &Projection) -> Result<Select> {
    if projection.is_empty() {
        return Err(Error::unsupported("projection selects no columns"));
    }
    let entity = query.entity();
    let mut select = Select::from_table(entity.table, OWNER_ALIAS);
    select.columns = projection
        .items()
        .iter()
        .map(|i| SelectItem::new(i.expr.clone().qualify(OWNER_ALIAS), i.label.clone()))
        .collect();
    select.filter = owner_filter(query);
    select.order_by = qualified_order(query, OWNER_ALIAS);
    select.limit = query.limit_value();
    select.offset = query.offset_value();
    Ok(select)
}

/// An included relationship bound to its alias in a joined plan.
#[derive(Debug, Clone)]
pub struct JoinedNode {
    pub alias: String,
    pub relationship: &'static RelationshipDescriptor,
    pub children: Vec<JoinedNode>,
}

/// One statement loading the owners and every included relationship.
#[derive(Debug, Clone)]
pub struct JoinedPlan {
    pub select: Select,
    pub nodes: Vec<JoinedNode>,
}

/// Plan a single joined statement.
///
/// Paging applies to owners, not joined rows, so a paged query selects its
/// owners in a derived table first and joins collections onto that. Rows
/// are ordered by the query order, then by every key along the tree, so all
/// rows of one owner arrive together.
pub fn joined_plan(query: &Query, includes: &[IncludeNode]) -> Result<JoinedPlan> {
    let entity = query.entity();
    let paged = query.limit_value().is_some() || query.offset_value().is_some();
    let mut select = if paged && !includes.is_empty() {
        let mut inner = owner_select(query);
        inner.columns = entity
            .fields
            .iter()
            .map(|f| SelectItem::new(Expr::qualified(OWNER_ALIAS, f.column), f.column))
            .collect();
        inner.order_by.extend(key_order(entity, OWNER_ALIAS));
        Select::from_derived(inner, OWNER_ALIAS)
    } else {
        let mut s = Select::from_table(entity.table, OWNER_ALIAS);
        s.filter = owner_filter(query);
        s.limit = query.limit_value();
        s.offset = query.offset_value();
        s
    };
    select.columns = entity_columns(entity, OWNER_ALIAS);

    let mut next_alias = 1;
    let mut tree_keys = Vec::new();
    let nodes = plan_joins(
        &mut select,
        entity,
        OWNER_ALIAS,
        includes,
        query.ignores_filters(),
        &mut next_alias,
        &mut tree_keys,
    )?;

    select.order_by = qualified_order(query, OWNER_ALIAS);
    select.order_by.extend(key_order(entity, OWNER_ALIAS));
    select.order_by.extend(tree_keys);

    tracing::debug!(
        entity = entity.name,
        joins = select.joins.len(),
        paged,
        "planned joined query"
    );
    Ok(JoinedPlan { select, nodes })
}

fn plan_joins(
    select: &mut Select,
    parent: &'static EntityDescriptor,
    parent_alias: &str,
    includes: &[IncludeNode],
    ignore_filters: bool,
    next_alias: &mut usize,
    tree_keys: &mut Vec<OrderBy>,
) -> Result<Vec<JoinedNode>> {
    let mut planned = Vec::with_capacity(includes.len());
    for node in includes {
        let rel = node.relationship;
        let target = rel.target;
        let alias = format!("t{next_alias}");
        *next_alias += 1;

        let local = parent.require_field(rel.local_field)?.column;
        let remote = target.require_field(rel.remote_field)?.column;
        let mut on = Expr::qualified(&alias, remote).eq(Expr::qualified(parent_alias, local));
        if let Some(soft) = soft_filter(target, &alias, ignore_filters) {
            on = on.and(soft);
        }
        select.joins.push(folio_core::Join {
            table: target.table.to_string(),
            alias: alias.clone(),
            on,
        });
        select.columns.extend(entity_columns(target, &alias));
        tree_keys.extend(key_order(target, &alias));

        let children = plan_joins(
            select,
            target,
            &alias,
            &node.children,
            ignore_filters,
            next_alias,
            tree_keys,
        )?;
        planned.push(JoinedNode {
            alias,
            relationship: rel,
            children,
        });
    }
    Ok(planned)
}

/// Select the targets of `rel` whose `remote_field` is one of `values`.
///
/// Used by split plans after the parents are loaded; `values` are the
/// parents' distinct `local_field` values. Returns `None` when there is
/// nothing to look up.
pub fn related_select(
    rel: &RelationshipDescriptor,
    values: Vec<Value>,
    ignore_filters: bool,
) -> Result<Option<Select>> {
    let values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
    if values.is_empty() {
        return Ok(None);
    }
    let target = rel.target;
    let remote = target.require_field(rel.remote_field)?.column;
    let mut select = Select::from_table(target.table, OWNER_ALIAS);
    select.columns = entity_columns(target, OWNER_ALIAS);
    select.filter = Some(Expr::qualified(OWNER_ALIAS, remote).in_list(values));
    if let Some(soft) = soft_filter(target, OWNER_ALIAS, ignore_filters) {
        select = select.filter(soft);
    }
    select.order_by = key_order(target, OWNER_ALIAS);
    Ok(Some(select))
}

/// INSERT for a new instance.
///
/// Generated keys and the token are left to the store. A field holding its
/// sentinel, `Value::Default`, or NULL where the store has a default asks
/// for the store default.
/// Every store-filled column is returned so the session can adopt it.
pub fn insert_statement(record: &Record) -> Insert {
    let entity = record.descriptor();
    let mut values = Vec::with_capacity(entity.fields.len());
    let mut returning = Vec::new();
    for (i, field) in entity.fields.iter().enumerate() {
        let value = record.value_at(i);
        if field.is_token() {
            returning.push(field.column.to_string());
            continue;
        }
        if field.generated && matches!(value, Value::Null | Value::Default) {
            returning.push(field.column.to_string());
            continue;
        }
        let unset = value.is_null() && field.store_default.is_some();
        if unset || matches!(value, Value::Default) || field.is_sentinel(value) {
            values.push((field.column.to_string(), Value::Default));
            returning.push(field.column.to_string());
            continue;
        }
        values.push((field.column.to_string(), value.clone()));
    }
    Insert {
        table: entity.table.to_string(),
        values,
        returning,
    }
}

/// Keyed UPDATE writing only `changed` fields.
///
/// `key` and `token` are the values from the snapshot; a tokened kind gets
/// `token = <snapshot token>` in its predicate and returns the new token.
pub fn update_statement(
    record: &Record,
    changed: &[usize],
    key: &[Value],
    token: Option<&Value>,
) -> Result<Update> {
    let entity = record.descriptor();
    let set = changed
        .iter()
        .filter_map(|&i| entity.fields.get(i).map(|f| (i, f)))
        .filter(|(_, f)| !f.is_token())
        .map(|(i, f)| (f.column.to_string(), Expr::lit(record.value_at(i).clone())))
        .collect();
    let mut filter = key_predicate(entity, key, None)?;
    let mut returning = Vec::new();
    if let Some(token_field) = entity.token_field() {
        filter = filter.and(token_predicate(token_field.column, token));
        returning.push(token_field.column.to_string());
    }
    Ok(Update {
        table: entity.table.to_string(),
        set,
        filter: Some(filter),
        returning,
    })
}

/// Keyed DELETE with the token predicate for tokened kinds.
pub fn delete_statement(
    entity: &EntityDescriptor,
    key: &[Value],
    token: Option<&Value>,
) -> Result<Delete> {
    let mut filter = key_predicate(entity, key, None)?;
    if let Some(token_field) = entity.token_field() {
        filter = filter.and(token_predicate(token_field.column, token));
    }
    Ok(Delete {
        table: entity.table.to_string(),
        filter: Some(filter),
    })
}

fn token_predicate(column: &str, token: Option<&Value>) -> Expr {
    match token {
        Some(t) if !t.is_null() => Expr::col(column).eq(t.clone()),
        _ => Expr::col(column).is_null(),
    }
}

/// DELETE of every row of `child` whose `column` holds one of `values`.
/// The flush engine uses this to sweep cascade dependents that were never
/// loaded into the session.
pub fn dependents_delete(child: &EntityDescriptor, column: &str, values: Vec<Value>) -> Delete {
    Delete {
        table: child.table.to_string(),
        filter: Some(Expr::col(column).in_list(values)),
    }
}

fn bulk_filter(entity: &EntityDescriptor, filter: Option<&Expr>, ignore: bool) -> Option<Expr> {
    let filter = filter.cloned();
    match entity.soft_filter_expr().filter(|_| !ignore) {
        Some(soft) => Some(Expr::and_opt(filter, soft)),
        None => filter,
    }
}

/// Set-based UPDATE for the direct bulk path.
pub fn bulk_update_statement(bulk: &BulkUpdate) -> Result<Update> {
    let entity = bulk.entity();
    if bulk.setters().is_empty() {
        return Err(Error::unsupported(format!(
            "bulk update of {} assigns no fields",
            entity.name
        )));
    }
    let mut set = Vec::with_capacity(bulk.setters().len());
    for (name, expr) in bulk.setters() {
        let field = entity.require_field(name)?;
        if field.is_token() {
            return Err(Error::unsupported(format!(
                "{}.{} is maintained by the store",
                entity.name, name
            )));
        }
        set.push((field.column.to_string(), expr.clone()));
    }
    let filter = bulk_filter(entity, bulk.filter_expr(), bulk.ignores_filters());
    Ok(Update {
        table: entity.table.to_string(),
        set,
        filter,
        returning: Vec::new(),
    })
}

/// Set-based DELETE for the direct bulk path.
pub fn bulk_delete_statement(bulk: &BulkDelete) -> Delete {
    let entity = bulk.entity();
    let filter = bulk_filter(entity, bulk.filter_expr(), bulk.ignores_filters());
    Delete {
        table: entity.table.to_string(),
        filter,
    }
}
