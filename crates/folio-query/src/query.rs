//! Query descriptions: what to read and how to materialize it.

use folio_core::error::{Error, Result};
use folio_core::{EntityDescriptor, Expr, OrderBy, RelationshipDescriptor, SelectItem, Value};

/// How query results relate to the session's tracking state.
///
/// This is an explicit per-query choice; the session never infers it from
/// the shape of the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tracking {
    /// Results are resolved through the identity map and change-tracked.
    #[default]
    Tracked,
    /// Every row becomes a fresh, untracked instance.
    Untracked,
    /// Untracked, but rows with the same key share one instance within this
    /// query's result.
    UntrackedWithIdentityResolution,
}

/// Whether collection includes load through one joined statement or one
/// statement per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuerySplitting {
    /// One statement; row count is the cross product of included collections.
    #[default]
    Single,
    /// One statement for the owners plus one per included relationship.
    Split,
}

/// A relationship path to eager-load, e.g. `book_authors` then `author`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    path: Vec<&'static str>,
}

impl Include {
    pub fn new(relationship: &'static str) -> Self {
        Self {
            path: vec![relationship],
        }
    }

    /// Continue the path through a relationship of the last included kind.
    pub fn then(mut self, relationship: &'static str) -> Self {
        self.path.push(relationship);
        self
    }

    pub fn path(&self) -> &[&'static str] {
        &self.path
    }
}

/// One resolved relationship in the include tree.
#[derive(Debug, Clone)]
pub struct IncludeNode {
    pub relationship: &'static RelationshipDescriptor,
    pub children: Vec<IncludeNode>,
}

impl IncludeNode {
    pub fn target(&self) -> &'static EntityDescriptor {
        self.relationship.target
    }

    /// Number of nodes in this subtree, including self.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(IncludeNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Merge include paths into a tree rooted at `root`, resolving relationship
/// names against descriptors.
pub fn resolve_includes(
    root: &'static EntityDescriptor,
    includes: &[Include],
) -> Result<Vec<IncludeNode>> {
    let mut tree: Vec<IncludeNode> = Vec::new();
    for include in includes {
        let mut level = &mut tree;
        let mut owner = root;
        for name in include.path() {
            let rel = owner.require_relationship(name)?;
            let pos = match level.iter().position(|n| n.relationship.name == rel.name) {
                Some(pos) => pos,
                None => {
                    level.push(IncludeNode {
                        relationship: rel,
                        children: Vec::new(),
                    });
                    level.len() - 1
                }
            };
            owner = rel.target;
            level = &mut level[pos].children;
        }
    }
    Ok(tree)
}

/// A query against one entity kind.
#[derive(Debug, Clone)]
pub struct Query {
    entity: &'static EntityDescriptor,
    filter: Option<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    includes: Vec<Include>,
    tracking: Option<Tracking>,
    splitting: Option<QuerySplitting>,
    ignore_filters: bool,
}

impl Query {
    pub fn new(entity: &'static EntityDescriptor) -> Self {
        Self {
            entity,
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            includes: Vec::new(),
            tracking: None,
            splitting: None,
            ignore_filters: false,
        }
    }

    /// AND a predicate over the owner's columns onto the filter.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(Expr::and_opt(self.filter.take(), predicate));
        self
    }

    /// Filter to the row with the given key values, in key order.
    pub fn by_key(self, key: &[Value]) -> Result<Self> {
        let predicate = key_predicate(self.entity, key, None)?;
        Ok(self.filter(predicate))
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

    pub fn include(mut self, include: Include) -> Self {
        self.includes.push(include);
        self
    }

    pub fn tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Shorthand for `tracking(Tracking::Untracked)`.
    pub fn untracked(self) -> Self {
        self.tracking(Tracking::Untracked)
    }

    /// Shorthand for `tracking(Tracking::UntrackedWithIdentityResolution)`.
    pub fn untracked_with_identity_resolution(self) -> Self {
        self.tracking(Tracking::UntrackedWithIdentityResolution)
    }

    /// Load included relationships with one statement each.
    pub fn split(mut self) -> Self {
        self.splitting = Some(QuerySplitting::Split);
        self
    }

    /// Load included relationships through one joined statement.
    pub fn single(mut self) -> Self {
        self.splitting = Some(QuerySplitting::Single);
        self
    }

    /// Bypass the kind's soft filter for this query only.
    pub fn ignore_filters(mut self) -> Self {
        self.ignore_filters = true;
        self
    }

    pub fn entity(&self) -> &'static EntityDescriptor {
        self.entity
    }

    pub fn filter_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    pub fn includes(&self) -> &[Include] {
        &self.includes
    }

    pub fn tracking_mode(&self) -> Option<Tracking> {
        self.tracking
    }

    pub fn splitting_mode(&self) -> Option<QuerySplitting> {
        self.splitting
    }

    pub fn ignores_filters(&self) -> bool {
        self.ignore_filters
    }

    /// Resolve the include paths into a tree.
    pub fn include_tree(&self) -> Result<Vec<IncludeNode>> {
        resolve_includes(self.entity, &self.includes)
    }
}

/// Predicate matching one key, optionally qualified by a table alias.
pub fn key_predicate(
    entity: &EntityDescriptor,
    key: &[Value],
    alias: Option<&str>,
) -> Result<Expr> {
    if key.len() != entity.key.len() {
        return Err(Error::Custom(format!(
            "{} has a {}-part key, got {} values",
            entity.name,
            entity.key.len(),
            key.len()
        )));
    }
    let mut predicate: Option<Expr> = None;
    for (field_name, value) in entity.key.iter().zip(key) {
        let field = entity.require_field(field_name)?;
        let column = match alias {
            Some(a) => Expr::qualified(a, field.column),
            None => Expr::col(field.column),
        };
        predicate = Some(Expr::and_opt(predicate, column.eq(value.clone())));
    }
    predicate.ok_or_else(|| Error::Custom(format!("{} declares no key", entity.name)))
}

/// A narrower result shape over the owner kind: chosen fields, computed
/// expressions or aggregates.
///
/// Projection results are never tracked, whatever tracking the query asks
/// for, because they cannot be written back as whole rows.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    items: Vec<SelectItem>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project a field, labeled with its field name.
    pub fn field(mut self, entity: &EntityDescriptor, name: &str) -> Result<Self> {
        let field = entity.require_field(name)?;
        self.items
            .push(SelectItem::new(Expr::col(field.column), field.name));
        Ok(self)
    }

    /// Project an arbitrary expression over the owner's columns.
    pub fn expr(mut self, expr: Expr, label: impl Into<String>) -> Self {
        self.items.push(SelectItem::new(expr, label));
        self
    }

    pub fn items(&self) -> &[SelectItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_aggregate(&self) -> bool {
        self.items.iter().any(|i| i.expr.is_aggregate())
    }
}

/// A set-based update that bypasses the session's tracking.
#[derive(Debug, Clone)]
pub struct BulkUpdate {
    entity: &'static EntityDescriptor,
    filter: Option<Expr>,
    setters: Vec<(&'static str, Expr)>,
    ignore_filters: bool,
}

impl BulkUpdate {
    pub fn new(entity: &'static EntityDescriptor) -> Self {
        Self {
            entity,
            filter: None,
            setters: Vec::new(),
            ignore_filters: false,
        }
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(Expr::and_opt(self.filter.take(), predicate));
        self
    }

    /// Assign a field; the expression may reference the row's own columns.
    pub fn set(mut self, field: &'static str, value: impl Into<Expr>) -> Self {
        self.setters.push((field, value.into()));
        self
    }

    pub fn ignore_filters(mut self) -> Self {
        self.ignore_filters = true;
        self
    }

    pub fn entity(&self) -> &'static EntityDescriptor {
        self.entity
    }

    pub fn filter_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn setters(&self) -> &[(&'static str, Expr)] {
        &self.setters
    }

    pub fn ignores_filters(&self) -> bool {
        self.ignore_filters
    }
}

/// A set-based delete that bypasses the session's tracking.
#[derive(Debug, Clone)]
pub struct BulkDelete {
    entity: &'static EntityDescriptor,
    filter: Option<Expr>,
    ignore_filters: bool,
}

impl BulkDelete {
    pub fn new(entity: &'static EntityDescriptor) -> Self {
        Self {
            entity,
            filter: None,
            ignore_filters: false,
        }
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(Expr::and_opt(self.filter.take(), predicate));
        self
    }

    pub fn ignore_filters(mut self) -> Self {
        self.ignore_filters = true;
        self
    }

    pub fn entity(&self) -> &'static EntityDescriptor {
        self.entity
    }

    pub fn filter_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn ignores_filters(&self) -> bool {
        self.ignore_filters
    }
}
