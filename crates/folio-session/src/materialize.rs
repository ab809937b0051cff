//! Query materialization: rows into entity graphs.
//!
//! Reading happens in two steps. [`fetch`] runs the statements and builds an
//! unresolved graph of records ([`Draft`]s); nothing in the session changes
//! while rows are still arriving. [`resolve`] then turns the drafts into
//! [`EntityNode`]s through a [`Resolver`] chosen by the query's tracking mode.
//! A cancelled read therefore never leaves half a result in the identity map.
//!
//! Collections load either through one joined statement, grouped back into
//! a tree by key, or through one statement per included relationship whose
//! rows are matched to their parents in memory. Both produce the same graph.

use std::collections::{BTreeMap, HashMap, HashSet};

use asupersync::{Cx, Outcome};
use folio_core::{
    Connection, Entity, EntityDescriptor, Error, Record, RelationshipDescriptor, Result, Row,
    Select, Value,
};
use folio_query::plan::{self, JoinedNode, OWNER_ALIAS};
use folio_query::{IncludeNode, Query, QuerySplitting};
use serde_json::Value as JsonValue;

use crate::TrackingState;
use crate::identity_map::{EntityKey, EntityRef, IdentityMap};

/// Loaded relationship of an [`EntityNode`].
#[derive(Debug, Clone)]
pub enum Related {
    Many(Vec<EntityNode>),
    One(Option<Box<EntityNode>>),
}

/// An entity instance plus the relationships a query included.
///
/// Nodes form a tree shaped like the include paths. The same instance may
/// appear at several places in the tree (an author of two books); in tracked
/// and identity-resolving modes every occurrence holds the same
/// [`EntityRef`].
#[derive(Debug, Clone)]
pub struct EntityNode {
    entity: EntityRef,
    related: BTreeMap<&'static str, Related>,
}

impl EntityNode {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn into_entity(self) -> EntityRef {
        self.entity
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.entity.get(field)
    }

    /// Convert the instance (not its relationships) to a typed entity.
    pub fn to_entity<E: Entity>(&self) -> Result<E> {
        self.entity.to_entity()
    }

    pub fn related(&self, relationship: &str) -> Option<&Related> {
        self.related.get(relationship)
    }

    /// Was the relationship included by the query?
    pub fn is_loaded(&self, relationship: &str) -> bool {
        self.related.contains_key(relationship)
    }

    /// Items of a loaded collection; empty when not loaded.
    pub fn many(&self, relationship: &str) -> &[EntityNode] {
        match self.related.get(relationship) {
            Some(Related::Many(items)) => items,
            _ => &[],
        }
    }

    /// The referenced instance of a loaded reference.
    pub fn one(&self, relationship: &str) -> Option<&EntityNode> {
        match self.related.get(relationship) {
            Some(Related::One(item)) => item.as_deref(),
            _ => None,
        }
    }

    /// Field values plus every loaded relationship, nested.
    pub fn to_json(&self) -> JsonValue {
        let mut json = self.entity.read().to_json();
        if let JsonValue::Object(map) = &mut json {
            for (name, related) in &self.related {
                let value = match related {
                    Related::Many(items) => {
                        JsonValue::Array(items.iter().map(EntityNode::to_json).collect())
                    }
                    Related::One(item) => item.as_ref().map_or(JsonValue::Null, |n| n.to_json()),
                };
                map.insert((*name).to_string(), value);
            }
        }
        json
    }
}

/// Where materialized instances come from.
pub(crate) enum Resolver<'a> {
    /// The session's identity map; new instances are tracked as Unchanged.
    Session(&'a mut TrackingState),
    /// A map that lives for one query and tracks nothing.
    Temporary(&'a mut IdentityMap),
    /// A new instance per row occurrence.
    Fresh,
}

impl Resolver<'_> {
    pub(crate) fn resolve(&mut self, record: Record) -> EntityRef {
        let Some(key) = EntityKey::of(&record) else {
            return EntityRef::new(record);
        };
        match self {
            Resolver::Session(state) => {
                let (entity, created) = state.map.resolve(key, || record);
                if created {
                    state.tracker.track_unchanged(&entity);
                }
                entity
            }
            Resolver::Temporary(map) => map.resolve(key, || record).0,
            Resolver::Fresh => EntityRef::new(record),
        }
    }
}

/// A record and its included relationships, not yet resolved to instances.
#[derive(Debug)]
pub(crate) struct Draft {
    record: Record,
    related: Vec<(&'static RelationshipDescriptor, Drafts)>,
}

impl Draft {
    fn new(record: Record) -> Self {
        Self {
            record,
            related: Vec::new(),
        }
    }

    fn collection(&mut self, rel: &'static RelationshipDescriptor) -> &mut Drafts {
        let pos = match self.related.iter().position(|(r, _)| r.name == rel.name) {
            Some(pos) => pos,
            None => {
                self.related.push((rel, Drafts::default()));
                self.related.len() - 1
            }
        };
        &mut self.related[pos].1
    }
}

/// Drafts deduplicated by key, in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct Drafts {
    items: Vec<Draft>,
    index: HashMap<Vec<Value>, usize>,
}

impl Drafts {
    fn entry(&mut self, record: Record) -> &mut Draft {
        let key = record.key();
        let pos = match self.index.get(&key) {
            Some(&pos) => pos,
            None => {
                self.items.push(Draft::new(record));
                self.index.insert(key, self.items.len() - 1);
                self.items.len() - 1
            }
        };
        &mut self.items[pos]
    }

    fn push(&mut self, draft: Draft) {
        self.index.insert(draft.record.key(), self.items.len());
        self.items.push(draft);
    }
}

/// Read the query's owners and every included relationship.
#[tracing::instrument(level = "debug", skip_all, fields(entity = query.entity().name))]
pub(crate) async fn fetch<C: Connection>(
    conn: &C,
    cx: &Cx,
    query: &Query,
    splitting: QuerySplitting,
) -> Outcome<Drafts, Error> {
    let tree = match query.include_tree() {
        Ok(tree) => tree,
        Err(e) => return Outcome::Err(e),
    };

    if tree.is_empty() {
        let rows = match conn.query(cx, &plan::owner_select(query)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let owners = match records(query.entity(), &rows) {
            Ok(owners) => owners,
            Err(e) => return Outcome::Err(e),
        };
        let mut drafts = Drafts::default();
        for record in owners {
            drafts.push(Draft::new(record));
        }
        return Outcome::Ok(drafts);
    }

    match splitting {
        QuerySplitting::Single => fetch_joined(conn, cx, query, &tree).await,
        QuerySplitting::Split => fetch_split(conn, cx, query, &tree).await,
    }
}

async fn fetch_joined<C: Connection>(
    conn: &C,
    cx: &Cx,
    query: &Query,
    tree: &[IncludeNode],
) -> Outcome<Drafts, Error> {
    let joined = match plan::joined_plan(query, tree) {
        Ok(joined) => joined,
        Err(e) => return Outcome::Err(e),
    };
    let rows = match conn.query(cx, &joined.select).await {
        Outcome::Ok(rows) => rows,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    tracing::debug!(rows = rows.len(), "joined rows read");

    let mut owners = Drafts::default();
    for row in &rows {
        let owner = match Record::from_row(query.entity(), row, Some(OWNER_ALIAS)) {
            Ok(Some(owner)) => owner,
            Ok(None) => continue,
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = absorb(owners.entry(owner), &joined.nodes, row) {
            return Outcome::Err(e);
        }
    }
    Outcome::Ok(owners)
}

/// Fold one joined row into a parent's relationships. Every included
/// relationship gets an entry, empty when the row's join side is NULL.
fn absorb(parent: &mut Draft, nodes: &[JoinedNode], row: &Row) -> Result<()> {
    for node in nodes {
        let collection = parent.collection(node.relationship);
        if let Some(record) = Record::from_row(node.relationship.target, row, Some(&node.alias))? {
            absorb(collection.entry(record), &node.children, row)?;
        }
    }
    Ok(())
}

/// One include-tree node flattened for level-by-level loading.
struct Level<'q> {
    node: &'q IncludeNode,
    parent: Option<usize>,
    children: Vec<usize>,
    records: Vec<Record>,
    /// Record positions by their `remote_field` value
    by_remote: HashMap<Value, Vec<usize>>,
}

fn flatten<'q>(
    nodes: &'q [IncludeNode],
    parent: Option<usize>,
    out: &mut Vec<Level<'q>>,
) -> Vec<usize> {
    let mut ids = Vec::with_capacity(nodes.len());
    for node in nodes {
        let id = out.len();
        out.push(Level {
            node,
            parent,
            children: Vec::new(),
            records: Vec::new(),
            by_remote: HashMap::new(),
        });
        let children = flatten(&node.children, Some(id), out);
        out[id].children = children;
        ids.push(id);
    }
    ids
}

async fn fetch_split<C: Connection>(
    conn: &C,
    cx: &Cx,
    query: &Query,
    tree: &[IncludeNode],
) -> Outcome<Drafts, Error> {
    let rows = match conn.query(cx, &plan::owner_select(query)).await {
        Outcome::Ok(rows) => rows,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    let owners: Vec<Record> = match records(query.entity(), &rows) {
        Ok(owners) => owners,
        Err(e) => return Outcome::Err(e),
    };

    let mut levels = Vec::new();
    let roots = flatten(tree, None, &mut levels);

    // preorder: a level's parent is always loaded before it
    for id in 0..levels.len() {
        let rel = levels[id].node.relationship;
        let parents = match levels[id].parent {
            Some(p) => &levels[p].records,
            None => &owners,
        };
        let select = match related_select(rel, parents, query.ignores_filters()) {
            Ok(Some(select)) => select,
            Ok(None) => continue,
            Err(e) => return Outcome::Err(e),
        };
        let rows = match conn.query(cx, &select).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        tracing::debug!(relationship = rel.name, rows = rows.len(), "split rows read");
        let loaded = match records(rel.target, &rows) {
            Ok(loaded) => loaded,
            Err(e) => return Outcome::Err(e),
        };
        let level = &mut levels[id];
        for (pos, record) in loaded.iter().enumerate() {
            if let Some(value) = record.get(rel.remote_field) {
                level.by_remote.entry(value.clone()).or_default().push(pos);
            }
        }
        level.records = loaded;
    }

    let mut drafts = Drafts::default();
    for owner in owners {
        drafts.push(split_draft(owner, &roots, &levels));
    }
    Outcome::Ok(drafts)
}

fn related_select(
    rel: &'static RelationshipDescriptor,
    parents: &[Record],
    ignore_filters: bool,
) -> Result<Option<Select>> {
    let mut seen = HashSet::new();
    let values: Vec<Value> = parents
        .iter()
        .filter_map(|p| p.get(rel.local_field))
        .filter(|v| seen.insert((*v).clone()))
        .cloned()
        .collect();
    plan::related_select(rel, values, ignore_filters)
}

fn split_draft(record: Record, children: &[usize], levels: &[Level<'_>]) -> Draft {
    let mut draft = Draft::new(record);
    for &id in children {
        let level = &levels[id];
        let rel = level.node.relationship;
        let matched: Vec<usize> = draft
            .record
            .get(rel.local_field)
            .and_then(|v| level.by_remote.get(v))
            .cloned()
            .unwrap_or_default();
        let mut items = Drafts::default();
        for pos in matched {
            let child = level.records[pos].clone();
            items.push(split_draft(child, &level.children, levels));
        }
        draft.related.push((rel, items));
    }
    draft
}

fn records(entity: &'static EntityDescriptor, rows: &[Row]) -> Result<Vec<Record>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(record) = Record::from_row(entity, row, Some(OWNER_ALIAS))? {
            out.push(record);
        }
    }
    Ok(out)
}

/// Turn drafts into nodes, resolving every record through `resolver`.
pub(crate) fn resolve(drafts: Drafts, resolver: &mut Resolver<'_>) -> Vec<EntityNode> {
    drafts
        .items
        .into_iter()
        .map(|draft| into_node(draft, resolver))
        .collect()
}

fn into_node(draft: Draft, resolver: &mut Resolver<'_>) -> EntityNode {
    let entity = resolver.resolve(draft.record);
    let mut related = BTreeMap::new();
    for (rel, items) in draft.related {
        let nodes = resolve(items, resolver);
        let loaded = if rel.is_collection() {
            Related::Many(nodes)
        } else {
            Related::One(nodes.into_iter().next().map(Box::new))
        };
        related.insert(rel.name, loaded);
    }
    EntityNode { entity, related }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{FieldDescriptor, FieldType, KeyGeneration, ReferentialAction};

    static SHELF: EntityDescriptor = EntityDescriptor {
        name: "Shelf",
        table: "shelves",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt),
            FieldDescriptor::new("label", FieldType::Text),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Client,
        concurrency_token: None,
        relationships: &[RelationshipDescriptor::one_to_many(
            "items",
            &ITEM,
            "id",
            "shelf_id",
            ReferentialAction::Cascade,
        )],
        indexes: &[],
        soft_filter: None,
    };

    static ITEM: EntityDescriptor = EntityDescriptor {
        name: "Item",
        table: "items",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt),
            FieldDescriptor::new("shelf_id", FieldType::BigInt),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Client,
        concurrency_token: None,
        relationships: &[],
        indexes: &[],
        soft_filter: None,
    };

    fn joined_row(shelf: i64, item: Option<i64>) -> Row {
        Row::new(
            vec![
                "t0.id".into(),
                "t0.label".into(),
                "t1.id".into(),
                "t1.shelf_id".into(),
            ],
            vec![
                Value::BigInt(shelf),
                Value::Text(format!("shelf {shelf}")),
                item.map_or(Value::Null, Value::BigInt),
                item.map_or(Value::Null, |_| Value::BigInt(shelf)),
            ],
        )
    }

    fn items_node() -> Vec<JoinedNode> {
        vec![JoinedNode {
            alias: "t1".into(),
            relationship: &SHELF.relationships[0],
            children: Vec::new(),
        }]
    }

    fn drafts_from(rows: &[Row]) -> Drafts {
        let nodes = items_node();
        let mut owners = Drafts::default();
        for row in rows {
            let owner = Record::from_row(&SHELF, row, Some("t0")).unwrap().unwrap();
            absorb(owners.entry(owner), &nodes, row).unwrap();
        }
        owners
    }

    #[test]
    fn joined_rows_group_by_owner() {
        let rows = [
            joined_row(1, Some(10)),
            joined_row(1, Some(11)),
            joined_row(2, None),
        ];
        let nodes = resolve(drafts_from(&rows), &mut Resolver::Fresh);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].many("items").len(), 2);
        // an owner without items still has the collection loaded
        assert!(nodes[1].is_loaded("items"));
        assert!(nodes[1].many("items").is_empty());
    }

    #[test]
    fn fresh_resolution_never_shares_instances() {
        let rows = [joined_row(1, Some(10))];
        let first = resolve(drafts_from(&rows), &mut Resolver::Fresh);
        let second = resolve(drafts_from(&rows), &mut Resolver::Fresh);
        assert!(!EntityRef::ptr_eq(first[0].entity(), second[0].entity()));
    }

    #[test]
    fn session_resolution_tracks_new_instances() {
        let mut state = TrackingState::default();
        let rows = [joined_row(1, Some(10))];
        let first = resolve(drafts_from(&rows), &mut Resolver::Session(&mut state));
        assert_eq!(state.map.len(), 2);
        assert_eq!(state.tracker.len(), 2);

        let second = resolve(drafts_from(&rows), &mut Resolver::Session(&mut state));
        assert!(EntityRef::ptr_eq(first[0].entity(), second[0].entity()));
        assert_eq!(state.tracker.len(), 2);
    }

    #[test]
    fn graph_renders_as_nested_json() {
        let rows = [joined_row(3, Some(30))];
        let nodes = resolve(drafts_from(&rows), &mut Resolver::Fresh);
        let json = nodes[0].to_json();
        assert_eq!(json["label"], "shelf 3");
        assert_eq!(json["items"][0]["id"], 30);
    }
}
