//! Entity descriptors: static metadata per entity kind.
//!
//! Descriptors are declared as `static` items and reference each other by
//! address, so relationship targets resolve without a runtime registry. The
//! [`Schema`] registry exists for callers that only have a kind name and for
//! one-time consistency checks at startup.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result, SchemaErrorKind};
use crate::expr::{BinaryOp, Expr};
use crate::field::{FieldDescriptor, FieldType, Literal, ReferentialAction};

/// Who produces primary key values for new instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    /// The store assigns the key on insert (auto-increment)
    Store,
    /// The application supplies the key (natural or composite keys)
    Client,
}

/// Direction of a relationship from the declaring kind's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One owner has many targets: `target.remote_field` references `self.local_field`.
    OneToMany,
    /// Many owners share one target: `self.local_field` references `target.remote_field`.
    ManyToOne,
}

/// A navigable relationship between two entity kinds.
#[derive(Clone, Copy)]
pub struct RelationshipDescriptor {
    pub name: &'static str,
    pub kind: RelationshipKind,
    pub target: &'static EntityDescriptor,
    /// Field on the declaring kind
    pub local_field: &'static str,
    /// Field on the target kind
    pub remote_field: &'static str,
    /// What deleting the owning side does to the other side
    pub on_delete: ReferentialAction,
}

impl RelationshipDescriptor {
    /// One-to-many: `target.remote_field` holds this kind's `local_field`.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static EntityDescriptor,
        local_field: &'static str,
        remote_field: &'static str,
        on_delete: ReferentialAction,
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::OneToMany,
            target,
            local_field,
            remote_field,
            on_delete,
        }
    }

    /// Many-to-one: this kind's `local_field` holds `target.remote_field`.
    pub const fn many_to_one(
        name: &'static str,
        target: &'static EntityDescriptor,
        local_field: &'static str,
        remote_field: &'static str,
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::ManyToOne,
            target,
            local_field,
            remote_field,
            on_delete: ReferentialAction::NoAction,
        }
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, RelationshipKind::OneToMany)
    }
}

impl fmt::Debug for RelationshipDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("target", &self.target.name)
            .field("local_field", &self.local_field)
            .field("remote_field", &self.remote_field)
            .field("on_delete", &self.on_delete)
            .finish()
    }
}

/// A unique or secondary index over one or more fields.
#[derive(Debug, Clone, Copy)]
pub struct IndexDescriptor {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub unique: bool,
}

impl IndexDescriptor {
    pub const fn unique(name: &'static str, fields: &'static [&'static str]) -> Self {
        Self {
            name,
            fields,
            unique: true,
        }
    }

    pub const fn secondary(name: &'static str, fields: &'static [&'static str]) -> Self {
        Self {
            name,
            fields,
            unique: false,
        }
    }
}

/// Row-level visibility predicate applied to every query on a kind unless
/// the query opts out.
#[derive(Debug, Clone, Copy)]
pub struct SoftFilter {
    pub field: &'static str,
    pub op: BinaryOp,
    pub value: Literal,
}

impl SoftFilter {
    pub const fn eq(field: &'static str, value: Literal) -> Self {
        Self {
            field,
            op: BinaryOp::Eq,
            value,
        }
    }
}

/// Static metadata for one entity kind.
#[derive(Debug)]
pub struct EntityDescriptor {
    /// Kind name, e.g. "Book"
    pub name: &'static str,
    /// Persisted table name
    pub table: &'static str,
    pub fields: &'static [FieldDescriptor],
    /// Primary key field names, in key order
    pub key: &'static [&'static str],
    pub key_generation: KeyGeneration,
    /// Field holding the opaque concurrency token, if any
    pub concurrency_token: Option<&'static str>,
    pub relationships: &'static [RelationshipDescriptor],
    pub indexes: &'static [IndexDescriptor],
    pub soft_filter: Option<SoftFilter>,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Like [`field`](Self::field) but a schema error when absent.
    pub fn require_field(&self, name: &str) -> Result<&'static FieldDescriptor> {
        self.field(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::FieldNotFound,
                format!("{} has no field '{}'", self.name, name),
            )
        })
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Find a field by its column name.
    pub fn field_by_column(&self, column: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// Positions of the key fields in [`fields`](Self::fields).
    pub fn key_indices(&self) -> Vec<usize> {
        self.key
            .iter()
            .filter_map(|k| self.field_index(k))
            .collect()
    }

    pub fn is_key(&self, field: &str) -> bool {
        self.key.contains(&field)
    }

    pub fn token_index(&self) -> Option<usize> {
        self.concurrency_token.and_then(|t| self.field_index(t))
    }

    pub fn token_field(&self) -> Option<&'static FieldDescriptor> {
        self.concurrency_token.and_then(|t| self.field(t))
    }

    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn require_relationship(&self, name: &str) -> Result<&'static RelationshipDescriptor> {
        self.relationship(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::RelationshipNotFound,
                format!("{} has no relationship '{}'", self.name, name),
            )
        })
    }

    /// Column names in field order.
    pub fn columns(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.column).collect()
    }

    /// The soft filter as a predicate over unqualified columns.
    pub fn soft_filter_expr(&self) -> Option<Expr> {
        let filter = self.soft_filter?;
        let field = self.field(filter.field)?;
        Some(
            Expr::col(field.column)
                .compare(filter.op, Expr::Literal(filter.value.to_value(field.field_type))),
        )
    }

    /// Foreign keys declared on this kind: (field, target kind).
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&'static FieldDescriptor, &'static EntityDescriptor)> {
        self.fields
            .iter()
            .filter_map(|f| f.references.map(|fk| (f, fk.target)))
    }

    /// Does this kind hold a foreign key into `other`?
    pub fn references(&self, other: &EntityDescriptor) -> bool {
        self.foreign_keys().any(|(_, t)| t.same_kind(other))
    }

    /// Depth in the foreign-key graph: kinds without outgoing foreign keys
    /// are rank 0, every other kind is one more than its deepest parent.
    /// Self references are ignored.
    pub fn dependency_rank(&self) -> usize {
        self.rank_with_guard(&mut Vec::new())
    }

    fn rank_with_guard(&self, visiting: &mut Vec<&'static str>) -> usize {
        if visiting.contains(&self.name) {
            return 0;
        }
        visiting.push(self.name);
        let rank = self
            .foreign_keys()
            .filter(|(_, t)| !t.same_kind(self))
            .map(|(_, t)| t.rank_with_guard(visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.pop();
        rank
    }

    pub fn same_kind(&self, other: &EntityDescriptor) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }

    /// Check internal consistency: key, token, indexes, relationships.
    pub fn check(&self) -> Result<()> {
        let invalid = |msg: String| Error::schema(SchemaErrorKind::Invalid, msg);

        if self.key.is_empty() {
            return Err(invalid(format!("{} declares no key fields", self.name)));
        }
        for key in self.key {
            self.require_field(key)?;
        }
        if self.key_generation == KeyGeneration::Store {
            let generated = self.key.len() == 1
                && self.field(self.key[0]).is_some_and(|f| f.generated);
            if !generated {
                return Err(invalid(format!(
                    "{} uses store-generated keys but its key is not a single generated field",
                    self.name
                )));
            }
        }
        if let Some(token) = self.concurrency_token {
            let field = self.require_field(token)?;
            if field.field_type != FieldType::Token {
                return Err(invalid(format!(
                    "{}.{} is the concurrency token but is not a token field",
                    self.name, token
                )));
            }
        }
        for index in self.indexes {
            for field in index.fields {
                self.require_field(field)?;
            }
        }
        for rel in self.relationships {
            self.require_field(rel.local_field)?;
            rel.target.require_field(rel.remote_field)?;
            let (child, fk_field) = match rel.kind {
                RelationshipKind::OneToMany => (rel.target, rel.remote_field),
                RelationshipKind::ManyToOne => (self, rel.local_field),
            };
            let fk = child.require_field(fk_field)?.references.ok_or_else(|| {
                invalid(format!(
                    "{}.{} backs relationship '{}' but is not a foreign key",
                    child.name, fk_field, rel.name
                ))
            })?;
            if rel.kind == RelationshipKind::OneToMany && fk.on_delete != rel.on_delete {
                return Err(invalid(format!(
                    "relationship {}.{} declares ON DELETE {} but {}.{} declares {}",
                    self.name,
                    rel.name,
                    rel.on_delete.as_sql(),
                    child.name,
                    fk_field,
                    fk.on_delete.as_sql()
                )));
            }
        }
        for (field, target) in self.foreign_keys() {
            if let Some(fk) = field.references {
                target.require_field(fk.field)?;
            }
        }
        if let Some(filter) = self.soft_filter {
            self.require_field(filter.field)?;
        }
        Ok(())
    }
}

/// A field elsewhere in the schema that references some kind.
#[derive(Debug, Clone, Copy)]
pub struct Dependent {
    pub entity: &'static EntityDescriptor,
    pub field: &'static FieldDescriptor,
    pub on_delete: ReferentialAction,
}

/// Registry of every entity kind an application uses.
///
/// Built once at startup; construction fails if any descriptor is
/// inconsistent, after which lookups have no failure modes beyond an
/// unknown name.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: Vec<&'static EntityDescriptor>,
    by_name: HashMap<&'static str, usize>,
}

impl Schema {
    pub fn new(entities: &[&'static EntityDescriptor]) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(entities.len());
        for (i, entity) in entities.iter().enumerate() {
            entity.check()?;
            if by_name.insert(entity.name, i).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("entity kind {} registered twice", entity.name),
                ));
            }
        }
        let schema = Self {
            entities: entities.to_vec(),
            by_name,
        };
        for entity in &schema.entities {
            for (field, target) in entity.foreign_keys() {
                if !schema.by_name.contains_key(target.name) {
                    return Err(Error::schema(
                        SchemaErrorKind::EntityNotFound,
                        format!(
                            "{}.{} references unregistered kind {}",
                            entity.name, field.name, target.name
                        ),
                    ));
                }
            }
        }
        tracing::debug!(entities = schema.entities.len(), "schema registered");
        Ok(schema)
    }

    /// Look up a kind by name.
    pub fn describe(&self, kind: &str) -> Result<&'static EntityDescriptor> {
        self.by_name
            .get(kind)
            .map(|&i| self.entities[i])
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::EntityNotFound,
                    format!("unknown entity kind '{}'", kind),
                )
            })
    }

    /// Every registered kind in registration order.
    pub fn entities(&self) -> &[&'static EntityDescriptor] {
        &self.entities
    }

    /// Registered kinds sorted so that referenced kinds come first.
    pub fn in_dependency_order(&self) -> Vec<&'static EntityDescriptor> {
        let mut ordered = self.entities.clone();
        ordered.sort_by_key(|e| e.dependency_rank());
        ordered
    }

    /// Every foreign key in the schema that points at `kind`.
    pub fn dependents_of(&self, kind: &EntityDescriptor) -> Vec<Dependent> {
        self.entities
            .iter()
            .flat_map(|entity| {
                entity.fields.iter().filter_map(move |field| {
                    field
                        .references
                        .filter(|fk| fk.target.same_kind(kind))
                        .map(|fk| Dependent {
                            entity,
                            field,
                            on_delete: fk.on_delete,
                        })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEAM: EntityDescriptor = EntityDescriptor {
        name: "Team",
        table: "teams",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt).generated(),
            FieldDescriptor::new("name", FieldType::Text).required().max_length(50),
            FieldDescriptor::new("active", FieldType::Bool)
                .required()
                .store_default(Literal::Bool(true)),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Store,
        concurrency_token: None,
        relationships: &[RelationshipDescriptor::one_to_many(
            "members",
            &MEMBER,
            "id",
            "team_id",
            ReferentialAction::Cascade,
        )],
        indexes: &[IndexDescriptor::unique("ix_teams_name", &["name"])],
        soft_filter: Some(SoftFilter::eq("active", Literal::Bool(true))),
    };

    static MEMBER: EntityDescriptor = EntityDescriptor {
        name: "Member",
        table: "members",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt).generated(),
            FieldDescriptor::new("team_id", FieldType::BigInt)
                .required()
                .references(&TEAM, "id", ReferentialAction::Cascade),
            FieldDescriptor::new("version", FieldType::Token),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Store,
        concurrency_token: Some("version"),
        relationships: &[RelationshipDescriptor::many_to_one(
            "team", &TEAM, "team_id", "id",
        )],
        indexes: &[],
        soft_filter: None,
    };

    static BROKEN: EntityDescriptor = EntityDescriptor {
        name: "Broken",
        table: "broken",
        fields: &[FieldDescriptor::new("id", FieldType::BigInt)],
        key: &["id"],
        key_generation: KeyGeneration::Store,
        concurrency_token: None,
        relationships: &[],
        indexes: &[],
        soft_filter: None,
    };

    #[test]
    fn schema_describes_and_orders_kinds() {
        let schema = Schema::new(&[&MEMBER, &TEAM]).unwrap();

        assert_eq!(schema.describe("Team").unwrap().table, "teams");
        assert!(schema.describe("Nope").is_err());
        assert_eq!(TEAM.dependency_rank(), 0);
        assert_eq!(MEMBER.dependency_rank(), 1);

        let ordered: Vec<_> = schema.in_dependency_order().iter().map(|e| e.name).collect();
        assert_eq!(ordered, vec!["Team", "Member"]);

        let deps = schema.dependents_of(&TEAM);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].entity.name, "Member");
        assert_eq!(deps[0].on_delete, ReferentialAction::Cascade);
    }

    #[test]
    fn descriptor_lookups() {
        assert_eq!(MEMBER.token_index(), Some(2));
        assert_eq!(MEMBER.key_indices(), vec![0]);
        assert!(MEMBER.references(&TEAM));
        assert!(!TEAM.references(&MEMBER));
        assert_eq!(
            TEAM.soft_filter_expr(),
            Some(Expr::col("active").eq(true))
        );
        assert!(TEAM.require_relationship("members").unwrap().is_collection());
        assert!(format!("{:?}", MEMBER).contains("target: \"Team\""));
    }

    #[test]
    fn inconsistent_descriptors_are_rejected() {
        let err = Schema::new(&[&BROKEN]).unwrap_err();
        assert!(err.to_string().contains("not a single generated field"));

        let err = Schema::new(&[&MEMBER]).unwrap_err();
        assert!(err.to_string().contains("unregistered kind Team"));
    }
}
