//! Core types and traits for Folio.
//!
//! This crate provides the foundational abstractions shared by the query
//! layer, the stores and the session:
//!
//! - `EntityDescriptor` static metadata per entity kind and the `Schema` registry
//! - `Record` field values of one instance, and the `Entity` trait for typed structs
//! - `Expr` and structured `Statement`s
//! - `Connection` trait for stores
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod entity;
pub mod error;
pub mod expr;
pub mod field;
pub mod record;
pub mod row;
pub mod statement;
pub mod validate;
pub mod value;

pub use connection::{Connection, IsolationLevel, RowCursor, TransactionOps};
pub use entity::{
    Dependent, EntityDescriptor, IndexDescriptor, KeyGeneration, RelationshipDescriptor,
    RelationshipKind, Schema, SoftFilter,
};
pub use error::{
    ConflictError, Error, FieldValidationError, FlushError, MutationKind, NotFoundError, Result,
    ValidationError, ValidationErrorKind,
};
pub use expr::{AggregateFunc, BinaryOp, Expr, Func, UnaryOp, col, lit};
pub use field::{FieldDescriptor, FieldType, ForeignKey, Literal, ReferentialAction};
pub use record::{ConcurrencyToken, Entity, Record};
pub use row::{ColumnInfo, FromRow, Row};
pub use statement::{
    Delete, ExecuteResult, Insert, Join, OrderBy, OrderDirection, Select, SelectItem, Source,
    Statement, Update,
};
pub use validate::{ValidationScope, validate_record};
pub use value::Value;
