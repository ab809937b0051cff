//! Folio - a persistence session for relational stores.
//!
//! Folio keeps an in-memory view of persisted rows consistent with the store:
//!
//! - An identity map so one row is one live instance per session
//! - Snapshot-based change tracking
//! - A unit of work that writes every pending change in one transaction,
//!   ordered by foreign-key dependencies
//! - Optimistic concurrency through store-maintained tokens
//! - Tracked, untracked, identity-resolved, projected and streamed reads
//!
//! # Quick Start
//!
//! ```ignore
//! use folio::bookstore::BOOK;
//! use folio::prelude::*;
//!
//! async fn rename(cx: &Cx, db: &Database) -> Outcome<FlushResult, Error> {
//!     let mut session = Session::new(db.connect());
//!     let books = match session.load(cx, &Query::new(&BOOK).filter(col("isbn").eq("0-00"))).await {
//!         Outcome::Ok(books) => books,
//!         Outcome::Err(e) => return Outcome::Err(e),
//!         Outcome::Cancelled(r) => return Outcome::Cancelled(r),
//!         Outcome::Panicked(p) => return Outcome::Panicked(p),
//!     };
//!     for book in &books {
//!         book.entity().set("title", "Renamed").ok();
//!     }
//!     session.flush(cx).await
//! }
//! ```
//!
//! # Crates
//!
//! - `folio-core`: values, rows, descriptors, records, statements, errors
//! - `folio-query`: query model, statement planning, SQL rendering
//! - `folio-memory`: the in-process relational store
//! - `folio-session`: identity map, change tracker, flush, materialization

pub mod bookstore;

pub use folio_core::{
    ConcurrencyToken, Connection, Cx, Entity, EntityDescriptor, Error, FieldDescriptor, FieldType,
    FromRow, IndexDescriptor, KeyGeneration, Literal, OrderBy, Outcome, Record,
    ReferentialAction, RelationshipDescriptor, RelationshipKind, Result, Row, Schema, SoftFilter,
    Value, col, lit,
};

pub use folio_core::{Expr, ValidationError, ValidationErrorKind};

pub use folio_query::{
    BulkDelete, BulkUpdate, Dialect, Include, Projection, Query, QuerySplitting, Tracking,
    create_schema_sql, create_table_sql, render_sql,
};

pub use folio_memory::{Database, MemoryConfig, MemoryConnection};

pub use folio_session::{
    CancelHandle, EntityNode, EntityRef, EntityState, EntityStream, FlushResult, Related,
    RowStream, Session, SessionConfig, TrackedEntry,
};

/// Commonly used items.
///
/// ```ignore
/// use folio::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Runtime
        Cx,
        Outcome,
        // Model
        Entity,
        EntityDescriptor,
        Error,
        Record,
        Result,
        Row,
        Value,
        // Queries
        Expr,
        Include,
        OrderBy,
        Projection,
        Query,
        Tracking,
        col,
        lit,
        // Store
        Database,
        MemoryConfig,
        // Session
        EntityNode,
        EntityRef,
        EntityState,
        FlushResult,
        Session,
        SessionConfig,
    };
}
