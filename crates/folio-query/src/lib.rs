//! Query construction and statement planning for Folio.
//!
//! `folio-query` sits between the session and the stores:
//!
//! - **Query model**: [`Query`], [`Include`], [`Projection`], the explicit
//!   [`Tracking`] and [`QuerySplitting`] choices, and the bulk mutations.
//! - **Planning**: soft-filter application and the joined/split read plans,
//!   plus keyed write statements with the concurrency-token predicate.
//! - **Rendering**: SQL text per [`Dialect`] for statement logs, and DDL for
//!   the persisted shape of each kind.

pub mod ddl;
pub mod plan;
pub mod query;
pub mod render;

pub use ddl::{CreateTable, SchemaBuilder, create_index_sql, create_schema_sql, create_table_sql};
pub use plan::{JoinedNode, JoinedPlan, OWNER_ALIAS};
pub use query::{
    BulkDelete, BulkUpdate, Include, IncludeNode, Projection, Query, QuerySplitting, Tracking,
    key_predicate, resolve_includes,
};
pub use render::{Dialect, render_expr, render_select, render_statement};

use folio_core::Statement;

/// Render a write statement to SQL text, discarding parameters.
pub fn render_sql(statement: &Statement, dialect: Dialect) -> String {
    render_statement(statement, dialect).0
}
