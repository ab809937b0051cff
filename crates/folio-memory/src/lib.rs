//! In-process relational store for Folio.
//!
//! `folio-memory` executes the structured statements planned by
//! `folio-query` against tables held in memory, enforcing the same rules a
//! relational server would:
//!
//! - NOT NULL, primary key, unique index and foreign key checks
//! - `ON DELETE CASCADE | RESTRICT | SET NULL`
//! - auto-increment keys, store defaults and an 8-byte concurrency token
//!   refreshed on every insert and update of a tokened table
//! - one writer at a time, with the writer's changes published atomically
//!   on commit
//!
//! # Example
//!
//! ```ignore
//! use folio_memory::{Database, MemoryConfig};
//!
//! let db = Database::new(&schema, MemoryConfig::default());
//! let conn = db.connect();
//! let rows = conn.query_sync(&select)?;
//! ```

mod connection;
mod database;
mod eval;
mod table;

pub use connection::{MemoryConnection, MemoryCursor, MemoryTransaction};
pub use database::Database;

use folio_query::Dialect;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Dialect used to render the statement log
    pub dialect: Dialect,
    /// Record every executed statement
    pub record_statements: bool,
    /// Starting point of the concurrency token sequence
    pub token_seed: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            record_statements: true,
            token_seed: 0,
        }
    }
}

impl MemoryConfig {
    pub const fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub const fn record_statements(mut self, record: bool) -> Self {
        self.record_statements = record;
        self
    }

    pub const fn token_seed(mut self, seed: u64) -> Self {
        self.token_seed = seed;
        self
    }
}
