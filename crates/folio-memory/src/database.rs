//! Shared database state.

use std::sync::{Arc, Mutex, MutexGuard};

use folio_core::error::Result;
use folio_core::{Row, Schema};

use crate::MemoryConfig;
use crate::connection::MemoryConnection;
use crate::table::Tables;

/// State shared by every connection to one database.
#[derive(Debug)]
pub(crate) struct Shared {
    /// Last committed image; what every reader outside a transaction sees
    pub(crate) committed: Tables,
    /// A transaction holds the write lock
    pub(crate) writer_active: bool,
    log: Vec<String>,
}

/// An in-memory relational database.
///
/// Cloning is cheap and yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct Database {
    shared: Arc<Mutex<Shared>>,
    config: MemoryConfig,
}

impl Database {
    /// Create an empty database with one table per entity kind.
    pub fn new(schema: &Schema, config: MemoryConfig) -> Self {
        tracing::info!(
            tables = schema.entities().len(),
            dialect = ?config.dialect,
            "in-memory database created"
        );
        Self {
            shared: Arc::new(Mutex::new(Shared {
                committed: Tables::new(schema, config.token_seed),
                writer_active: false,
                log: Vec::new(),
            })),
            config,
        }
    }

    /// Open a new connection to this database.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone())
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Statements executed so far, rendered as SQL.
    pub fn statements(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_statements(&self) {
        self.lock().log.clear();
    }

    /// Number of committed rows in a table.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.lock().committed.table(table)?.rows.len())
    }

    /// Committed rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.lock().committed.dump(table)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the statement log when recording is on.
    pub(crate) fn record(&self, shared: &mut Shared, sql: impl FnOnce() -> String) {
        if self.config.record_statements {
            let sql = sql();
            tracing::trace!(sql = %sql, "statement");
            shared.log.push(sql);
        }
    }
}
