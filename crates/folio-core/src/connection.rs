//! Store connection traits.
//!
//! This module defines the seams between the session and a relational store:
//!
//! - [`Connection`] - executes structured statements and opens transactions
//! - [`TransactionOps`] - statements inside one atomic transaction
//! - [`RowCursor`] - a forward-only result cursor for streamed reads
//! - [`IsolationLevel`] - transaction isolation levels
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation.

use asupersync::{Cx, Outcome};

use crate::error::Result;
use crate::row::Row;
use crate::statement::{ExecuteResult, Select, Statement};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read committed: transactions only see committed changes from others.
    /// The minimum the session relies on for optimistic concurrency.
    #[default]
    ReadCommitted,

    /// Repeatable read: transactions see a consistent snapshot.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// A connection to a relational store.
///
/// Connections execute statements directly (autocommit) or inside a
/// transaction from [`begin`](Connection::begin). Reads outside a transaction
/// see committed data only.
pub trait Connection: Send + Sync {
    /// The transaction type returned by this connection.
    type Tx<'conn>: TransactionOps
    where
        Self: 'conn;

    /// The cursor type returned by [`open_cursor`](Connection::open_cursor).
    type Cursor: RowCursor;

    /// Execute a SELECT and return all rows.
    fn query(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a SELECT and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send {
        async move {
            let limited = select.clone().limit(1);
            match self.query(cx, &limited).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Execute a write statement outside any transaction.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecuteResult, crate::Error>> + Send;

    /// Open a forward-only cursor over the rows of a SELECT.
    ///
    /// Rows are produced as the cursor advances. The cursor must be drained
    /// or closed before the caller issues its next operation.
    fn open_cursor(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Self::Cursor, crate::Error>> + Send;

    /// Begin a transaction with default isolation level (ReadCommitted).
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send {
        self.begin_with(cx, IsolationLevel::default())
    }

    /// Begin a transaction with a specific isolation level.
    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send;

    /// Check if the connection is still usable.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Check if the connection is still valid (alias for ping that returns bool).
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }

    /// Close the connection gracefully.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

/// Statements inside one atomic transaction.
///
/// Dropping a transaction without calling [`commit`](TransactionOps::commit)
/// rolls it back.
pub trait TransactionOps: Send {
    /// Execute a SELECT within this transaction.
    fn query(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a write within this transaction.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecuteResult, crate::Error>> + Send;

    /// Commit the transaction, making all changes visible at once.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

/// A forward-only, single-pass result cursor.
pub trait RowCursor: Send {
    /// Advance and return the next row, or `None` when exhausted.
    fn next_row(
        &mut self,
        cx: &Cx,
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send;

    /// Release the cursor early. Later calls to `next_row` return `None`.
    fn close(&mut self);

    /// Has the cursor been exhausted or closed?
    fn is_closed(&self) -> bool;
}
