//! Connections, transactions and cursors over a [`Database`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use folio_core::error::{
    ConnectionError, ConnectionErrorKind, Error, Result, TransactionError, TransactionErrorKind,
};
use folio_core::{
    Connection, Cx, ExecuteResult, IsolationLevel, Outcome, Row, RowCursor, Select, Statement,
    TransactionOps,
};
use folio_query::{render_select, render_sql};

use crate::database::Database;
use crate::table::{Scan, Tables};

/// Run a synchronous store operation unless the context is cancelled.
fn outcome<T>(cx: &Cx, op: impl FnOnce() -> Result<T>) -> Outcome<T, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    op().map_or_else(Outcome::Err, Outcome::Ok)
}

fn writer_active() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::WriterActive,
        message: "another transaction holds the write lock".to_string(),
    })
}

/// A connection to an in-memory [`Database`].
#[derive(Debug)]
pub struct MemoryConnection {
    db: Database,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db,
            closed: AtomicBool::new(false),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: "connection is closed".to_string(),
            }));
        }
        Ok(())
    }

    /// Execute a SELECT against committed data.
    pub fn query_sync(&self, select: &Select) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let mut shared = self.db.lock();
        let dialect = self.db.config().dialect;
        self.db.record(&mut shared, || render_select(select, dialect).0);
        shared.committed.select(select)
    }

    /// Execute a write in its own implicit transaction.
    pub fn execute_sync(&self, statement: &Statement) -> Result<ExecuteResult> {
        self.ensure_open()?;
        let mut shared = self.db.lock();
        if shared.writer_active {
            return Err(writer_active());
        }
        let dialect = self.db.config().dialect;
        self.db.record(&mut shared, || render_sql(statement, dialect));
        shared.committed.execute(statement)
    }

    fn begin_sync(&self, isolation: IsolationLevel) -> Result<MemoryTransaction<'_>> {
        self.ensure_open()?;
        let mut shared = self.db.lock();
        if shared.writer_active {
            tracing::warn!("begin rejected: another writer is active");
            return Err(writer_active());
        }
        shared.writer_active = true;
        self.db.record(&mut shared, || "BEGIN".to_string());
        tracing::debug!(isolation = isolation.as_sql(), "transaction started");
        Ok(MemoryTransaction {
            conn: self,
            working: Mutex::new(shared.committed.clone()),
            finished: false,
        })
    }

    fn open_cursor_sync(&self, select: &Select) -> Result<MemoryCursor> {
        self.ensure_open()?;
        let mut shared = self.db.lock();
        let dialect = self.db.config().dialect;
        self.db.record(&mut shared, || render_select(select, dialect).0);
        MemoryCursor::open(shared.committed.clone(), select)
    }
}

impl Connection for MemoryConnection {
    type Tx<'conn>
        = MemoryTransaction<'conn>
    where
        Self: 'conn;

    type Cursor = MemoryCursor;

    fn query(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = outcome(cx, || self.query_sync(select));
        async move { result }
    }

    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecuteResult, Error>> + Send {
        let result = outcome(cx, || self.execute_sync(statement));
        async move { result }
    }

    fn open_cursor(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<MemoryCursor, Error>> + Send {
        let result = outcome(cx, || self.open_cursor_sync(select));
        async move { result }
    }

    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let result = outcome(cx, || self.begin_sync(isolation));
        async move { result }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.ensure_open();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    async fn close(self, _cx: &Cx) -> Result<()> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::Release);
        tracing::debug!("connection closed");
        Ok(())
    }
}

// ── Transaction ───────────────────────────────────────────────────────────

/// A write transaction over a private copy of the database.
///
/// Only one transaction per database may be open at a time. Its writes
/// become visible to other connections all at once on commit; dropping it
/// uncommitted discards them.
pub struct MemoryTransaction<'conn> {
    conn: &'conn MemoryConnection,
    working: Mutex<Tables>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn query_sync(&self, select: &Select) -> Result<Vec<Row>> {
        let db = &self.conn.db;
        let dialect = db.config().dialect;
        db.record(&mut db.lock(), || render_select(select, dialect).0);
        self.working
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .select(select)
    }

    fn execute_sync(&self, statement: &Statement) -> Result<ExecuteResult> {
        let db = &self.conn.db;
        let dialect = db.config().dialect;
        db.record(&mut db.lock(), || render_sql(statement, dialect));
        self.working
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .execute(statement)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        if self.finished {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyFinished,
                message: "transaction already finished".to_string(),
            }));
        }
        self.finished = true;
        let working = std::mem::take(self.working.get_mut().unwrap_or_else(|e| e.into_inner()));
        let db = &self.conn.db;
        let mut shared = db.lock();
        if commit {
            shared.committed = working;
            db.record(&mut shared, || "COMMIT".to_string());
        } else {
            db.record(&mut shared, || "ROLLBACK".to_string());
        }
        shared.writer_active = false;
        tracing::debug!(commit, "transaction finished");
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish(false);
        }
    }
}

impl TransactionOps for MemoryTransaction<'_> {
    fn query(
        &self,
        cx: &Cx,
        select: &Select,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = outcome(cx, || self.query_sync(select));
        async move { result }
    }

    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecuteResult, Error>> + Send {
        let result = outcome(cx, || self.execute_sync(statement));
        async move { result }
    }

    fn commit(mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.finish(true);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.finish(false);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

// ── Cursor ────────────────────────────────────────────────────────────────

enum CursorState {
    /// Rows evaluated one at a time as the cursor advances
    Scan(Box<Scan>),
    /// Sorted, joined or grouped selects evaluate on the first advance
    Pending(Tables, Box<Select>),
    Buffered(VecDeque<Row>),
    Closed,
}

/// A forward-only cursor over a snapshot taken when it was opened.
///
/// Writes committed after the cursor opened are not visible to it.
pub struct MemoryCursor {
    state: CursorState,
}

impl MemoryCursor {
    fn open(snapshot: Tables, select: &Select) -> Result<Self> {
        let state = match snapshot.scan(select)? {
            Some(scan) => CursorState::Scan(Box::new(scan)),
            None => CursorState::Pending(snapshot, Box::new(select.clone())),
        };
        Ok(Self { state })
    }

    fn advance(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            self.state = CursorState::Closed;
            return Outcome::Cancelled(reason);
        }
        if let CursorState::Pending(tables, select) = &self.state {
            match tables.select(select) {
                Ok(rows) => self.state = CursorState::Buffered(rows.into()),
                Err(e) => {
                    self.state = CursorState::Closed;
                    return Outcome::Err(e);
                }
            }
        }
        let next = match &mut self.state {
            CursorState::Scan(scan) => scan.next_row(),
            CursorState::Buffered(rows) => Ok(rows.pop_front()),
            CursorState::Pending(..) | CursorState::Closed => Ok(None),
        };
        match next {
            Ok(Some(row)) => Outcome::Ok(Some(row)),
            Ok(None) => {
                self.state = CursorState::Closed;
                Outcome::Ok(None)
            }
            Err(e) => {
                self.state = CursorState::Closed;
                Outcome::Err(e)
            }
        }
    }
}

impl RowCursor for MemoryCursor {
    fn next_row(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self.advance(cx);
        async move { result }
    }

    fn close(&mut self) {
        self.state = CursorState::Closed;
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, CursorState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryConfig;
    use folio_core::{
        EntityDescriptor, Expr, FieldDescriptor, FieldType, Insert, KeyGeneration, Schema,
    };

    static NOTE: EntityDescriptor = EntityDescriptor {
        name: "Note",
        table: "notes",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt).generated(),
            FieldDescriptor::new("body", FieldType::Text).required(),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Store,
        concurrency_token: None,
        relationships: &[],
        indexes: &[],
        soft_filter: None,
    };

    fn database() -> Database {
        let schema = Schema::new(&[&NOTE]).unwrap();
        Database::new(&schema, MemoryConfig::default())
    }

    fn insert(body: &str) -> Statement {
        Statement::Insert(Insert {
            table: "notes".to_string(),
            values: vec![("body".to_string(), body.into())],
            returning: vec!["id".to_string()],
        })
    }

    fn block_on<F: Future>(f: F) -> F::Output {
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    #[test]
    fn autocommit_insert_generates_keys() {
        let db = database();
        let conn = db.connect();
        let first = conn.execute_sync(&insert("a")).unwrap();
        let second = conn.execute_sync(&insert("b")).unwrap();
        assert_eq!(first.returned[0].get(0), Some(&folio_core::Value::BigInt(1)));
        assert_eq!(second.returned[0].get(0), Some(&folio_core::Value::BigInt(2)));
        assert_eq!(db.row_count("notes").unwrap(), 2);
    }

    #[test]
    fn transaction_writes_are_private_until_commit() {
        let db = database();
        let writer = db.connect();
        let reader = db.connect();
        block_on(async {
            let cx = Cx::for_testing();
            let Outcome::Ok(tx) = writer.begin(&cx).await else {
                panic!("begin failed");
            };
            assert!(matches!(tx.execute(&cx, &insert("draft")).await, Outcome::Ok(_)));

            let select = Select::from_table("notes", "t0");
            assert!(reader.query_sync(&select).unwrap().is_empty());

            assert!(matches!(tx.commit(&cx).await, Outcome::Ok(())));
            assert_eq!(reader.query_sync(&select).unwrap().len(), 1);
        });
    }

    #[test]
    fn dropped_transaction_rolls_back_and_releases_writer() {
        let db = database();
        let conn = db.connect();
        block_on(async {
            let cx = Cx::for_testing();
            {
                let Outcome::Ok(tx) = conn.begin(&cx).await else {
                    panic!("begin failed");
                };
                let _ = tx.execute(&cx, &insert("lost")).await;
            }
            assert_eq!(db.row_count("notes").unwrap(), 0);
            assert!(matches!(conn.begin(&cx).await, Outcome::Ok(_)));
        });
        assert_eq!(
            db.statements().last().map(String::as_str),
            Some("ROLLBACK")
        );
    }

    #[test]
    fn finishing_twice_is_rejected() {
        let db = database();
        let conn = db.connect();
        block_on(async {
            let cx = Cx::for_testing();
            let Outcome::Ok(mut tx) = conn.begin(&cx).await else {
                panic!("begin failed");
            };
            let _ = tx.execute(&cx, &insert("kept")).await;
            assert!(tx.finish(true).is_ok());
            match tx.finish(false) {
                Err(Error::Transaction(e)) => {
                    assert_eq!(e.kind, TransactionErrorKind::AlreadyFinished);
                }
                other => panic!("expected already-finished error, got {other:?}"),
            }
        });
        assert_eq!(db.row_count("notes").unwrap(), 1);
        assert_eq!(
            db.statements().last().map(String::as_str),
            Some("COMMIT")
        );
    }

    #[test]
    fn second_writer_is_rejected() {
        let db = database();
        let first = db.connect();
        let second = db.connect();
        block_on(async {
            let cx = Cx::for_testing();
            let Outcome::Ok(_tx) = first.begin(&cx).await else {
                panic!("begin failed");
            };
            match second.begin(&cx).await {
                Outcome::Err(Error::Transaction(e)) => {
                    assert_eq!(e.kind, TransactionErrorKind::WriterActive);
                }
                _ => panic!("expected writer-active error"),
            }
            assert!(second.execute_sync(&insert("x")).is_err());
        });
    }

    #[test]
    fn cursor_reads_snapshot_lazily() {
        let db = database();
        let conn = db.connect();
        for body in ["a", "b", "c"] {
            conn.execute_sync(&insert(body)).unwrap();
        }
        block_on(async {
            let cx = Cx::for_testing();
            let select = Select::from_table("notes", "t0")
                .filter(Expr::qualified("t0", "body").ne("b"));
            let Outcome::Ok(mut cursor) = conn.open_cursor(&cx, &select).await else {
                panic!("open failed");
            };
            conn.execute_sync(&insert("d")).unwrap();

            let mut bodies = Vec::new();
            while let Outcome::Ok(Some(row)) = cursor.next_row(&cx).await {
                bodies.push(row.get_named::<String>("body").unwrap());
            }
            assert_eq!(bodies, vec!["a", "c"]);
            assert!(cursor.is_closed());
        });
    }

    #[test]
    fn close_leaves_other_connections_usable() {
        let db = database();
        let conn = db.connect();
        let other = db.connect();
        block_on(async {
            let cx = Cx::for_testing();
            assert!(conn.close(&cx).await.is_ok());
            assert!(other.is_valid(&cx).await);
        });
    }
}
