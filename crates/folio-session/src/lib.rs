//! Persistence session for Folio.
//!
//! `folio-session` is the **unit-of-work layer**. A [`Session`] owns one store
//! connection and coordinates object identity, change tracking and
//! transactional persistence over it.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one live instance per (kind, key) within a session.
//! - **Change tracking**: snapshots and diffs decide what a flush writes.
//! - **Unit of work**: every pending insert, update and delete is written in
//!   one transaction, guarded by concurrency tokens.
//! - **Materialization**: tracked, untracked and identity-resolved reads,
//!   projections, streams, and joined or split loading of collections.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no autoflush by default, and the tracking
//!   mode is a per-query choice rather than something inferred.
//! - **One operation at a time**: a session refuses a second store operation
//!   while a stream is open; see [`Error::ConnectionBusy`].
//! - **Cancel-correct**: async operations take a `Cx` and return `Outcome`.
//!   Buffered reads and flushes either complete or change nothing.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(db.connect());
//!
//! let books = session.load(&cx, &Query::new(&BOOK).include(Include::new("genre"))).await?;
//! books[0].entity().set("price", Value::Decimal("9.99".into()))?;
//!
//! let added = session.add(Record::new(&GENRE).with("name", "Essays")?)?;
//!
//! // one UPDATE of `price`, one INSERT, in one transaction
//! session.flush(&cx).await?;
//! session.close(&cx).await?;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod materialize;
pub mod stream;

pub use change_tracker::{ChangeTracker, EntityState, Pending, TrackedEntry};
pub use flush::FlushResult;
pub use identity_map::{EntityKey, EntityRef, IdentityMap};
pub use materialize::{EntityNode, Related};
pub use stream::{CancelHandle, EntityStream, RowStream};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use asupersync::{Cx, Outcome};
use folio_core::error::{IdentityError, IdentityErrorKind, NotFoundError, SchemaErrorKind};
use folio_core::{
    Connection, EntityDescriptor, Error, FromRow, Record, Result, Row, Statement, ValidationError,
    Value,
};
use folio_query::plan::{self, OWNER_ALIAS};
use folio_query::{BulkDelete, BulkUpdate, Projection, Query, QuerySplitting, Tracking};

use crate::change_tracker::Fixup;
use crate::flush::{FlushOptions, FlushPlan};
use crate::materialize::Resolver;
use crate::stream::StreamMode;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Flush pending changes before each tracked query.
    pub auto_flush: bool,
    /// Validate added and modified instances before a flush opens its
    /// transaction.
    pub validate_on_flush: bool,
    /// Delete store-side dependents of cascading relationships explicitly,
    /// ahead of their owner.
    pub cascade_deletes: bool,
    /// Tracking mode for queries that do not choose one.
    pub default_tracking: Tracking,
    /// Collection loading for queries that do not choose one.
    pub default_splitting: QuerySplitting,
    /// Reject streamed queries with includes instead of ignoring them.
    pub strict_streams: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: false,
            validate_on_flush: true,
            cascade_deletes: true,
            default_tracking: Tracking::Tracked,
            default_splitting: QuerySplitting::Single,
            strict_streams: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub const fn validate_on_flush(mut self, value: bool) -> Self {
        self.validate_on_flush = value;
        self
    }

    #[must_use]
    pub const fn cascade_deletes(mut self, value: bool) -> Self {
        self.cascade_deletes = value;
        self
    }

    #[must_use]
    pub const fn default_tracking(mut self, value: Tracking) -> Self {
        self.default_tracking = value;
        self
    }

    #[must_use]
    pub const fn default_splitting(mut self, value: QuerySplitting) -> Self {
        self.default_splitting = value;
        self
    }

    #[must_use]
    pub const fn strict_streams(mut self, value: bool) -> Self {
        self.strict_streams = value;
        self
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Identity map and change tracker of one session. Shared with tracked
/// streams, which resolve rows as they arrive.
#[derive(Debug, Default)]
pub(crate) struct TrackingState {
    pub(crate) map: IdentityMap,
    pub(crate) tracker: ChangeTracker,
}

pub(crate) fn lock_state(state: &Mutex<TrackingState>) -> MutexGuard<'_, TrackingState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks the session's connection as in use until dropped.
#[derive(Debug)]
pub(crate) struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("operation rejected: connection busy");
            return Err(Error::ConnectionBusy);
        }
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It tracks instances loaded from or added to the store and coordinates
/// flushing changes back. Store operations are serialized: while a stream
/// is open every other store operation fails with `ConnectionBusy`.
/// Operations that only touch tracking state (`add`, `remove`, ...) are
/// always allowed.
pub struct Session<C: Connection> {
    /// The store connection.
    connection: C,
    /// Configuration.
    config: SessionConfig,
    state: Arc<Mutex<TrackingState>>,
    busy: Arc<AtomicBool>,
}

impl<C: Connection> Session<C> {
    /// Create a new session from an existing connection.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        tracing::info!(?config, "session opened");
        Self {
            connection,
            config,
            state: Arc::new(Mutex::new(TrackingState::default())),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `body` with a fresh session and close it afterwards, whatever
    /// the body returned. A failure of the body wins over a failure to close.
    pub async fn scoped<T, F>(
        connection: C,
        config: SessionConfig,
        cx: &Cx,
        body: F,
    ) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Session<C>) -> Outcome<T, Error>,
    {
        let mut session = Self::with_config(connection, config);
        let outcome = body(&mut session).await;
        let closed = session.close(cx).await;
        match (outcome, closed) {
            (Outcome::Ok(value), Ok(())) => Outcome::Ok(value),
            (Outcome::Ok(_), Err(e)) => Outcome::Err(e),
            (other, _) => other,
        }
    }

    /// Close the session and its connection. Unflushed changes are
    /// discarded.
    pub async fn close(self, cx: &Cx) -> Result<()> {
        let pending = lock_state(&self.state).tracker.pending().len();
        if pending > 0 {
            tracing::warn!(pending, "session closed with unflushed changes");
        }
        tracing::info!("session closed");
        self.connection.close(cx).await
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Is a store operation (an open stream) holding the connection?
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<BusyGuard> {
        BusyGuard::acquire(&self.busy)
    }

    fn tracking_for(&self, query: &Query) -> Tracking {
        query.tracking_mode().unwrap_or(self.config.default_tracking)
    }

    fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            validate: self.config.validate_on_flush,
            cascade_deletes: self.config.cascade_deletes,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Execute a query and materialize every result before returning.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(entity = query.entity().name))]
    pub async fn load(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<EntityNode>, Error> {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let tracking = self.tracking_for(query);
        if tracking == Tracking::Tracked && self.config.auto_flush {
            match self.flush_unguarded(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let splitting = query
            .splitting_mode()
            .unwrap_or(self.config.default_splitting);
        let drafts = match materialize::fetch(&self.connection, cx, query, splitting).await {
            Outcome::Ok(drafts) => drafts,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let nodes = match tracking {
            Tracking::Tracked => {
                let mut state = lock_state(&self.state);
                materialize::resolve(drafts, &mut Resolver::Session(&mut *state))
            }
            Tracking::Untracked => materialize::resolve(drafts, &mut Resolver::Fresh),
            Tracking::UntrackedWithIdentityResolution => {
                let mut map = IdentityMap::new();
                materialize::resolve(drafts, &mut Resolver::Temporary(&mut map))
            }
        };
        tracing::debug!(results = nodes.len(), ?tracking, "query materialized");
        Outcome::Ok(nodes)
    }

    /// The first result of a query, with `LIMIT 1` applied by the store.
    pub async fn first(&mut self, cx: &Cx, query: &Query) -> Outcome<Option<EntityNode>, Error> {
        let limited = query.clone().limit(1);
        match self.load(cx, &limited).await {
            Outcome::Ok(nodes) => Outcome::Ok(nodes.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Number of rows the query would return.
    pub async fn count(&mut self, cx: &Cx, query: &Query) -> Outcome<u64, Error> {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let select = plan::count_select(query);
        let row = match self.connection.query_one(cx, &select).await {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let count = match row.map(|r| r.get_named::<i64>("count")).transpose() {
            Ok(count) => count.unwrap_or(0),
            Err(e) => return Outcome::Err(e),
        };
        Outcome::Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Execute a projection. Results are plain rows and never tracked.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = query.entity().name))]
    pub async fn project(
        &mut self,
        cx: &Cx,
        query: &Query,
        projection: &Projection,
    ) -> Outcome<Vec<Row>, Error> {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let select = match plan::projection_select(query, projection) {
            Ok(select) => select,
            Err(e) => return Outcome::Err(e),
        };
        self.connection.query(cx, &select).await
    }

    /// Execute a projection and convert each row into `T`.
    pub async fn project_as<T: FromRow>(
        &mut self,
        cx: &Cx,
        query: &Query,
        projection: &Projection,
    ) -> Outcome<Vec<T>, Error> {
        match self.project(cx, query, projection).await {
            Outcome::Ok(rows) => rows
                .iter()
                .map(T::from_row)
                .collect::<Result<Vec<T>>>()
                .map_or_else(Outcome::Err, Outcome::Ok),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Open a streamed query. The session stays busy until the stream is
    /// drained, closed or dropped.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(entity = query.entity().name))]
    pub async fn stream(&mut self, cx: &Cx, query: &Query) -> Outcome<EntityStream<C>, Error> {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        match query.include_tree() {
            Ok(tree) if tree.is_empty() => {}
            Ok(_) if self.config.strict_streams => {
                return Outcome::Err(Error::unsupported(
                    "streamed queries cannot include relationships",
                ));
            }
            Ok(_) => tracing::warn!("includes ignored on a streamed query"),
            Err(e) => return Outcome::Err(e),
        }
        let tracking = self.tracking_for(query);
        if tracking == Tracking::Tracked && self.config.auto_flush {
            match self.flush_unguarded(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let cursor = match self.connection.open_cursor(cx, &plan::owner_select(query)).await {
            Outcome::Ok(cursor) => cursor,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mode = match tracking {
            Tracking::Tracked => StreamMode::Tracked(Arc::clone(&self.state)),
            Tracking::Untracked => StreamMode::Fresh,
            Tracking::UntrackedWithIdentityResolution => {
                StreamMode::IdentityResolved(IdentityMap::new())
            }
        };
        Outcome::Ok(EntityStream::new(cursor, guard, query.entity(), mode))
    }

    /// Open a streamed projection.
    pub async fn stream_projection(
        &mut self,
        cx: &Cx,
        query: &Query,
        projection: &Projection,
    ) -> Outcome<RowStream<C>, Error> {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let select = match plan::projection_select(query, projection) {
            Ok(select) => select,
            Err(e) => return Outcome::Err(e),
        };
        match self.connection.open_cursor(cx, &select).await {
            Outcome::Ok(cursor) => Outcome::Ok(RowStream::new(cursor, guard)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Look up an instance by key, consulting the identity map before the
    /// store. An instance marked for deletion is not found.
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        key: &[Value],
    ) -> Outcome<Option<EntityRef>, Error> {
        let cached = {
            let state = lock_state(&self.state);
            state
                .map
                .get(&EntityKey::new(entity, key.to_vec()))
                .map(|e| (e.clone(), state.tracker.state_of(e)))
        };
        if let Some((found, state)) = cached {
            tracing::trace!(kind = entity.name, ?key, "found in identity map");
            return Outcome::Ok((state != EntityState::Deleted).then_some(found));
        }

        let query = match Query::new(entity).by_key(key) {
            Ok(query) => query.tracking(Tracking::Tracked),
            Err(e) => return Outcome::Err(e),
        };
        match self.first(cx, &query).await {
            Outcome::Ok(node) => Outcome::Ok(node.map(EntityNode::into_entity)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Like [`find`](Session::find), but absence is a `NotFound` error.
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        key: &[Value],
    ) -> Outcome<EntityRef, Error> {
        match self.find(cx, entity, key).await {
            Outcome::Ok(Some(found)) => Outcome::Ok(found),
            Outcome::Ok(None) => Outcome::Err(Error::NotFound(NotFoundError {
                entity: entity.name,
                key: key.to_vec(),
            })),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Refresh an instance's values and snapshot from the store, discarding
    /// local edits. Soft filters do not apply.
    pub async fn reload(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let descriptor = entity.descriptor();
        let key = lock_state(&self.state)
            .tracker
            .original_key(entity)
            .unwrap_or_else(|| entity.key());
        let select = match plan::key_select(descriptor, &key, true) {
            Ok(select) => select,
            Err(e) => return Outcome::Err(e),
        };
        let row = match self.connection.query_one(cx, &select).await {
            Outcome::Ok(Some(row)) => row,
            Outcome::Ok(None) => {
                return Outcome::Err(Error::NotFound(NotFoundError {
                    entity: descriptor.name,
                    key,
                }));
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let record = match Record::from_row(descriptor, &row, Some(OWNER_ALIAS)) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Outcome::Err(Error::NotFound(NotFoundError {
                    entity: descriptor.name,
                    key,
                }));
            }
            Err(e) => return Outcome::Err(e),
        };
        entity.overwrite(&record);
        lock_state(&self.state).tracker.snapshot(entity);
        tracing::debug!(kind = descriptor.name, ?key, "instance reloaded");
        Outcome::Ok(())
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track a new instance; it is inserted on the next flush.
    ///
    /// An instance whose key is already assigned is registered in the
    /// identity map right away and fails if another instance holds the key.
    pub fn add(&mut self, record: Record) -> Result<EntityRef> {
        let entity = EntityRef::new(record);
        let mut state = lock_state(&self.state);
        if let Some(key) = entity.entity_key() {
            state.map.insert(key, entity.clone())?;
        }
        state.tracker.mark_added(&entity);
        tracing::trace!(kind = entity.descriptor().name, "instance added");
        Ok(entity)
    }

    /// Track an existing row as Unchanged, with `record` as its snapshot.
    pub fn attach(&mut self, record: Record) -> Result<EntityRef> {
        let entity = self.register(record)?;
        lock_state(&self.state).tracker.track_unchanged(&entity);
        Ok(entity)
    }

    /// Track an existing row as Modified: every non-key field is written on
    /// the next flush, whatever the store holds.
    pub fn update(&mut self, record: Record) -> Result<EntityRef> {
        let entity = self.register(record)?;
        lock_state(&self.state).tracker.track_modified(&entity);
        Ok(entity)
    }

    fn register(&mut self, record: Record) -> Result<EntityRef> {
        let Some(key) = EntityKey::of(&record) else {
            let descriptor = record.descriptor();
            let mut errors = ValidationError::for_entity(descriptor.name);
            for name in descriptor.key {
                errors.add_required(*name);
            }
            return Err(Error::Validation(errors));
        };
        let entity = EntityRef::new(record);
        lock_state(&self.state).map.insert(key, entity.clone())?;
        Ok(entity)
    }

    /// Mark a tracked instance for deletion. Removing an instance that was
    /// only added forgets it.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        let mut state = lock_state(&self.state);
        if !state.tracker.is_tracked(entity) {
            return Err(not_tracked(entity));
        }
        if !state.tracker.mark_deleted(entity) {
            state.map.detach_instance(entity);
        }
        Ok(())
    }

    /// Stop tracking an instance. Later changes to it are ignored by flush.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        let mut state = lock_state(&self.state);
        let mapped = state.map.detach_instance(entity);
        state.tracker.untrack(entity) || mapped
    }

    /// Drop every tracked instance and pending change. Store state is not
    /// touched.
    pub fn clear(&mut self) {
        let mut state = lock_state(&self.state);
        state.map.clear();
        state.tracker.clear();
        tracing::debug!("session tracking cleared");
    }

    /// Record that `child.field` references `parent`, whose key may not be
    /// assigned yet. The flush copies the parent's key into the child once
    /// the parent is inserted.
    pub fn relate(&mut self, child: &EntityRef, field: &str, parent: &EntityRef) -> Result<()> {
        let descriptor = child.descriptor();
        let index = field_position(descriptor, field)?;
        let target = descriptor.fields[index].references.ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::Invalid,
                format!("{}.{} is not a foreign key", descriptor.name, field),
            )
        })?;
        let parent_descriptor = parent.descriptor();
        if !target.target.same_kind(parent_descriptor) {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "{}.{} references {}, not {}",
                    descriptor.name, field, target.target.name, parent_descriptor.name
                ),
            ));
        }
        let parent_field = field_position(parent_descriptor, target.field)?;

        let current = parent.read().value_at(parent_field).clone();
        if !current.is_null() {
            child.write().set_at(index, current);
        }
        let fixup = Fixup {
            field: index,
            parent: parent.clone(),
            parent_field,
        };
        if lock_state(&self.state).tracker.add_fixup(child, fixup) {
            Ok(())
        } else {
            Err(not_tracked(child))
        }
    }

    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        lock_state(&self.state).tracker.state_of(entity)
    }

    /// Every tracked instance with its state, in tracking order.
    pub fn entries(&self) -> Vec<TrackedEntry> {
        lock_state(&self.state).tracker.entries()
    }

    pub fn has_changes(&self) -> bool {
        lock_state(&self.state).tracker.has_changes()
    }

    pub fn tracked_count(&self) -> usize {
        lock_state(&self.state).tracker.len()
    }

    /// Is `entity` the session's instance for its key?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        let state = lock_state(&self.state);
        entity
            .entity_key()
            .and_then(|key| state.map.get(&key).cloned())
            .is_some_and(|mapped| EntityRef::ptr_eq(&mapped, entity))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write every pending change in one transaction.
    ///
    /// On a concurrency conflict or store failure nothing is written and
    /// every tracked instance keeps its state, so the flush can be retried.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        self.flush_unguarded(cx).await
    }

    async fn flush_unguarded(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let built = FlushPlan::build(&lock_state(&self.state).tracker, self.flush_options());
        let plan = match built {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "flush rejected before writing");
                return Outcome::Err(e);
            }
        };
        if plan.is_empty() {
            tracing::trace!("nothing to flush");
            return Outcome::Ok(FlushResult::default());
        }

        tracing::debug!(operations = plan.len(), "flushing");
        let adopted = match plan.execute(&self.connection, cx).await {
            Outcome::Ok(adopted) => adopted,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = plan.apply(&mut lock_state(&self.state), adopted);
        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            cascaded = result.cascaded,
            "flush committed"
        );
        Outcome::Ok(result)
    }

    /// Set-based UPDATE straight against the store.
    ///
    /// Runs immediately and independently of flush. Tracked instances of the
    /// affected rows keep their in-memory values until reloaded.
    pub async fn bulk_update(&mut self, cx: &Cx, bulk: &BulkUpdate) -> Outcome<u64, Error> {
        let statement = match plan::bulk_update_statement(bulk) {
            Ok(update) => Statement::Update(update),
            Err(e) => return Outcome::Err(e),
        };
        self.execute_bulk(cx, bulk.entity(), &statement).await
    }

    /// Set-based DELETE straight against the store. Same contract as
    /// [`bulk_update`](Session::bulk_update).
    pub async fn bulk_delete(&mut self, cx: &Cx, bulk: &BulkDelete) -> Outcome<u64, Error> {
        let statement = Statement::Delete(plan::bulk_delete_statement(bulk));
        self.execute_bulk(cx, bulk.entity(), &statement).await
    }

    async fn execute_bulk(
        &mut self,
        cx: &Cx,
        entity: &'static EntityDescriptor,
        statement: &Statement,
    ) -> Outcome<u64, Error> {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        match self.connection.execute(cx, statement).await {
            Outcome::Ok(result) => {
                tracing::info!(
                    kind = entity.name,
                    affected = result.rows_affected,
                    "bulk mutation executed"
                );
                Outcome::Ok(result.rows_affected)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

fn field_position(descriptor: &EntityDescriptor, field: &str) -> Result<usize> {
    descriptor.field_index(field).ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::FieldNotFound,
            format!("{} has no field '{}'", descriptor.name, field),
        )
    })
}

fn not_tracked(entity: &EntityRef) -> Error {
    Error::Identity(IdentityError {
        kind: IdentityErrorKind::NotTracked,
        entity: entity.descriptor().name,
        key: entity.key(),
    })
}
