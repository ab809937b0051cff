//! Streamed query results.
//!
//! A stream owns the store cursor for its whole lifetime and keeps the
//! session marked busy until it is drained, closed or dropped. Any other
//! session operation in the meantime fails with
//! [`Error::ConnectionBusy`](folio_core::Error::ConnectionBusy).
//!
//! Streams can be cancelled two ways: the `Cx` passed to `next` being
//! cancelled, or a [`CancelHandle`] taken from the stream. Either aborts the
//! stream with [`Error::StreamAborted`](folio_core::Error::StreamAborted) and
//! releases the cursor. Items produced before the cancellation stay valid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use asupersync::{Cx, Outcome};
use folio_core::{Connection, EntityDescriptor, Error, Record, Row, RowCursor};
use folio_query::OWNER_ALIAS;

use crate::identity_map::{EntityRef, IdentityMap};
use crate::materialize::Resolver;
use crate::{BusyGuard, TrackingState, lock_state};

/// Requests cancellation of a stream from outside the loop consuming it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cursor plus the busy guard it holds.
struct Source<C: Connection> {
    cursor: Option<C::Cursor>,
    guard: Option<BusyGuard>,
    cancel: CancelHandle,
    produced: u64,
}

impl<C: Connection> Source<C> {
    fn new(cursor: C::Cursor, guard: BusyGuard) -> Self {
        Self {
            cursor: Some(cursor),
            guard: Some(guard),
            cancel: CancelHandle::default(),
            produced: 0,
        }
    }

    fn release(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
        self.guard = None;
    }

    /// Closed once the busy guard is gone, whatever released it.
    fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    fn abort(&mut self, reason: String) -> Error {
        tracing::warn!(produced = self.produced, reason = %reason, "stream aborted");
        self.release();
        Error::StreamAborted(reason)
    }

    async fn next_row(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        if self.cancel.is_cancelled() && self.cursor.is_some() {
            return Outcome::Err(self.abort("cancelled by handle".to_string()));
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Outcome::Ok(None);
        };
        match cursor.next_row(cx).await {
            Outcome::Ok(Some(row)) => {
                self.produced += 1;
                Outcome::Ok(Some(row))
            }
            Outcome::Ok(None) => {
                tracing::debug!(produced = self.produced, "stream drained");
                self.release();
                Outcome::Ok(None)
            }
            Outcome::Err(e) => {
                self.release();
                Outcome::Err(e)
            }
            Outcome::Cancelled(reason) => Outcome::Err(self.abort(format!("{reason:?}"))),
            Outcome::Panicked(p) => {
                self.release();
                Outcome::Panicked(p)
            }
        }
    }
}

/// How a streamed entity row becomes an instance.
pub(crate) enum StreamMode {
    Tracked(Arc<Mutex<TrackingState>>),
    IdentityResolved(IdentityMap),
    Fresh,
}

/// A lazy, forward-only sequence of entity instances.
///
/// Each call to [`next`](EntityStream::next) advances the store cursor by
/// one row. Tracked streams register instances in the session as they are
/// produced.
pub struct EntityStream<C: Connection> {
    source: Source<C>,
    entity: &'static EntityDescriptor,
    mode: StreamMode,
}

impl<C: Connection> EntityStream<C> {
    pub(crate) fn new(
        cursor: C::Cursor,
        guard: BusyGuard,
        entity: &'static EntityDescriptor,
        mode: StreamMode,
    ) -> Self {
        Self {
            source: Source::new(cursor, guard),
            entity,
            mode,
        }
    }

    /// The next instance, or `None` once the cursor is exhausted.
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<EntityRef>, Error> {
        loop {
            let row = match self.source.next_row(cx).await {
                Outcome::Ok(Some(row)) => row,
                Outcome::Ok(None) => return Outcome::Ok(None),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let record = match Record::from_row(self.entity, &row, Some(OWNER_ALIAS)) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    self.source.release();
                    return Outcome::Err(e);
                }
            };
            let entity = match &mut self.mode {
                StreamMode::Tracked(state) => {
                    let mut state = lock_state(state);
                    Resolver::Session(&mut *state).resolve(record)
                }
                StreamMode::IdentityResolved(map) => Resolver::Temporary(map).resolve(record),
                StreamMode::Fresh => Resolver::Fresh.resolve(record),
            };
            return Outcome::Ok(Some(entity));
        }
    }

    /// Drain the rest of the stream.
    pub async fn collect(mut self, cx: &Cx) -> Outcome<Vec<EntityRef>, Error> {
        let mut out = Vec::new();
        loop {
            match self.next(cx).await {
                Outcome::Ok(Some(entity)) => out.push(entity),
                Outcome::Ok(None) => return Outcome::Ok(out),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.source.cancel.clone()
    }

    /// Release the cursor and the session without draining.
    pub fn close(&mut self) {
        self.source.release();
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }

    /// Instances produced so far.
    pub fn produced(&self) -> u64 {
        self.source.produced
    }
}

/// A lazy, forward-only sequence of projection rows. Never tracked.
pub struct RowStream<C: Connection> {
    source: Source<C>,
}

impl<C: Connection> RowStream<C> {
    pub(crate) fn new(cursor: C::Cursor, guard: BusyGuard) -> Self {
        Self {
            source: Source::new(cursor, guard),
        }
    }

    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        self.source.next_row(cx).await
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.source.cancel.clone()
    }

    pub fn close(&mut self) {
        self.source.release();
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }

    pub fn produced(&self) -> u64 {
        self.source.produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_handle_is_shared_between_clones() {
        let handle = CancelHandle::default();
        let copy = handle.clone();
        assert!(!copy.is_cancelled());
        handle.cancel();
        assert!(copy.is_cancelled());
    }

    #[test]
    fn busy_guard_releases_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = BusyGuard::acquire(&flag).unwrap();
        assert!(matches!(BusyGuard::acquire(&flag), Err(Error::ConnectionBusy)));
        drop(guard);
        assert!(BusyGuard::acquire(&flag).is_ok());
    }
}
