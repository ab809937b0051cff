//! Unit of work: pending changes become one atomic transaction.
//!
//! A flush runs in three phases so no session lock is held across an await:
//!
//! 1. [`FlushPlan::build`] reads the change tracker, validates every added
//!    and modified instance, and orders the writes: inserts parent-first,
//!    then updates, then deletes child-first.
//! 2. [`FlushPlan::execute`] runs the writes inside a single store
//!    transaction. Keys the store generates for a parent are copied into
//!    children that reference it (see [`crate::Session::relate`]) before
//!    those children are inserted.
//! 3. [`FlushPlan::apply`] writes adopted keys and tokens back into the live
//!    instances and re-snapshots them. It only runs after commit, so a failed
//!    or cancelled flush leaves every instance and lifecycle state untouched.

use std::collections::HashMap;

use asupersync::{Cx, Outcome};
use folio_core::error::{ConflictError, FlushError};
use folio_core::{
    Connection, Delete, EntityDescriptor, Error, ExecuteResult, MutationKind, Record,
    ReferentialAction, RelationshipKind, Result, Statement, TransactionOps, ValidationError,
    ValidationErrorKind, ValidationScope, Value, validate_record,
};
use folio_query::plan::{delete_statement, dependents_delete, insert_statement, update_statement};

use crate::TrackingState;
use crate::change_tracker::{ChangeTracker, Fixup};
use crate::identity_map::EntityRef;

/// Counts of what a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Dependent rows removed by cascade sweeps ahead of their owners
    pub cascaded: u64,
}

impl FlushResult {
    /// Tracked instances written, cascade sweeps excluded.
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0 && self.cascaded == 0
    }
}

/// Knobs the session passes down from its config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushOptions {
    pub(crate) validate: bool,
    pub(crate) cascade_deletes: bool,
}

/// One write of the plan, over a copy of the instance's record.
#[derive(Debug)]
enum PendingOp {
    Insert {
        entity: EntityRef,
        record: Record,
        fixups: Vec<Fixup>,
    },
    Update {
        entity: EntityRef,
        record: Record,
        changed: Vec<usize>,
        key: Vec<Value>,
        token: Option<Value>,
    },
    Delete {
        entity: EntityRef,
        key: Vec<Value>,
        token: Option<Value>,
        /// Sweeps of cascade dependents, run before the keyed delete
        sweeps: Vec<Delete>,
    },
}

impl PendingOp {
    fn entity(&self) -> &EntityRef {
        match self {
            PendingOp::Insert { entity, .. }
            | PendingOp::Update { entity, .. }
            | PendingOp::Delete { entity, .. } => entity,
        }
    }

    fn mutation(&self) -> MutationKind {
        match self {
            PendingOp::Insert { .. } => MutationKind::Insert,
            PendingOp::Update { .. } => MutationKind::Update,
            PendingOp::Delete { .. } => MutationKind::Delete,
        }
    }
}

/// Store values to copy into live instances once the transaction commits.
#[derive(Debug, Default)]
pub(crate) struct Adopted {
    values: HashMap<EntityRef, Vec<(usize, Value)>>,
    result: FlushResult,
}

impl Adopted {
    fn push(&mut self, entity: &EntityRef, index: usize, value: Value) {
        self.values
            .entry(entity.clone())
            .or_default()
            .push((index, value));
    }

    /// The value a parent's field will hold after commit: adopted from an
    /// earlier insert in this flush, or its current value.
    fn current(&self, entity: &EntityRef, index: usize) -> Value {
        self.values
            .get(entity)
            .and_then(|vals| vals.iter().rev().find(|(i, _)| *i == index))
            .map_or_else(|| entity.read().value_at(index).clone(), |(_, v)| v.clone())
    }

    fn adopt_returned(&mut self, entity: &EntityRef, executed: &ExecuteResult) {
        let descriptor = entity.descriptor();
        let Some(row) = executed.returned.first() else {
            return;
        };
        for (column, value) in row.iter() {
            let index = descriptor
                .field_by_column(column)
                .and_then(|f| descriptor.field_index(f.name));
            if let Some(index) = index {
                self.push(entity, index, value.clone());
            }
        }
    }
}

/// Ordered writes for one flush.
#[derive(Debug, Default)]
pub(crate) struct FlushPlan {
    ops: Vec<PendingOp>,
}

impl FlushPlan {
    /// Collect and order everything pending. Fails with a validation error
    /// before any statement is planned.
    pub(crate) fn build(tracker: &ChangeTracker, options: FlushOptions) -> Result<Self> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for pending in tracker.pending() {
            let entity = pending.entity;
            let mut record = entity.record();
            let descriptor = record.descriptor();
            match pending.mutation {
                MutationKind::Insert => {
                    let fixups = tracker.fixups(&entity).to_vec();
                    for fixup in &fixups {
                        let parent = fixup.parent.read().value_at(fixup.parent_field).clone();
                        record.set_at(fixup.field, parent);
                    }
                    if options.validate {
                        validate_insert(&record, &fixups)?;
                    }
                    inserts.push((
                        descriptor.dependency_rank(),
                        PendingOp::Insert {
                            entity,
                            record,
                            fixups,
                        },
                    ));
                }
                MutationKind::Update => {
                    if let Some(&index) = pending
                        .changed
                        .iter()
                        .find(|&&i| descriptor.is_key(descriptor.fields[i].name))
                    {
                        let mut errors = ValidationError::for_entity(descriptor.name);
                        errors.add_custom(
                            descriptor.fields[index].name,
                            "key fields cannot change on a tracked instance",
                        );
                        return Err(Error::Validation(errors));
                    }
                    if options.validate {
                        validate_record(&record, ValidationScope::Update(&pending.changed))
                            .map_err(Error::Validation)?;
                    }
                    let key = tracker.original_key(&entity).unwrap_or_else(|| record.key());
                    let token = tracker.original_token(&entity);
                    updates.push(PendingOp::Update {
                        entity,
                        record,
                        changed: pending.changed,
                        key,
                        token,
                    });
                }
                MutationKind::Delete => {
                    let key = tracker.original_key(&entity).unwrap_or_else(|| record.key());
                    let token = tracker.original_token(&entity);
                    let sweeps = if options.cascade_deletes {
                        cascade_sweeps(&record)?
                    } else {
                        Vec::new()
                    };
                    deletes.push((
                        descriptor.dependency_rank(),
                        PendingOp::Delete {
                            entity,
                            key,
                            token,
                            sweeps,
                        },
                    ));
                }
            }
        }

        // stable sorts keep tracking order within a rank
        inserts.sort_by_key(|(rank, _)| *rank);
        deletes.sort_by_key(|(rank, _)| std::cmp::Reverse(*rank));

        let mut ops = Vec::with_capacity(inserts.len() + updates.len() + deletes.len());
        ops.extend(inserts.into_iter().map(|(_, op)| op));
        ops.extend(updates);
        ops.extend(deletes.into_iter().map(|(_, op)| op));
        Ok(Self { ops })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Run every write in one transaction. Nothing is committed unless all
    /// of them succeed.
    pub(crate) async fn execute<C: Connection>(&self, conn: &C, cx: &Cx) -> Outcome<Adopted, Error> {
        let tx = match conn.begin(cx).await {
            Outcome::Ok(tx) => tx,
            Outcome::Err(e) => return Outcome::Err(flush_failed(None, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut adopted = Adopted::default();
        for op in &self.ops {
            match execute_op(&tx, cx, op, &mut adopted).await {
                Outcome::Ok(()) => {}
                // dropping the transaction rolls it back
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        match tx.commit(cx).await {
            Outcome::Ok(()) => Outcome::Ok(adopted),
            Outcome::Err(e) => Outcome::Err(flush_failed(None, e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Bring the session in line with what was committed.
    pub(crate) fn apply(self, state: &mut TrackingState, adopted: Adopted) -> FlushResult {
        let Adopted { mut values, result } = adopted;
        for op in self.ops {
            let entity = op.entity().clone();
            if let Some(vals) = values.remove(&entity) {
                let mut record = entity.write();
                for (index, value) in vals {
                    record.set_at(index, value);
                }
            }
            match op.mutation() {
                MutationKind::Insert => {
                    if let Some(key) = entity.entity_key() {
                        if let Err(e) = state.map.insert(key, entity.clone()) {
                            tracing::warn!(error = %e, "inserted instance not registered");
                        }
                    }
                    state.tracker.snapshot(&entity);
                }
                MutationKind::Update => state.tracker.snapshot(&entity),
                MutationKind::Delete => {
                    forget(state, &entity);
                    forget_cascaded(state, &entity);
                }
            }
        }
        result
    }
}

async fn execute_op<T: TransactionOps>(
    tx: &T,
    cx: &Cx,
    op: &PendingOp,
    adopted: &mut Adopted,
) -> Outcome<(), Error> {
    let failed = |e| flush_failed(Some(op), e);
    match op {
        PendingOp::Insert {
            entity,
            record,
            fixups,
        } => {
            let mut record = record.clone();
            for fixup in fixups {
                let value = adopted.current(&fixup.parent, fixup.parent_field);
                record.set_at(fixup.field, value.clone());
                adopted.push(entity, fixup.field, value);
            }
            let statement = Statement::Insert(insert_statement(&record));
            tracing::debug!(kind = record.descriptor().name, "flush insert");
            let executed = match tx.execute(cx, &statement).await {
                Outcome::Ok(r) => r,
                Outcome::Err(e) => return Outcome::Err(failed(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            adopted.adopt_returned(entity, &executed);
            adopted.result.inserted += 1;
        }
        PendingOp::Update {
            entity,
            record,
            changed,
            key,
            token,
        } => {
            let statement = match update_statement(record, changed, key, token.as_ref()) {
                Ok(update) => Statement::Update(update),
                Err(e) => return Outcome::Err(failed(e)),
            };
            tracing::debug!(
                kind = record.descriptor().name,
                columns = changed.len(),
                "flush update"
            );
            let executed = match tx.execute(cx, &statement).await {
                Outcome::Ok(r) => r,
                Outcome::Err(e) => return Outcome::Err(failed(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if executed.rows_affected == 0 {
                return Outcome::Err(conflict(entity, key, MutationKind::Update));
            }
            adopted.adopt_returned(entity, &executed);
            adopted.result.updated += 1;
        }
        PendingOp::Delete {
            entity,
            key,
            token,
            sweeps,
        } => {
            for sweep in sweeps {
                let statement = Statement::Delete(sweep.clone());
                match tx.execute(cx, &statement).await {
                    Outcome::Ok(r) => adopted.result.cascaded += r.rows_affected,
                    Outcome::Err(e) => return Outcome::Err(failed(e)),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            let descriptor = entity.descriptor();
            let statement = match delete_statement(descriptor, key, token.as_ref()) {
                Ok(delete) => Statement::Delete(delete),
                Err(e) => return Outcome::Err(failed(e)),
            };
            tracing::debug!(kind = descriptor.name, "flush delete");
            let executed = match tx.execute(cx, &statement).await {
                Outcome::Ok(r) => r,
                Outcome::Err(e) => return Outcome::Err(failed(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if executed.rows_affected == 0 {
                return Outcome::Err(conflict(entity, key, MutationKind::Delete));
            }
            adopted.result.deleted += 1;
        }
    }
    Outcome::Ok(())
}

/// Insert-scope validation. A foreign key waiting on a parent's generated
/// key is not yet required to hold a value.
fn validate_insert(record: &Record, fixups: &[Fixup]) -> Result<()> {
    let Err(mut errors) = validate_record(record, ValidationScope::Insert) else {
        return Ok(());
    };
    let fields = record.descriptor().fields;
    errors.errors.retain(|e| {
        e.kind != ValidationErrorKind::Required
            || !fixups.iter().any(|f| fields[f.field].name == e.field)
    });
    errors.into_result().map_err(Error::Validation)
}

/// Deletes of every row owned through a cascading one-to-many relationship.
fn cascade_sweeps(record: &Record) -> Result<Vec<Delete>> {
    let descriptor = record.descriptor();
    let mut sweeps = Vec::new();
    for rel in descriptor.relationships {
        if rel.kind != RelationshipKind::OneToMany || rel.on_delete != ReferentialAction::Cascade {
            continue;
        }
        let local = descriptor.require_field(rel.local_field)?;
        let Some(value) = record.get(local.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let column = rel.target.require_field(rel.remote_field)?.column;
        sweeps.push(dependents_delete(rel.target, column, vec![value.clone()]));
    }
    Ok(sweeps)
}

fn forget(state: &mut TrackingState, entity: &EntityRef) {
    state.map.detach_instance(entity);
    state.tracker.untrack(entity);
}

/// Detach tracked instances the store removed by cascade along with `owner`.
fn forget_cascaded(state: &mut TrackingState, owner: &EntityRef) {
    let mut owners = vec![owner.record()];
    while let Some(record) = owners.pop() {
        let descriptor: &EntityDescriptor = record.descriptor();
        for rel in descriptor.relationships {
            if rel.kind != RelationshipKind::OneToMany || rel.on_delete != ReferentialAction::Cascade {
                continue;
            }
            let (Some(value), Some(remote)) = (
                record.get(rel.local_field),
                rel.target.field_index(rel.remote_field),
            ) else {
                continue;
            };
            for dependent in state.tracker.find_by_field(rel.target, remote, value) {
                tracing::trace!(kind = rel.target.name, "cascade-deleted instance detached");
                owners.push(dependent.record());
                forget(state, &dependent);
            }
        }
    }
}

fn conflict(entity: &EntityRef, key: &[Value], mutation: MutationKind) -> Error {
    let kind = entity.descriptor().name;
    tracing::warn!(kind, ?key, %mutation, "concurrency conflict");
    Error::ConcurrencyConflict(ConflictError {
        entity: kind,
        key: key.to_vec(),
        mutation,
    })
}

fn flush_failed(op: Option<&PendingOp>, source: Error) -> Error {
    if matches!(source, Error::ConcurrencyConflict(_) | Error::FlushFailed(_)) {
        return source;
    }
    tracing::warn!(error = %source, "flush failed");
    Error::FlushFailed(FlushError {
        entity: op.map(|o| o.entity().descriptor().name),
        mutation: op.map(PendingOp::mutation),
        source: Box::new(source),
    })
}
