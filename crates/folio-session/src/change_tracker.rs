//! Snapshot-based change tracking.
//!
//! Every tracked instance carries the field values it had when it entered
//! the session or was last flushed. Comparing current values against that
//! snapshot yields the changed-field set, which the flush engine turns into
//! an UPDATE of exactly those columns.

use std::collections::HashMap;

use folio_core::{MutationKind, Value};

use crate::identity_map::EntityRef;

/// Lifecycle state of an instance as seen by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Tracked; values match the snapshot
    Unchanged,
    /// Tracked; at least one field differs from the snapshot
    Modified,
    /// New; inserted on the next flush
    Added,
    /// Removed; deleted on the next flush
    Deleted,
    /// Not tracked by the session
    Detached,
}

/// Explicit lifecycle marker. `Modified` is never stored; it is derived by
/// diffing against the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Persistent,
    Added,
    Deleted,
}

/// A foreign key to fill from a parent's key once the parent is inserted.
#[derive(Debug, Clone)]
pub(crate) struct Fixup {
    pub(crate) field: usize,
    pub(crate) parent: EntityRef,
    pub(crate) parent_field: usize,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    mark: Mark,
    snapshot: Vec<Value>,
    /// Write every non-key field on the next update, changed or not
    full_update: bool,
    fixups: Vec<Fixup>,
}

/// One mutation the next flush must perform.
#[derive(Debug, Clone)]
pub struct Pending {
    pub entity: EntityRef,
    pub mutation: MutationKind,
    /// Field positions to write (updates only)
    pub changed: Vec<usize>,
}

/// A tracked instance and its current state.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub entity: EntityRef,
    pub state: EntityState,
}

/// Tracks lifecycle state and snapshots, keyed by instance identity.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: HashMap<EntityRef, Entry>,
    next_seq: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, entity: &EntityRef, mark: Mark, full_update: bool) {
        let snapshot = entity.read().values().to_vec();
        self.next_seq += 1;
        self.entries.insert(
            entity.clone(),
            Entry {
                seq: self.next_seq,
                mark,
                snapshot,
                full_update,
                fixups: Vec::new(),
            },
        );
    }

    /// Track a loaded instance with its current values as the baseline.
    pub fn track_unchanged(&mut self, entity: &EntityRef) {
        tracing::trace!(kind = entity.descriptor().name, "snapshot taken");
        self.insert(entity, Mark::Persistent, false);
    }

    /// Track an instance whose every non-key field is written on flush.
    pub fn track_modified(&mut self, entity: &EntityRef) {
        self.insert(entity, Mark::Persistent, true);
    }

    pub fn mark_added(&mut self, entity: &EntityRef) {
        self.insert(entity, Mark::Added, false);
    }

    /// Mark for deletion. An instance that was only added is forgotten
    /// instead, since the store never saw it; returns false in that case.
    pub fn mark_deleted(&mut self, entity: &EntityRef) -> bool {
        let Some(entry) = self.entries.get_mut(entity) else {
            return false;
        };
        if entry.mark == Mark::Added {
            self.entries.remove(entity);
            return false;
        }
        entry.mark = Mark::Deleted;
        true
    }

    /// Replace the baseline with current values and clear explicit marks.
    /// Called after a successful flush or a reload.
    pub fn snapshot(&mut self, entity: &EntityRef) {
        if let Some(entry) = self.entries.get_mut(entity) {
            entry.snapshot = entity.read().values().to_vec();
            entry.mark = Mark::Persistent;
            entry.full_update = false;
            entry.fixups.clear();
        }
    }

    pub fn untrack(&mut self, entity: &EntityRef) -> bool {
        self.entries.remove(entity).is_some()
    }

    pub fn is_tracked(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(entity)
    }

    /// Changed field positions, excluding the concurrency token.
    ///
    /// `None` for untracked, added and deleted instances, which have no
    /// meaningful diff.
    pub fn diff(&self, entity: &EntityRef) -> Option<Vec<usize>> {
        let entry = self.entries.get(entity)?;
        if entry.mark != Mark::Persistent {
            return None;
        }
        let record = entity.read();
        let descriptor = record.descriptor();
        let changed = descriptor
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_token())
            .filter(|(i, f)| {
                if entry.full_update {
                    !descriptor.is_key(f.name)
                } else {
                    record.value_at(*i) != &entry.snapshot[*i]
                }
            })
            .map(|(i, _)| i)
            .collect();
        Some(changed)
    }

    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        let Some(entry) = self.entries.get(entity) else {
            return EntityState::Detached;
        };
        match entry.mark {
            Mark::Added => EntityState::Added,
            Mark::Deleted => EntityState::Deleted,
            Mark::Persistent => {
                if self.diff(entity).is_some_and(|d| !d.is_empty()) {
                    EntityState::Modified
                } else {
                    EntityState::Unchanged
                }
            }
        }
    }

    /// Snapshot value of a field, as last loaded or flushed.
    pub fn original(&self, entity: &EntityRef, index: usize) -> Option<&Value> {
        self.entries.get(entity).and_then(|e| e.snapshot.get(index))
    }

    /// Snapshot key values, used in write predicates.
    pub fn original_key(&self, entity: &EntityRef) -> Option<Vec<Value>> {
        let entry = self.entries.get(entity)?;
        let descriptor = entity.descriptor();
        Some(
            descriptor
                .key_indices()
                .into_iter()
                .map(|i| entry.snapshot[i].clone())
                .collect(),
        )
    }

    /// Snapshot token, used in write predicates.
    pub fn original_token(&self, entity: &EntityRef) -> Option<Value> {
        let index = entity.descriptor().token_index()?;
        self.original(entity, index).cloned()
    }

    pub(crate) fn add_fixup(&mut self, entity: &EntityRef, fixup: Fixup) -> bool {
        match self.entries.get_mut(entity) {
            Some(entry) => {
                entry.fixups.retain(|f| f.field != fixup.field);
                entry.fixups.push(fixup);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fixups(&self, entity: &EntityRef) -> &[Fixup] {
        self.entries
            .get(entity)
            .map(|e| e.fixups.as_slice())
            .unwrap_or_default()
    }

    /// Every instance with work for the next flush, in the order it was
    /// tracked.
    pub fn pending(&self) -> Vec<Pending> {
        let mut ordered: Vec<(&EntityRef, &Entry)> = self.entries.iter().collect();
        ordered.sort_by_key(|(_, e)| e.seq);
        ordered
            .into_iter()
            .filter_map(|(entity, entry)| {
                let (mutation, changed) = match entry.mark {
                    Mark::Added => (MutationKind::Insert, Vec::new()),
                    Mark::Deleted => (MutationKind::Delete, Vec::new()),
                    Mark::Persistent => {
                        let changed = self.diff(entity)?;
                        if changed.is_empty() {
                            return None;
                        }
                        (MutationKind::Update, changed)
                    }
                };
                Some(Pending {
                    entity: entity.clone(),
                    mutation,
                    changed,
                })
            })
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.entries
            .keys()
            .any(|e| !matches!(self.state_of(e), EntityState::Unchanged))
    }

    pub fn entries(&self) -> Vec<TrackedEntry> {
        let mut ordered: Vec<(&EntityRef, &Entry)> = self.entries.iter().collect();
        ordered.sort_by_key(|(_, e)| e.seq);
        ordered
            .into_iter()
            .map(|(entity, _)| TrackedEntry {
                entity: entity.clone(),
                state: self.state_of(entity),
            })
            .collect()
    }

    /// Tracked instances of a kind whose `field` holds `value`.
    pub(crate) fn find_by_field(
        &self,
        kind: &folio_core::EntityDescriptor,
        field: usize,
        value: &Value,
    ) -> Vec<EntityRef> {
        self.entries
            .keys()
            .filter(|e| {
                let record = e.read();
                record.descriptor().same_kind(kind) && record.value_at(field) == value
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{EntityDescriptor, FieldDescriptor, FieldType, KeyGeneration, Record};

    static NOTE: EntityDescriptor = EntityDescriptor {
        name: "Note",
        table: "notes",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt),
            FieldDescriptor::new("title", FieldType::Text),
            FieldDescriptor::new("body", FieldType::Text),
            FieldDescriptor::new("version", FieldType::Token),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Client,
        concurrency_token: Some("version"),
        relationships: &[],
        indexes: &[],
        soft_filter: None,
    };

    fn note() -> EntityRef {
        EntityRef::new(
            Record::new(&NOTE)
                .with("id", 1_i64)
                .unwrap()
                .with("title", "draft")
                .unwrap()
                .with("body", "text")
                .unwrap(),
        )
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let mut tracker = ChangeTracker::new();
        let entity = note();
        tracker.track_unchanged(&entity);
        assert_eq!(tracker.state_of(&entity), EntityState::Unchanged);
        assert!(tracker.pending().is_empty());

        entity.set("body", "revised").unwrap();
        assert_eq!(tracker.diff(&entity), Some(vec![2]));
        assert_eq!(tracker.state_of(&entity), EntityState::Modified);

        // restoring the original value makes it clean again
        entity.set("body", "text").unwrap();
        assert_eq!(tracker.state_of(&entity), EntityState::Unchanged);
    }

    #[test]
    fn token_changes_are_not_field_changes() {
        let mut tracker = ChangeTracker::new();
        let entity = note();
        tracker.track_unchanged(&entity);
        entity
            .set("version", Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0, 9]))
            .unwrap();
        assert_eq!(tracker.diff(&entity), Some(vec![]));
        assert_eq!(tracker.original_token(&entity), Some(Value::Null));
    }

    #[test]
    fn full_update_writes_every_non_key_field() {
        let mut tracker = ChangeTracker::new();
        let entity = note();
        tracker.track_modified(&entity);
        assert_eq!(tracker.diff(&entity), Some(vec![1, 2]));
        tracker.snapshot(&entity);
        assert_eq!(tracker.state_of(&entity), EntityState::Unchanged);
    }

    #[test]
    fn deleting_an_added_instance_forgets_it() {
        let mut tracker = ChangeTracker::new();
        let entity = note();
        tracker.mark_added(&entity);
        assert!(!tracker.mark_deleted(&entity));
        assert_eq!(tracker.state_of(&entity), EntityState::Detached);
    }

    #[test]
    fn pending_follows_tracking_order() {
        let mut tracker = ChangeTracker::new();
        let loaded = note();
        let added = note();
        tracker.track_unchanged(&loaded);
        tracker.mark_added(&added);
        loaded.set("title", "final").unwrap();
        assert!(tracker.mark_deleted(&loaded));

        let pending = tracker.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].mutation, MutationKind::Delete);
        assert_eq!(pending[1].mutation, MutationKind::Insert);
        assert!(tracker.has_changes());
    }
}
