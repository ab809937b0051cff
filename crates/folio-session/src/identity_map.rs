//! Identity map: one live instance per (kind, key).
//!
//! Instances are shared handles ([`EntityRef`]) over an `Arc<RwLock<Record>>`.
//! Resolving the same key twice yields the same handle, so a change made
//! through one is visible through every other and the change tracker sees a
//! single instance.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let (first, created) = map.resolve(key.clone(), || record.clone());
//! assert!(created);
//!
//! // existing in-memory state wins over the freshly read row
//! let (second, created) = map.resolve(key, || newer_record);
//! assert!(!created);
//! assert!(EntityRef::ptr_eq(&first, &second));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use folio_core::error::{IdentityError, IdentityErrorKind};
use folio_core::{Entity, EntityDescriptor, Error, Record, Result, Value};

/// Identity of a stored row: entity kind plus primary key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    kind: &'static str,
    key: Vec<Value>,
}

impl EntityKey {
    pub fn new(entity: &EntityDescriptor, key: Vec<Value>) -> Self {
        Self {
            kind: entity.name,
            key,
        }
    }

    /// The key of a record, or `None` while any key field is unassigned.
    pub fn of(record: &Record) -> Option<Self> {
        record
            .has_key()
            .then(|| Self::new(record.descriptor(), record.key()))
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn values(&self) -> &[Value] {
        &self.key
    }
}

/// A shared handle to one entity instance.
///
/// Equality and hashing are by identity: two handles are equal only when
/// they point at the same instance, whatever their field values.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Record>>);

impl EntityRef {
    /// Wrap a record in a new, unshared instance.
    pub fn new(record: Record) -> Self {
        Self(Arc::new(RwLock::new(record)))
    }

    pub fn ptr_eq(a: &EntityRef, b: &EntityRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.read().descriptor()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.read().get(field).cloned()
    }

    pub fn get_as<T>(&self, field: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        self.read().get_as(field)
    }

    /// Set a field, returning the previous value.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<Value> {
        self.write().set(field, value)
    }

    /// A copy of the current field values.
    pub fn record(&self) -> Record {
        self.read().clone()
    }

    pub fn key(&self) -> Vec<Value> {
        self.read().key()
    }

    pub fn entity_key(&self) -> Option<EntityKey> {
        EntityKey::of(&self.read())
    }

    /// Convert to a typed entity.
    pub fn to_entity<E: Entity>(&self) -> Result<E> {
        E::from_record(&self.read())
    }

    /// Overwrite every field from another record of the same kind.
    pub(crate) fn overwrite(&self, record: &Record) {
        self.write().copy_from(record);
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.read(), f)
    }
}

/// Map from [`EntityKey`] to the session's live instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance registered for `key`, or register one built by
    /// `build`. The flag is true when a new instance was registered.
    ///
    /// An existing instance is returned untouched: its in-memory values win
    /// over whatever `build` would have produced.
    pub fn resolve(&mut self, key: EntityKey, build: impl FnOnce() -> Record) -> (EntityRef, bool) {
        if let Some(existing) = self.entries.get(&key) {
            tracing::trace!(kind = key.kind, key = ?key.key, "identity hit");
            return (existing.clone(), false);
        }
        tracing::trace!(kind = key.kind, key = ?key.key, "identity registered");
        let entity = EntityRef::new(build());
        self.entries.insert(key, entity.clone());
        (entity, true)
    }

    pub fn get(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.entries.get(key)
    }

    /// Register an instance under its key. Fails if a different instance
    /// already holds the key.
    pub fn insert(&mut self, key: EntityKey, entity: EntityRef) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if EntityRef::ptr_eq(existing, &entity) {
                return Ok(());
            }
            return Err(Error::Identity(IdentityError {
                kind: IdentityErrorKind::Duplicate,
                entity: key.kind,
                key: key.key,
            }));
        }
        self.entries.insert(key, entity);
        Ok(())
    }

    /// Remove the mapping for `key`. The returned instance stays usable but
    /// is no longer observed by the session.
    pub fn detach(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key)
    }

    /// Remove `entity` wherever it is registered.
    ///
    /// Looks under the instance's current key first; an instance whose key
    /// fields were edited after it was mapped is found by a full scan.
    pub fn detach_instance(&mut self, entity: &EntityRef) -> bool {
        if let Some(key) = entity.entity_key() {
            if self
                .entries
                .get(&key)
                .is_some_and(|mapped| EntityRef::ptr_eq(mapped, entity))
            {
                return self.detach(&key).is_some();
            }
        }
        let before = self.entries.len();
        self.entries.retain(|_, e| !EntityRef::ptr_eq(e, entity));
        before != self.entries.len()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
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
    use folio_core::{FieldDescriptor, FieldType, KeyGeneration};

    static TAG: EntityDescriptor = EntityDescriptor {
        name: "Tag",
        table: "tags",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt),
            FieldDescriptor::new("label", FieldType::Text),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Client,
        concurrency_token: None,
        relationships: &[],
        indexes: &[],
        soft_filter: None,
    };

    fn tag(id: i64, label: &str) -> Record {
        Record::new(&TAG)
            .with("id", id)
            .unwrap()
            .with("label", label)
            .unwrap()
    }

    #[test]
    fn resolve_keeps_existing_state() {
        let mut map = IdentityMap::new();
        let key = EntityKey::of(&tag(1, "red")).unwrap();
        let (first, created) = map.resolve(key.clone(), || tag(1, "red"));
        assert!(created);
        first.set("label", "edited").unwrap();

        let (second, created) = map.resolve(key, || tag(1, "from store"));
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(second.get("label"), Some(Value::Text("edited".into())));
    }

    #[test]
    fn integer_widths_share_identity() {
        let mut map = IdentityMap::new();
        let wide = EntityKey::new(&TAG, vec![Value::BigInt(7)]);
        let narrow = EntityKey::new(&TAG, vec![Value::Int(7)]);
        let (a, _) = map.resolve(wide, || tag(7, "x"));
        let (b, created) = map.resolve(narrow, || tag(7, "y"));
        assert!(!created);
        assert!(EntityRef::ptr_eq(&a, &b));
    }

    #[test]
    fn insert_rejects_a_second_instance_for_a_key() {
        let mut map = IdentityMap::new();
        let key = EntityKey::of(&tag(2, "a")).unwrap();
        let original = EntityRef::new(tag(2, "a"));
        map.insert(key.clone(), original.clone()).unwrap();
        map.insert(key.clone(), original.clone()).unwrap();

        let err = map.insert(key.clone(), EntityRef::new(tag(2, "b"))).unwrap_err();
        assert!(matches!(err, Error::Identity(_)));

        assert!(map.detach_instance(&original));
        assert!(!map.contains(&key));
    }

    #[test]
    fn detach_leaves_other_instances_mapped() {
        let mut map = IdentityMap::new();
        let (red, _) = map.resolve(EntityKey::of(&tag(1, "red")).unwrap(), || tag(1, "red"));
        let (blue, _) = map.resolve(EntityKey::of(&tag(2, "blue")).unwrap(), || tag(2, "blue"));

        let blue_key = blue.entity_key().unwrap();
        let removed = map.detach(&blue_key).unwrap();
        assert!(EntityRef::ptr_eq(&removed, &blue));
        assert!(map.detach(&blue_key).is_none());

        // a stray instance carrying a mapped key is not the mapped one
        let stray = EntityRef::new(tag(1, "stray"));
        assert!(!map.detach_instance(&stray));
        assert_eq!(map.len(), 1);

        // edited key fields fall back to a scan
        red.set("id", 10_i64).unwrap();
        assert!(map.detach_instance(&red));
        assert_eq!(map.len(), 0);
        assert_eq!(removed.get("label"), Some(Value::Text("blue".into())));
    }

    #[test]
    fn unassigned_key_has_no_identity() {
        let record = Record::new(&TAG).with("label", "new").unwrap();
        assert!(EntityKey::of(&record).is_none());
    }
}
