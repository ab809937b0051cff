//! Dynamic field values of one entity instance.

use std::fmt;

use serde_json::{Map, Value as JsonValue};

use crate::entity::EntityDescriptor;
use crate::error::{Error, Result, SchemaErrorKind, TypeError};
use crate::row::Row;
use crate::value::Value;

/// The field values of one instance of an entity kind, in descriptor order.
#[derive(Clone)]
pub struct Record {
    descriptor: &'static EntityDescriptor,
    values: Vec<Value>,
}

impl Record {
    /// Create a record with every field NULL.
    pub fn new(descriptor: &'static EntityDescriptor) -> Self {
        Self {
            descriptor,
            values: vec![Value::Null; descriptor.fields.len()],
        }
    }

    /// Create a record from values in field order.
    pub fn from_values(descriptor: &'static EntityDescriptor, values: Vec<Value>) -> Result<Self> {
        if values.len() != descriptor.fields.len() {
            return Err(Error::Custom(format!(
                "{} has {} fields, got {} values",
                descriptor.name,
                descriptor.fields.len(),
                values.len()
            )));
        }
        Ok(Self { descriptor, values })
    }

    /// Builder-style setter; fails on unknown fields.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.descriptor
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.descriptor
            .field_index(field)
            .and_then(|i| self.values.get(i))
    }

    /// Get a typed field value.
    pub fn get_as<T>(&self, field: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get(field).ok_or_else(|| unknown_field(self.descriptor, field))?;
        T::try_from(value.clone()).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(field.to_string());
                Error::Type(te)
            }
            other => other,
        })
    }

    /// Set a field value, returning the previous value.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<Value> {
        let index = self
            .descriptor
            .field_index(field)
            .ok_or_else(|| unknown_field(self.descriptor, field))?;
        let value = value.into();
        let expected = self.descriptor.fields[index].field_type;
        if !expected.accepts(&value) {
            return Err(Error::Type(TypeError {
                expected: expected.name(),
                actual: value.type_name().to_string(),
                column: Some(field.to_string()),
                rust_type: None,
            }));
        }
        Ok(std::mem::replace(&mut self.values[index], value))
    }

    pub fn value_at(&self, index: usize) -> &Value {
        &self.values[index]
    }

    /// Set a value by position without type checks; used for values that
    /// come back from the store.
    pub fn set_at(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Overwrite every value with those of another record of the same kind.
    pub fn copy_from(&mut self, other: &Record) {
        debug_assert!(self.descriptor.same_kind(other.descriptor));
        self.values.clone_from(&other.values);
    }

    /// Primary key values in key order.
    pub fn key(&self) -> Vec<Value> {
        self.descriptor
            .key_indices()
            .into_iter()
            .map(|i| self.values[i].clone())
            .collect()
    }

    /// Does every key field hold a concrete value?
    pub fn has_key(&self) -> bool {
        self.descriptor
            .key_indices()
            .into_iter()
            .all(|i| !matches!(self.values[i], Value::Null | Value::Default))
    }

    /// The current concurrency token, if the kind has one and it is set.
    pub fn token(&self) -> Option<ConcurrencyToken> {
        self.descriptor
            .token_index()
            .and_then(|i| ConcurrencyToken::from_value(&self.values[i]))
    }

    /// Build a record from a row whose labels are `prefix.column` (joined
    /// plans) or plain column names (`prefix: None`).
    ///
    /// Returns `Ok(None)` when every key column is NULL, which is how an
    /// unmatched LEFT JOIN side arrives.
    pub fn from_row(
        descriptor: &'static EntityDescriptor,
        row: &Row,
        prefix: Option<&str>,
    ) -> Result<Option<Self>> {
        let mut values = Vec::with_capacity(descriptor.fields.len());
        for field in descriptor.fields {
            let label = match prefix {
                Some(p) => format!("{}.{}", p, field.column),
                None => field.column.to_string(),
            };
            let value = row.get_by_name(&label).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::FieldNotFound,
                    format!("row has no column '{}' for {}", label, descriptor.name),
                )
            })?;
            values.push(value.clone());
        }
        let record = Self { descriptor, values };
        if descriptor
            .key_indices()
            .into_iter()
            .all(|i| record.values[i].is_null())
        {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Render as a JSON object keyed by field name.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (field, value) in self.descriptor.fields.iter().zip(&self.values) {
            let json = match value {
                Value::Null | Value::Default => JsonValue::Null,
                Value::Bool(b) => JsonValue::Bool(*b),
                Value::Int(i) => JsonValue::from(*i),
                Value::BigInt(i) | Value::Timestamp(i) => JsonValue::from(*i),
                Value::Double(d) => JsonValue::from(*d),
                Value::Decimal(s) | Value::Text(s) => JsonValue::String(s.clone()),
                Value::Bytes(b) => JsonValue::String(hex(b)),
            };
            map.insert(field.name.to_string(), json);
        }
        JsonValue::Object(map)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.descriptor.name);
        for (field, value) in self.descriptor.fields.iter().zip(&self.values) {
            s.field(field.name, value);
        }
        s.finish()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor.same_kind(other.descriptor) && self.values == other.values
    }
}

fn unknown_field(descriptor: &EntityDescriptor, field: &str) -> Error {
    Error::schema(
        SchemaErrorKind::FieldNotFound,
        format!("{} has no field '{}'", descriptor.name, field),
    )
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Opaque 8-byte version marker. Compared and replaced, never interpreted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConcurrencyToken([u8; 8]);

impl ConcurrencyToken {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        value
            .as_bytes()
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(Self)
    }

    pub fn to_value(self) -> Value {
        Value::Bytes(self.0.to_vec())
    }

    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConcurrencyToken({})", hex(&self.0))
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

/// A typed entity that converts to and from a [`Record`].
///
/// The session works on records; typed structs are a convenience at the
/// application boundary.
pub trait Entity: Sized {
    fn descriptor() -> &'static EntityDescriptor;

    fn from_record(record: &Record) -> Result<Self>;

    fn to_record(&self) -> Record;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::KeyGeneration;
    use crate::field::{FieldDescriptor, FieldType};

    static NOTE: EntityDescriptor = EntityDescriptor {
        name: "Note",
        table: "notes",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt).generated(),
            FieldDescriptor::new("body", FieldType::Text).required(),
            FieldDescriptor::new("version", FieldType::Token),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Store,
        concurrency_token: Some("version"),
        relationships: &[],
        indexes: &[],
        soft_filter: None,
    };

    #[test]
    fn set_checks_field_and_type() {
        let mut note = Record::new(&NOTE);
        assert!(!note.has_key());
        assert_eq!(note.set("body", "hello").unwrap(), Value::Null);
        assert!(note.set("body", 5).is_err());
        assert!(note.set("missing", 1).is_err());
        assert_eq!(note.get_as::<String>("body").unwrap(), "hello");
    }

    #[test]
    fn from_row_with_prefix_and_unmatched_join() {
        let row = Row::new(
            vec![
                "t1.id".into(),
                "t1.body".into(),
                "t1.version".into(),
                "t2.id".into(),
                "t2.body".into(),
                "t2.version".into(),
            ],
            vec![
                Value::BigInt(4),
                Value::Text("x".into()),
                Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0, 9]),
                Value::Null,
                Value::Null,
                Value::Null,
            ],
        );

        let note = Record::from_row(&NOTE, &row, Some("t1")).unwrap().unwrap();
        assert_eq!(note.key(), vec![Value::BigInt(4)]);
        assert_eq!(
            note.token(),
            Some(ConcurrencyToken::new([0, 0, 0, 0, 0, 0, 0, 9]))
        );
        assert!(Record::from_row(&NOTE, &row, Some("t2")).unwrap().is_none());
        assert!(Record::from_row(&NOTE, &row, Some("t3")).is_err());
    }

    #[test]
    fn json_rendering() {
        let note = Record::new(&NOTE)
            .with("id", 1_i64)
            .unwrap()
            .with("body", "hi")
            .unwrap();
        assert_eq!(
            note.to_json(),
            serde_json::json!({"id": 1, "body": "hi", "version": null})
        );
    }
}
