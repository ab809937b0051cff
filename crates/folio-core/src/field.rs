//! Field and column definitions.

use std::fmt;

use crate::entity::EntityDescriptor;
use crate::value::Value;

/// Referential action for foreign key constraints (ON DELETE).
///
/// These define what happens to referencing rows when the referenced row is
/// deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// No action - raise error if any references exist.
    #[default]
    NoAction,
    /// Restrict - same as NO ACTION, checked immediately.
    Restrict,
    /// Cascade - automatically delete referencing rows.
    Cascade,
    /// Set null - set referencing columns to NULL.
    SetNull,
}

impl ReferentialAction {
    /// Get the SQL representation of this action.
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }

    /// Does deleting the referenced row fail while references exist?
    pub const fn blocks_delete(&self) -> bool {
        matches!(
            self,
            ReferentialAction::NoAction | ReferentialAction::Restrict
        )
    }
}

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    BigInt,
    Double,
    /// Exact decimal with total digits and digits after the point
    Decimal {
        precision: u8,
        scale: u8,
    },
    Text,
    Timestamp,
    /// Opaque 8-byte concurrency token maintained by the store
    Token,
}

impl FieldType {
    /// Does a value of this shape belong in a field of this type?
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null | Value::Default) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Int | FieldType::BigInt, Value::Int(_) | Value::BigInt(_)) => true,
            (FieldType::Double, Value::Double(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (FieldType::Decimal { .. }, Value::Decimal(_) | Value::Int(_) | Value::BigInt(_)) => {
                true
            }
            (FieldType::Text, Value::Text(_)) => true,
            (FieldType::Timestamp, Value::Timestamp(_)) => true,
            (FieldType::Token, Value::Bytes(b)) => b.len() == 8,
            _ => false,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::BigInt => "bigint",
            FieldType::Double => "double",
            FieldType::Decimal { .. } => "decimal",
            FieldType::Text => "text",
            FieldType::Timestamp => "timestamp",
            FieldType::Token => "token",
        }
    }
}

/// A constant value usable in `'static` descriptor data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Text(&'static str),
    Decimal(&'static str),
}

impl Literal {
    /// Materialize the literal for a field of the given type.
    pub fn to_value(&self, field_type: FieldType) -> Value {
        match (*self, field_type) {
            (Literal::Null, _) => Value::Null,
            (Literal::Bool(b), _) => Value::Bool(b),
            (Literal::Int(i), FieldType::Int) => {
                i32::try_from(i).map_or(Value::BigInt(i), Value::Int)
            }
            (Literal::Int(i), FieldType::Timestamp) => Value::Timestamp(i),
            (Literal::Int(i), _) => Value::BigInt(i),
            (Literal::Text(s), _) => Value::Text(s.to_string()),
            (Literal::Decimal(s), _) => Value::Decimal(s.to_string()),
        }
    }
}

/// Foreign key from a field to another entity kind's field.
#[derive(Clone, Copy)]
pub struct ForeignKey {
    pub target: &'static EntityDescriptor,
    pub field: &'static str,
    pub on_delete: ReferentialAction,
}

impl fmt::Debug for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Descriptors reference each other cyclically; print names only.
        f.debug_struct("ForeignKey")
            .field("target", &self.target.name)
            .field("field", &self.field)
            .field("on_delete", &self.on_delete)
            .finish()
    }
}

/// Metadata about one scalar field of an entity kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// Field name used by application code
    pub name: &'static str,
    /// Column name in the persisted table
    pub column: &'static str,
    pub field_type: FieldType,
    /// Must be non-NULL when written
    pub required: bool,
    /// Maximum text length in characters
    pub max_length: Option<usize>,
    /// Regex the text value must match
    pub pattern: Option<&'static str>,
    /// Value the store applies when the column is omitted on insert
    pub store_default: Option<Literal>,
    /// Application value meaning "unset": written as the store default
    pub sentinel: Option<Literal>,
    /// Value generated by the store on insert (auto-increment key)
    pub generated: bool,
    pub references: Option<ForeignKey>,
}

impl FieldDescriptor {
    /// Create a new optional field whose column has the same name.
    pub const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            column: name,
            field_type,
            required: false,
            max_length: None,
            pattern: None,
            store_default: None,
            sentinel: None,
            generated: false,
            references: None,
        }
    }

    /// Set the column name.
    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    /// Mark the field required (NOT NULL).
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub const fn pattern(mut self, pattern: &'static str) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub const fn store_default(mut self, value: Literal) -> Self {
        self.store_default = Some(value);
        self
    }

    /// Declare the application value that stands for "let the store decide".
    pub const fn sentinel(mut self, value: Literal) -> Self {
        self.sentinel = Some(value);
        self
    }

    /// Mark the field as generated by the store on insert.
    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self.required = true;
        self
    }

    /// Declare a foreign key to `target.field`.
    pub const fn references(
        mut self,
        target: &'static EntityDescriptor,
        field: &'static str,
        on_delete: ReferentialAction,
    ) -> Self {
        self.references = Some(ForeignKey {
            target,
            field,
            on_delete,
        });
        self
    }

    pub const fn is_token(&self) -> bool {
        matches!(self.field_type, FieldType::Token)
    }

    /// Is `value` the declared sentinel for this field?
    pub fn is_sentinel(&self, value: &Value) -> bool {
        self.sentinel
            .is_some_and(|s| s.to_value(self.field_type) == *value)
    }

    /// Can the store fill this field when the application leaves it empty?
    pub fn store_fills(&self) -> bool {
        self.generated || self.store_default.is_some() || self.is_token()
    }
}
