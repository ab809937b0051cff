//! Error types for Folio operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all Folio operations.
#[derive(Debug)]
pub enum Error {
    /// Constraint violated before any store round trip
    Validation(ValidationError),
    /// Concurrency token mismatch at flush
    ConcurrencyConflict(ConflictError),
    /// A point lookup the caller required returned nothing
    NotFound(NotFoundError),
    /// Another operation is in flight on the session's connection
    ConnectionBusy,
    /// Store-level failure inside a flush transaction
    FlushFailed(FlushError),
    /// A streamed sequence was cancelled before it was drained
    StreamAborted(String),
    /// Statement execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Connection-related errors
    Connection(ConnectionError),
    /// Entity descriptor or schema inconsistencies
    Schema(SchemaError),
    /// Identity map misuse (duplicate key, untracked instance)
    Identity(IdentityError),
    /// Custom error with message
    Custom(String),
}

/// Which kind of write a pending mutation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Insert => write!(f, "insert"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictError {
    /// Entity kind of the offending instance
    pub entity: &'static str,
    /// Primary key of the offending instance
    pub key: Vec<Value>,
    pub mutation: MutationKind,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity: &'static str,
    pub key: Vec<Value>,
}

#[derive(Debug)]
pub struct FlushError {
    /// The mutation that failed, if the failure is attributable to one
    pub entity: Option<&'static str>,
    pub mutation: Option<MutationKind>,
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Connection has been closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed statement
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Statement shape the store cannot execute
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Committed or rolled back already
    AlreadyFinished,
    /// Another writer holds the store
    WriterActive,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity kind not registered
    EntityNotFound,
    /// Field not declared on an entity kind
    FieldNotFound,
    /// Relationship not declared on an entity kind
    RelationshipNotFound,
    /// Descriptor is internally inconsistent
    Invalid,
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub entity: &'static str,
    pub key: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// A different instance already holds this key in the session
    Duplicate,
    /// The instance is not tracked by this session
    NotTracked,
}

/// Validation error for field-level validation.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Entity kind the errors belong to, if known
    pub entity: Option<&'static str>,
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field is missing/null
    Required,
    /// String is longer than maximum length
    MaxLength,
    /// Decimal does not fit the declared precision/scale
    Precision,
    /// Value doesn't match regex pattern
    Pattern,
    /// Value has the wrong type for the field
    Type,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self {
            entity: None,
            errors: Vec::new(),
        }
    }

    /// Create an empty container for errors on one entity kind.
    pub fn for_entity(entity: &'static str) -> Self {
        Self {
            entity: Some(entity),
            errors: Vec::new(),
        }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a max length error.
    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxLength,
            format!("must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a decimal precision error.
    pub fn add_precision(&mut self, field: impl Into<String>, precision: u8, scale: u8) {
        self.add(
            field,
            ValidationErrorKind::Precision,
            format!("must fit decimal({precision}, {scale})"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        self.add(
            field,
            ValidationErrorKind::Pattern,
            format!("must match pattern '{pattern}'"),
        );
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Required, "is required");
    }

    /// Add a wrong-type error.
    pub fn add_type(&mut self, field: impl Into<String>, expected: &str, actual: &str) {
        self.add(
            field,
            ValidationErrorKind::Type,
            format!("expected {expected}, got {actual}"),
        );
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Merge another container into this one.
    pub fn extend(&mut self, other: ValidationError) {
        self.errors.extend(other.errors);
    }

    /// Whether any error names the given field.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Can the caller reasonably retry after resolving the cause?
    ///
    /// Conflicts and busy rejections leave session state intact, so the same
    /// flush or query can be issued again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConcurrencyConflict(_) | Error::ConnectionBusy => true,
            Error::Transaction(t) => t.kind == TransactionErrorKind::WriterActive,
            Error::FlushFailed(f) => f.source.is_retryable(),
            _ => false,
        }
    }

    /// Is this a store constraint violation (possibly wrapped by a flush)?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Query(q) => q.kind == QueryErrorKind::Constraint,
            Error::FlushFailed(f) => f.source.is_constraint_violation(),
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::FlushFailed(f) => f.source.sql(),
            _ => None,
        }
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// A statement shape the store or planner does not handle.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Unsupported,
            sql: None,
            message: message.into(),
        })
    }

    /// Shorthand for a store-side constraint violation.
    pub fn constraint(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: None,
            message: message.into(),
        })
    }
}

fn fmt_key(key: &[Value]) -> String {
    let parts: Vec<String> = key
        .iter()
        .map(|v| match v {
            Value::Text(s) | Value::Decimal(s) => format!("'{s}'"),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) | Value::Timestamp(i) => i.to_string(),
            other => other.type_name().to_string(),
        })
        .collect();
    format!("({})", parts.join(", "))
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::ConcurrencyConflict(e) => write!(f, "Concurrency conflict: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::ConnectionBusy => write!(
                f,
                "Connection busy: another operation or open stream holds the connection"
            ),
            Error::FlushFailed(e) => write!(f, "Flush failed: {}", e),
            Error::StreamAborted(reason) => write!(f, "Stream aborted: {}", reason),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Identity(e) => write!(f, "Identity error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::FlushFailed(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} {} affected no rows; it was changed or deleted since it was loaded",
            self.mutation,
            self.entity,
            fmt_key(&self.key)
        )
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity, fmt_key(&self.key))
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mutation, self.entity) {
            (Some(m), Some(entity)) => write!(f, "{} of {}: {}", m, entity, self.source),
            _ => write!(f, "{}", self.source),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IdentityErrorKind::Duplicate => write!(
                f,
                "another {} instance with key {} is already tracked",
                self.entity,
                fmt_key(&self.key)
            ),
            IdentityErrorKind::NotTracked => write!(
                f,
                "{} {} is not tracked by this session",
                self.entity,
                fmt_key(&self.key)
            ),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(entity) = self.entity {
            write!(f, "{}: ", entity)?;
        }
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} {}", err.field, err.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<ConflictError> for Error {
    fn from(err: ConflictError) -> Self {
        Error::ConcurrencyConflict(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

/// Result type alias for Folio operations.
pub type Result<T> = std::result::Result<T, Error>;
