//! The bookstore entity kinds.
//!
//! Four kinds: `Genre`, `Author`, `Book` and the `BookAuthor` junction that
//! realizes the many-to-many between books and authors. Descriptors are
//! `'static` data; the typed structs convert to and from records at the
//! application boundary.

use serde::{Deserialize, Serialize};

use folio_core::error::TypeError;
use folio_core::{
    Entity, EntityDescriptor, Error, FieldDescriptor, FieldType, FromRow, IndexDescriptor,
    KeyGeneration, Literal, Record, ReferentialAction, RelationshipDescriptor, Result, Row,
    Schema, SoftFilter, Value,
};
use folio_memory::{Database, MemoryConfig};

// ============================================================================
// Descriptors
// ============================================================================

pub static GENRE: EntityDescriptor = EntityDescriptor {
    name: "Genre",
    table: "genres",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("name", FieldType::Text)
            .required()
            .max_length(100),
        FieldDescriptor::new("description", FieldType::Text).max_length(500),
        FieldDescriptor::new("is_active", FieldType::Bool)
            .required()
            .store_default(Literal::Bool(true)),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: None,
    relationships: &[RelationshipDescriptor::one_to_many(
        "books",
        &BOOK,
        "id",
        "genre_id",
        ReferentialAction::Restrict,
    )],
    indexes: &[IndexDescriptor::unique("ix_genres_name", &["name"])],
    soft_filter: Some(SoftFilter::eq("is_active", Literal::Bool(true))),
};

pub static AUTHOR: EntityDescriptor = EntityDescriptor {
    name: "Author",
    table: "authors",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("first_name", FieldType::Text)
            .required()
            .max_length(100),
        FieldDescriptor::new("last_name", FieldType::Text)
            .required()
            .max_length(100),
        FieldDescriptor::new("email", FieldType::Text)
            .required()
            .max_length(255)
            .pattern(r"^[^@\s]+@[^@\s]+$"),
        FieldDescriptor::new("biography", FieldType::Text).max_length(2000),
        FieldDescriptor::new("date_of_birth", FieldType::Timestamp).required(),
        FieldDescriptor::new("row_version", FieldType::Token),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: Some("row_version"),
    relationships: &[RelationshipDescriptor::one_to_many(
        "book_authors",
        &BOOK_AUTHOR,
        "id",
        "author_id",
        ReferentialAction::Cascade,
    )],
    indexes: &[
        IndexDescriptor::unique("ix_authors_email", &["email"]),
        IndexDescriptor::secondary("ix_authors_last_name", &["last_name"]),
    ],
    soft_filter: None,
};

pub static BOOK: EntityDescriptor = EntityDescriptor {
    name: "Book",
    table: "books",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("title", FieldType::Text)
            .required()
            .max_length(200),
        FieldDescriptor::new("isbn", FieldType::Text)
            .required()
            .max_length(20),
        FieldDescriptor::new("published_date", FieldType::Timestamp),
        FieldDescriptor::new("page_count", FieldType::Int),
        FieldDescriptor::new(
            "price",
            FieldType::Decimal {
                precision: 18,
                scale: 2,
            },
        )
        .required(),
        FieldDescriptor::new("description", FieldType::Text).max_length(2000),
        FieldDescriptor::new("status", FieldType::Text)
            .required()
            .store_default(Literal::Text("InStore"))
            .sentinel(Literal::Text("Unspecified")),
        FieldDescriptor::new("genre_id", FieldType::BigInt)
            .required()
            .references(&GENRE, "id", ReferentialAction::Restrict),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: None,
    relationships: &[
        RelationshipDescriptor::one_to_many(
            "book_authors",
            &BOOK_AUTHOR,
            "id",
            "book_id",
            ReferentialAction::Cascade,
        ),
        RelationshipDescriptor::many_to_one("genre", &GENRE, "genre_id", "id"),
    ],
    indexes: &[
        IndexDescriptor::unique("ix_books_isbn", &["isbn"]),
        IndexDescriptor::secondary("ix_books_title", &["title"]),
        IndexDescriptor::secondary("ix_books_genre_id", &["genre_id"]),
    ],
    soft_filter: None,
};

pub static BOOK_AUTHOR: EntityDescriptor = EntityDescriptor {
    name: "BookAuthor",
    table: "book_authors",
    fields: &[
        FieldDescriptor::new("book_id", FieldType::BigInt)
            .required()
            .references(&BOOK, "id", ReferentialAction::Cascade),
        FieldDescriptor::new("author_id", FieldType::BigInt)
            .required()
            .references(&AUTHOR, "id", ReferentialAction::Cascade),
        FieldDescriptor::new("is_primary_author", FieldType::Bool)
            .required()
            .store_default(Literal::Bool(false)),
        FieldDescriptor::new("contribution_date", FieldType::Timestamp),
    ],
    key: &["book_id", "author_id"],
    key_generation: KeyGeneration::Client,
    concurrency_token: None,
    relationships: &[
        RelationshipDescriptor::many_to_one("book", &BOOK, "book_id", "id"),
        RelationshipDescriptor::many_to_one("author", &AUTHOR, "author_id", "id"),
    ],
    indexes: &[
        IndexDescriptor::secondary("ix_book_authors_book_id", &["book_id"]),
        IndexDescriptor::secondary("ix_book_authors_author_id", &["author_id"]),
    ],
    soft_filter: None,
};

/// The bookstore schema, checked for consistency.
pub fn schema() -> Result<Schema> {
    Schema::new(&[&GENRE, &AUTHOR, &BOOK, &BOOK_AUTHOR])
}

/// An empty in-memory bookstore.
pub fn database(config: MemoryConfig) -> Result<Database> {
    Ok(Database::new(&schema()?, config))
}

// ============================================================================
// Typed entities
// ============================================================================

/// Stock status of a book, stored as text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookStatus {
    /// Not chosen by the application; the store writes `InStore`
    #[default]
    Unspecified,
    InStore,
    Backordered,
    OutOfPrint,
}

impl BookStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            BookStatus::Unspecified => "Unspecified",
            BookStatus::InStore => "InStore",
            BookStatus::Backordered => "Backordered",
            BookStatus::OutOfPrint => "OutOfPrint",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Unspecified" => Some(BookStatus::Unspecified),
            "InStore" => Some(BookStatus::InStore),
            "Backordered" => Some(BookStatus::Backordered),
            "OutOfPrint" => Some(BookStatus::OutOfPrint),
            _ => None,
        }
    }
}

impl From<BookStatus> for Value {
    fn from(status: BookStatus) -> Self {
        Value::Text(status.as_str().to_string())
    }
}

impl TryFrom<Value> for BookStatus {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(BookStatus::Unspecified),
            Value::Text(text) => BookStatus::parse(&text).ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "BookStatus",
                    actual: text,
                    column: Some("status".to_string()),
                    rust_type: Some("BookStatus"),
                })
            }),
            other => Err(Error::Type(TypeError {
                expected: "BookStatus",
                actual: other.type_name().to_string(),
                column: Some("status".to_string()),
                rust_type: Some("BookStatus"),
            })),
        }
    }
}

fn record(descriptor: &'static EntityDescriptor, values: Vec<Value>) -> Record {
    let mut record = Record::new(descriptor);
    for (index, value) in values.into_iter().enumerate() {
        record.set_at(index, value);
    }
    record
}

fn timestamp(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Timestamp)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    pub id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    /// `None` lets the store apply its default
    pub is_active: Option<bool>,
}

impl Entity for Genre {
    fn descriptor() -> &'static EntityDescriptor {
        &GENRE
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.get_as("id")?,
            name: record.get_as("name")?,
            description: record.get_as("description")?,
            is_active: record.get_as("is_active")?,
        })
    }

    fn to_record(&self) -> Record {
        record(
            &GENRE,
            vec![
                self.id.into(),
                self.name.clone().into(),
                self.description.clone().into(),
                self.is_active.into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub biography: Option<String>,
    /// Seconds since the Unix epoch
    pub date_of_birth: i64,
    #[serde(skip)]
    pub row_version: Option<Vec<u8>>,
}

impl Entity for Author {
    fn descriptor() -> &'static EntityDescriptor {
        &AUTHOR
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.get_as("id")?,
            first_name: record.get_as("first_name")?,
            last_name: record.get_as("last_name")?,
            email: record.get_as("email")?,
            biography: record.get_as("biography")?,
            date_of_birth: record.get_as("date_of_birth")?,
            row_version: record.get_as("row_version")?,
        })
    }

    fn to_record(&self) -> Record {
        record(
            &AUTHOR,
            vec![
                self.id.into(),
                self.first_name.clone().into(),
                self.last_name.clone().into(),
                self.email.clone().into(),
                self.biography.clone().into(),
                Value::Timestamp(self.date_of_birth),
                self.row_version.clone().into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: Option<i64>,
    pub title: String,
    pub isbn: String,
    pub published_date: Option<i64>,
    pub page_count: Option<i32>,
    /// Decimal text, e.g. `"12.99"`
    pub price: String,
    pub description: Option<String>,
    pub status: BookStatus,
    pub genre_id: i64,
}

impl Entity for Book {
    fn descriptor() -> &'static EntityDescriptor {
        &BOOK
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.get_as("id")?,
            title: record.get_as("title")?,
            isbn: record.get_as("isbn")?,
            published_date: record.get_as("published_date")?,
            page_count: record.get_as("page_count")?,
            price: record.get_as("price")?,
            description: record.get_as("description")?,
            status: record.get_as("status")?,
            genre_id: record.get_as("genre_id")?,
        })
    }

    fn to_record(&self) -> Record {
        record(
            &BOOK,
            vec![
                self.id.into(),
                self.title.clone().into(),
                self.isbn.clone().into(),
                timestamp(self.published_date),
                self.page_count.into(),
                Value::Decimal(self.price.clone()),
                self.description.clone().into(),
                self.status.into(),
                self.genre_id.into(),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookAuthor {
    pub book_id: i64,
    pub author_id: i64,
    pub is_primary_author: Option<bool>,
    pub contribution_date: Option<i64>,
}

impl Entity for BookAuthor {
    fn descriptor() -> &'static EntityDescriptor {
        &BOOK_AUTHOR
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            book_id: record.get_as("book_id")?,
            author_id: record.get_as("author_id")?,
            is_primary_author: record.get_as("is_primary_author")?,
            contribution_date: record.get_as("contribution_date")?,
        })
    }

    fn to_record(&self) -> Record {
        record(
            &BOOK_AUTHOR,
            vec![
                self.book_id.into(),
                self.author_id.into(),
                self.is_primary_author.into(),
                timestamp(self.contribution_date),
            ],
        )
    }
}

/// A narrow read shape: title and price only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookTitle {
    pub title: String,
    pub price: String,
}

impl FromRow for BookTitle {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            title: row.get_named("title")?,
            price: row.get_named("price")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Book {
        Book {
            id: None,
            title: "Dune".to_string(),
            isbn: "978-0441013593".to_string(),
            published_date: Some(-139_000_000),
            page_count: Some(412),
            price: "9.99".to_string(),
            description: None,
            status: BookStatus::Unspecified,
            genre_id: 1,
        }
    }

    #[test]
    fn schema_is_consistent() {
        let schema = schema().unwrap();
        let order: Vec<&str> = schema
            .in_dependency_order()
            .iter()
            .map(|e| e.name)
            .collect();
        let pos = |name| order.iter().position(|n| *n == name).unwrap();
        assert!(pos("Genre") < pos("Book"));
        assert!(pos("Book") < pos("BookAuthor"));
        assert!(pos("Author") < pos("BookAuthor"));
    }

    #[test]
    fn book_round_trips_through_a_record() {
        let record = book().to_record();
        assert_eq!(record.get("price"), Some(&Value::Decimal("9.99".into())));
        assert_eq!(
            record.get("published_date"),
            Some(&Value::Timestamp(-139_000_000))
        );
        assert_eq!(Book::from_record(&record).unwrap(), book());
    }

    #[test]
    fn unspecified_status_is_the_sentinel() {
        let status = BOOK.field("status").unwrap();
        assert!(status.is_sentinel(&BookStatus::Unspecified.into()));
        assert!(!status.is_sentinel(&BookStatus::OutOfPrint.into()));
        assert!(BookStatus::try_from(Value::Text("Lost".into())).is_err());
    }

    #[test]
    fn genre_soft_filter_targets_active_rows() {
        let filter = GENRE.soft_filter_expr().unwrap();
        assert_eq!(filter.columns(), vec!["is_active"]);
    }
}
