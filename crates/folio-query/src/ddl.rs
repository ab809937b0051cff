//! DDL rendering of the persisted shape of each entity kind.

use folio_core::{
    EntityDescriptor, FieldDescriptor, FieldType, IndexDescriptor, KeyGeneration, Literal, Schema,
};

use crate::render::Dialect;

/// Builder for one CREATE TABLE statement.
#[derive(Debug)]
pub struct CreateTable {
    entity: &'static EntityDescriptor,
    dialect: Dialect,
    if_not_exists: bool,
}

impl CreateTable {
    pub fn new(entity: &'static EntityDescriptor, dialect: Dialect) -> Self {
        Self {
            entity,
            dialect,
            if_not_exists: false,
        }
    }

    /// Add IF NOT EXISTS clause.
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// Build the CREATE TABLE SQL.
    pub fn build(&self) -> String {
        let entity = self.entity;
        let d = self.dialect;
        let mut sql = String::from("CREATE TABLE ");
        if self.if_not_exists && d != Dialect::SqlServer {
            sql.push_str("IF NOT EXISTS ");
        }
        sql.push_str(&d.quote_identifier(entity.table));
        sql.push_str(" (\n  ");

        let inline_key = self.inline_key();
        let mut parts: Vec<String> = entity
            .fields
            .iter()
            .map(|f| self.column_definition(f, inline_key == Some(f.name)))
            .collect();

        if inline_key.is_none() {
            let cols: Vec<String> = entity
                .key
                .iter()
                .filter_map(|k| entity.field(k))
                .map(|f| d.quote_identifier(f.column))
                .collect();
            parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }

        for field in entity.fields {
            if let Some(fk) = field.references {
                let target_column = fk.target.field(fk.field).map_or(fk.field, |f| f.column);
                parts.push(format!(
                    "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                    d.quote_identifier(&format!("fk_{}_{}", entity.table, field.column)),
                    d.quote_identifier(field.column),
                    d.quote_identifier(fk.target.table),
                    d.quote_identifier(target_column),
                    fk.on_delete.as_sql()
                ));
            }
        }

        sql.push_str(&parts.join(",\n  "));
        sql.push_str("\n)");
        sql
    }

    /// SQLite declares an auto-increment key inline on the column.
    fn inline_key(&self) -> Option<&'static str> {
        let entity = self.entity;
        (self.dialect == Dialect::Sqlite
            && entity.key_generation == KeyGeneration::Store
            && entity.key.len() == 1)
            .then(|| entity.key[0])
    }

    fn column_definition(&self, field: &FieldDescriptor, inline_key: bool) -> String {
        let d = self.dialect;
        let name = d.quote_identifier(field.column);
        if inline_key {
            return format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT");
        }

        let mut def = format!("{name} {}", column_type(field, d));
        if field.generated {
            match d {
                Dialect::Postgres => def.push_str(" GENERATED BY DEFAULT AS IDENTITY"),
                Dialect::Mysql => def.push_str(" NOT NULL AUTO_INCREMENT"),
                Dialect::SqlServer => def.push_str(" IDENTITY(1,1) NOT NULL"),
                Dialect::Sqlite => def.push_str(" NOT NULL"),
            }
            return def;
        }
        // ROWVERSION columns are always maintained by SQL Server itself
        if field.is_token() && d == Dialect::SqlServer {
            return def;
        }
        if field.required {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = field.store_default {
            def.push_str(" DEFAULT ");
            def.push_str(&default_literal(default, d));
        }
        def
    }
}

fn column_type(field: &FieldDescriptor, d: Dialect) -> String {
    match (field.field_type, d) {
        (FieldType::Bool, Dialect::Postgres) => "BOOLEAN".into(),
        (FieldType::Bool, Dialect::Mysql) => "TINYINT(1)".into(),
        (FieldType::Bool, Dialect::SqlServer) => "BIT".into(),
        (FieldType::Bool, Dialect::Sqlite) => "INTEGER".into(),
        (FieldType::Int, Dialect::Mysql | Dialect::SqlServer) => "INT".into(),
        (FieldType::Int, _) => "INTEGER".into(),
        (FieldType::BigInt, Dialect::Sqlite) => "INTEGER".into(),
        (FieldType::BigInt, _) => "BIGINT".into(),
        (FieldType::Double, Dialect::Postgres) => "DOUBLE PRECISION".into(),
        (FieldType::Double, Dialect::Mysql) => "DOUBLE".into(),
        (FieldType::Double, Dialect::SqlServer) => "FLOAT".into(),
        (FieldType::Double, Dialect::Sqlite) => "REAL".into(),
        (FieldType::Decimal { precision, scale }, _) => format!("DECIMAL({precision}, {scale})"),
        (FieldType::Text, Dialect::SqlServer) => match field.max_length {
            Some(n) => format!("NVARCHAR({n})"),
            None => "NVARCHAR(MAX)".into(),
        },
        (FieldType::Text, _) => match field.max_length {
            Some(n) => format!("VARCHAR({n})"),
            None => "TEXT".into(),
        },
        (FieldType::Timestamp, Dialect::Mysql) => "DATETIME".into(),
        (FieldType::Timestamp, Dialect::SqlServer) => "DATETIME2".into(),
        (FieldType::Timestamp, _) => "TIMESTAMP".into(),
        (FieldType::Token, Dialect::Postgres) => "BYTEA".into(),
        (FieldType::Token, Dialect::Mysql) => "BINARY(8)".into(),
        (FieldType::Token, Dialect::SqlServer) => "ROWVERSION".into(),
        (FieldType::Token, Dialect::Sqlite) => "BLOB".into(),
    }
}

fn default_literal(literal: Literal, d: Dialect) -> String {
    match literal {
        Literal::Null => "NULL".into(),
        Literal::Bool(b) if d == Dialect::Postgres => String::from(if b { "TRUE" } else { "FALSE" }),
        Literal::Bool(b) => String::from(if b { "1" } else { "0" }),
        Literal::Int(i) => i.to_string(),
        Literal::Decimal(s) => s.to_string(),
        Literal::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

/// CREATE INDEX for one declared index.
pub fn create_index_sql(entity: &EntityDescriptor, index: &IndexDescriptor, dialect: Dialect) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let cols: Vec<String> = index
        .fields
        .iter()
        .map(|name| entity.field(name).map_or(*name, |f| f.column))
        .map(|c| dialect.quote_identifier(c))
        .collect();
    format!(
        "CREATE {unique}INDEX {} ON {} ({})",
        dialect.quote_identifier(index.name),
        dialect.quote_identifier(entity.table),
        cols.join(", ")
    )
}

/// CREATE TABLE for one kind.
pub fn create_table_sql(entity: &'static EntityDescriptor, dialect: Dialect) -> String {
    CreateTable::new(entity, dialect).build()
}

/// Builder for a whole schema script.
#[derive(Debug)]
pub struct SchemaBuilder {
    dialect: Dialect,
    statements: Vec<String>,
}

impl SchemaBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            statements: Vec::new(),
        }
    }

    /// Add a CREATE TABLE statement followed by the kind's indexes.
    pub fn create_table(mut self, entity: &'static EntityDescriptor) -> Self {
        self.statements
            .push(CreateTable::new(entity, self.dialect).if_not_exists().build());
        for index in entity.indexes {
            self.statements
                .push(create_index_sql(entity, index, self.dialect));
        }
        self
    }

    /// Add a raw SQL statement.
    pub fn raw(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }

    /// Get all SQL statements.
    pub fn build(self) -> Vec<String> {
        self.statements
    }
}

/// Every table and index of a schema, referenced kinds first.
pub fn create_schema_sql(schema: &Schema, dialect: Dialect) -> Vec<String> {
    schema
        .in_dependency_order()
        .into_iter()
        .fold(SchemaBuilder::new(dialect), SchemaBuilder::create_table)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{ReferentialAction, RelationshipDescriptor};

    static SHELF: EntityDescriptor = EntityDescriptor {
        name: "Shelf",
        table: "shelves",
        fields: &[
            FieldDescriptor::new("id", FieldType::BigInt).generated(),
            FieldDescriptor::new("label", FieldType::Text)
                .required()
                .max_length(40),
            FieldDescriptor::new("open", FieldType::Bool)
                .required()
                .store_default(Literal::Bool(true)),
        ],
        key: &["id"],
        key_generation: KeyGeneration::Store,
        concurrency_token: None,
        relationships: &[RelationshipDescriptor::one_to_many(
            "slots",
            &SLOT,
            "id",
            "shelf_id",
            ReferentialAction::Cascade,
        )],
        indexes: &[IndexDescriptor::unique("ix_shelves_label", &["label"])],
        soft_filter: None,
    };

    static SLOT: EntityDescriptor = EntityDescriptor {
        name: "Slot",
        table: "slots",
        fields: &[
            FieldDescriptor::new("shelf_id", FieldType::BigInt)
                .required()
                .references(&SHELF, "id", ReferentialAction::Cascade),
            FieldDescriptor::new("position", FieldType::Int).required(),
            FieldDescriptor::new("price", FieldType::Decimal {
                precision: 10,
                scale: 2,
            }),
            FieldDescriptor::new("note", FieldType::Text).store_default(Literal::Text("n/a")),
            FieldDescriptor::new("version", FieldType::Token),
        ],
        key: &["shelf_id", "position"],
        key_generation: KeyGeneration::Client,
        concurrency_token: Some("version"),
        relationships: &[],
        indexes: &[IndexDescriptor::secondary("ix_slots_shelf", &["shelf_id"])],
        soft_filter: None,
    };

    #[test]
    fn sqlite_inlines_autoincrement_key() {
        let sql = create_table_sql(&SHELF, Dialect::Sqlite);
        assert!(sql.starts_with("CREATE TABLE \"shelves\" ("));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"label\" VARCHAR(40) NOT NULL"));
        assert!(sql.contains("\"open\" INTEGER NOT NULL DEFAULT 1"));
        assert!(!sql.contains("PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn composite_key_and_foreign_key() {
        let sql = create_table_sql(&SLOT, Dialect::Postgres);
        assert!(sql.contains("PRIMARY KEY (\"shelf_id\", \"position\")"));
        assert!(sql.contains(
            "FOREIGN KEY (\"shelf_id\") REFERENCES \"shelves\" (\"id\") ON DELETE CASCADE"
        ));
        assert!(sql.contains("\"price\" DECIMAL(10, 2)"));
        assert!(sql.contains("\"note\" TEXT DEFAULT 'n/a'"));
        assert!(sql.contains("\"version\" BYTEA"));
    }

    #[test]
    fn dialect_specific_types() {
        let mssql = create_table_sql(&SLOT, Dialect::SqlServer);
        assert!(mssql.contains("[version] ROWVERSION"));
        assert!(mssql.contains("[note] NVARCHAR(MAX)"));

        let pg = create_table_sql(&SHELF, Dialect::Postgres);
        assert!(pg.contains("\"id\" BIGINT GENERATED BY DEFAULT AS IDENTITY"));
        assert!(pg.contains("DEFAULT TRUE"));

        let mysql = create_table_sql(&SHELF, Dialect::Mysql);
        assert!(mysql.contains("`id` BIGINT NOT NULL AUTO_INCREMENT"));
        assert!(mysql.contains("PRIMARY KEY (`id`)"));
    }

    #[test]
    fn schema_script_orders_tables_and_indexes() {
        let schema = Schema::new(&[&SLOT, &SHELF]).unwrap();
        let statements = create_schema_sql(&schema, Dialect::Sqlite);
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"shelves\""));
        assert_eq!(
            statements[1],
            "CREATE UNIQUE INDEX \"ix_shelves_label\" ON \"shelves\" (\"label\")"
        );
        assert!(statements[2].starts_with("CREATE TABLE IF NOT EXISTS \"slots\""));
        assert_eq!(
            statements[3],
            "CREATE INDEX \"ix_slots_shelf\" ON \"slots\" (\"shelf_id\")"
        );
    }

    #[test]
    fn raw_statements_pass_through() {
        let statements = SchemaBuilder::new(Dialect::Sqlite)
            .raw("PRAGMA foreign_keys = ON")
            .create_table(&SHELF)
            .build();
        assert_eq!(statements[0], "PRAGMA foreign_keys = ON");
        assert_eq!(statements.len(), 3);
    }
}
