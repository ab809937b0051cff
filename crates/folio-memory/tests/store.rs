use folio_core::error::QueryErrorKind;
use folio_core::{
    EntityDescriptor, Error, Expr, FieldDescriptor, FieldType, IndexDescriptor, KeyGeneration,
    Literal, OrderBy, Record, ReferentialAction, RelationshipDescriptor, Schema, Statement, Value,
};
use folio_memory::{Database, MemoryConfig, MemoryConnection};
use folio_query::plan::{
    bulk_update_statement, count_select, delete_statement, insert_statement, joined_plan,
    projection_select, update_statement,
};
use folio_query::{BulkUpdate, Include, Projection, Query};

static REGION: EntityDescriptor = EntityDescriptor {
    name: "Region",
    table: "regions",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("name", FieldType::Text).required(),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: None,
    relationships: &[RelationshipDescriptor::one_to_many(
        "depots",
        &DEPOT,
        "id",
        "region_id",
        ReferentialAction::Restrict,
    )],
    indexes: &[IndexDescriptor::unique("ix_regions_name", &["name"])],
    soft_filter: None,
};

static DEPOT: EntityDescriptor = EntityDescriptor {
    name: "Depot",
    table: "depots",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("region_id", FieldType::BigInt)
            .required()
            .references(&REGION, "id", ReferentialAction::Restrict),
        FieldDescriptor::new("name", FieldType::Text).required(),
        FieldDescriptor::new("capacity", FieldType::Int)
            .required()
            .store_default(Literal::Int(100)),
        FieldDescriptor::new("version", FieldType::Token),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: Some("version"),
    relationships: &[
        RelationshipDescriptor::one_to_many(
            "pallets",
            &PALLET,
            "id",
            "depot_id",
            ReferentialAction::Cascade,
        ),
        RelationshipDescriptor::one_to_many(
            "sensors",
            &SENSOR,
            "id",
            "depot_id",
            ReferentialAction::SetNull,
        ),
    ],
    indexes: &[],
    soft_filter: None,
};

static PALLET: EntityDescriptor = EntityDescriptor {
    name: "Pallet",
    table: "pallets",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("depot_id", FieldType::BigInt)
            .required()
            .references(&DEPOT, "id", ReferentialAction::Cascade),
        FieldDescriptor::new("weight", FieldType::Decimal {
            precision: 8,
            scale: 2,
        })
        .required(),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: None,
    relationships: &[],
    indexes: &[],
    soft_filter: None,
};

static SENSOR: EntityDescriptor = EntityDescriptor {
    name: "Sensor",
    table: "sensors",
    fields: &[
        FieldDescriptor::new("serial", FieldType::Text),
        FieldDescriptor::new("depot_id", FieldType::BigInt).references(
            &DEPOT,
            "id",
            ReferentialAction::SetNull,
        ),
    ],
    key: &["serial"],
    key_generation: KeyGeneration::Client,
    concurrency_token: None,
    relationships: &[],
    indexes: &[],
    soft_filter: None,
};

fn database() -> Database {
    let schema = Schema::new(&[&REGION, &DEPOT, &PALLET, &SENSOR]).unwrap();
    Database::new(&schema, MemoryConfig::default())
}

fn insert(conn: &MemoryConnection, record: &Record) -> Vec<Value> {
    let result = conn
        .execute_sync(&Statement::Insert(insert_statement(record)))
        .unwrap();
    result.returned[0].values().cloned().collect()
}

fn region(conn: &MemoryConnection, name: &str) -> i64 {
    let record = Record::new(&REGION).with("name", name).unwrap();
    insert(conn, &record)[0].as_i64().unwrap()
}

fn depot(conn: &MemoryConnection, region_id: i64, name: &str) -> (i64, Value) {
    let record = Record::new(&DEPOT)
        .with("region_id", region_id)
        .unwrap()
        .with("name", name)
        .unwrap();
    let returned = insert(conn, &record);
    // returning order follows field order: id, capacity, version
    (returned[0].as_i64().unwrap(), returned[2].clone())
}

fn pallet(conn: &MemoryConnection, depot_id: i64, weight: &str) {
    let record = Record::new(&PALLET)
        .with("depot_id", depot_id)
        .unwrap()
        .with("weight", Value::Decimal(weight.to_string()))
        .unwrap();
    insert(conn, &record);
}

fn sensor(conn: &MemoryConnection, serial: &str, depot_id: i64) {
    let record = Record::new(&SENSOR)
        .with("serial", serial)
        .unwrap()
        .with("depot_id", depot_id)
        .unwrap();
    insert(conn, &record);
}

fn constraint_message(err: &Error) -> &str {
    match err {
        Error::Query(q) if q.kind == QueryErrorKind::Constraint => &q.message,
        other => panic!("expected constraint violation, got {other:?}"),
    }
}

#[test]
fn insert_fills_defaults_keys_and_tokens() {
    let db = database();
    let conn = db.connect();
    let region_id = region(&conn, "north");

    let record = Record::new(&DEPOT)
        .with("region_id", region_id)
        .unwrap()
        .with("name", "dock")
        .unwrap();
    let statement = insert_statement(&record);
    assert_eq!(statement.returning, vec!["id", "capacity", "version"]);
    let returned = insert(&conn, &record);

    assert_eq!(returned[0], Value::BigInt(1));
    assert_eq!(returned[1], Value::Int(100));
    match &returned[2] {
        Value::Bytes(token) => assert_eq!(token.len(), 8),
        other => panic!("expected token bytes, got {other:?}"),
    }
}

#[test]
fn unique_index_and_foreign_keys_are_enforced() {
    let db = database();
    let conn = db.connect();
    region(&conn, "north");

    let duplicate = Record::new(&REGION).with("name", "north").unwrap();
    let err = conn
        .execute_sync(&Statement::Insert(insert_statement(&duplicate)))
        .unwrap_err();
    assert!(constraint_message(&err).contains("ix_regions_name"));
    assert_eq!(db.row_count("regions").unwrap(), 1);

    let orphan = Record::new(&DEPOT)
        .with("region_id", 99_i64)
        .unwrap()
        .with("name", "lost")
        .unwrap();
    let err = conn
        .execute_sync(&Statement::Insert(insert_statement(&orphan)))
        .unwrap_err();
    assert!(constraint_message(&err).contains("FOREIGN KEY"));
}

#[test]
fn missing_required_value_violates_not_null() {
    let db = database();
    let conn = db.connect();
    let record = Record::new(&REGION);
    let err = conn
        .execute_sync(&Statement::Insert(insert_statement(&record)))
        .unwrap_err();
    assert!(constraint_message(&err).contains("regions.name"));
}

#[test]
fn delete_applies_referential_actions() {
    let db = database();
    let conn = db.connect();
    let region_id = region(&conn, "north");
    let (depot_id, token) = depot(&conn, region_id, "dock");
    pallet(&conn, depot_id, "12.50");
    pallet(&conn, depot_id, "7.25");
    sensor(&conn, "s-1", depot_id);

    // the region is still referenced by a depot
    let err = conn
        .execute_sync(&Statement::Delete(
            delete_statement(&REGION, &[Value::BigInt(region_id)], None).unwrap(),
        ))
        .unwrap_err();
    assert!(constraint_message(&err).contains("regions"));

    let result = conn
        .execute_sync(&Statement::Delete(
            delete_statement(&DEPOT, &[Value::BigInt(depot_id)], Some(&token)).unwrap(),
        ))
        .unwrap();
    assert_eq!(result.rows_affected, 1);
    assert_eq!(db.row_count("pallets").unwrap(), 0);

    let sensors = db.rows("sensors").unwrap();
    assert_eq!(sensors.len(), 1);
    assert_eq!(sensors[0].get_by_name("depot_id"), Some(&Value::Null));
}

#[test]
fn delete_reaches_only_dependents_of_removed_rows() {
    let schema = Schema::new(&[&REGION, &DEPOT, &PALLET, &SENSOR]).unwrap();
    let actions: Vec<_> = schema
        .dependents_of(&DEPOT)
        .iter()
        .map(|d| (d.entity.table, d.on_delete))
        .collect();
    assert_eq!(
        actions,
        vec![
            ("pallets", ReferentialAction::Cascade),
            ("sensors", ReferentialAction::SetNull),
        ]
    );

    let db = Database::new(&schema, MemoryConfig::default());
    let conn = db.connect();
    let region_id = region(&conn, "north");
    let (dock, token) = depot(&conn, region_id, "dock");
    let (yard, _) = depot(&conn, region_id, "yard");
    pallet(&conn, dock, "1.00");
    pallet(&conn, yard, "2.00");
    sensor(&conn, "s-dock", dock);
    sensor(&conn, "s-yard", yard);

    conn.execute_sync(&Statement::Delete(
        delete_statement(&DEPOT, &[Value::BigInt(dock)], Some(&token)).unwrap(),
    ))
    .unwrap();

    let pallets = db.rows("pallets").unwrap();
    assert_eq!(pallets.len(), 1);
    assert_eq!(pallets[0].get_by_name("depot_id"), Some(&Value::BigInt(yard)));

    let sensors = db.rows("sensors").unwrap();
    let depot_of = |serial: &str| {
        sensors
            .iter()
            .find(|r| r.get_by_name("serial") == Some(&Value::Text(serial.to_string())))
            .and_then(|r| r.get_by_name("depot_id").cloned())
    };
    assert_eq!(depot_of("s-dock"), Some(Value::Null));
    assert_eq!(depot_of("s-yard"), Some(Value::BigInt(yard)));
}

#[test]
fn keyed_update_checks_and_refreshes_token() {
    let db = database();
    let conn = db.connect();
    let region_id = region(&conn, "north");
    let (depot_id, token) = depot(&conn, region_id, "dock");

    let mut record = Record::new(&DEPOT)
        .with("id", depot_id)
        .unwrap()
        .with("region_id", region_id)
        .unwrap()
        .with("name", "dock")
        .unwrap();
    record.set("capacity", 250).unwrap();
    let capacity = DEPOT.field_index("capacity").unwrap();
    let key = [Value::BigInt(depot_id)];

    let update = update_statement(&record, &[capacity], &key, Some(&token)).unwrap();
    let first = conn.execute_sync(&Statement::Update(update.clone())).unwrap();
    assert_eq!(first.rows_affected, 1);
    let fresh = first.returned[0].get_by_name("version").cloned().unwrap();
    assert_ne!(fresh, token);

    // replaying with the old token matches nothing
    let stale = conn.execute_sync(&Statement::Update(update)).unwrap();
    assert_eq!(stale.rows_affected, 0);

    let rows = db.rows("depots").unwrap();
    assert_eq!(rows[0].get_by_name("capacity"), Some(&Value::Int(250)));
}

#[test]
fn joined_plan_pages_owners_and_keeps_empty_collections() {
    let db = database();
    let conn = db.connect();
    let region_id = region(&conn, "north");
    let (first, _) = depot(&conn, region_id, "alpha");
    let (second, _) = depot(&conn, region_id, "beta");
    let (third, _) = depot(&conn, region_id, "gamma");
    pallet(&conn, first, "1.00");
    pallet(&conn, first, "2.00");
    pallet(&conn, third, "3.00");

    let query = Query::new(&DEPOT)
        .include(Include::new("pallets"))
        .order_by(OrderBy::asc("name"));
    let plan = joined_plan(&query, &query.include_tree().unwrap()).unwrap();
    let rows = conn.query_sync(&plan.select).unwrap();
    let owners: Vec<_> = rows
        .iter()
        .map(|r| r.get_by_name("t0.id").and_then(Value::as_i64).unwrap())
        .collect();
    assert_eq!(owners, vec![first, first, second, third]);
    assert_eq!(rows[2].get_by_name("t1.id"), Some(&Value::Null));

    let paged = query.clone().offset(1).limit(1);
    let plan = joined_plan(&paged, &paged.include_tree().unwrap()).unwrap();
    let rows = conn.query_sync(&plan.select).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get_by_name("t0.id").and_then(Value::as_i64),
        Some(second)
    );
}

#[test]
fn projections_aggregate_server_side() {
    let db = database();
    let conn = db.connect();
    let region_id = region(&conn, "north");
    let (depot_id, _) = depot(&conn, region_id, "dock");
    pallet(&conn, depot_id, "12.50");
    pallet(&conn, depot_id, "7.25");

    let query = Query::new(&PALLET);
    let projection = Projection::new()
        .expr(Expr::count_star(), "pallets")
        .expr(Expr::col("weight").sum(), "total")
        .expr(Expr::col("weight").max(), "heaviest");
    let rows = conn
        .query_sync(&projection_select(&query, &projection).unwrap())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_by_name("pallets"), Some(&Value::BigInt(2)));
    assert_eq!(rows[0].get_by_name("total"), Some(&Value::Double(19.75)));
    assert_eq!(
        rows[0].get_by_name("heaviest"),
        Some(&Value::Decimal("12.50".into()))
    );

    let count = conn
        .query_sync(&count_select(&query.filter(Expr::col("weight").gt(10))))
        .unwrap();
    assert_eq!(count[0].get_by_name("count"), Some(&Value::BigInt(1)));
}

#[test]
fn bulk_update_evaluates_setters_per_row() {
    let db = database();
    let conn = db.connect();
    let region_id = region(&conn, "north");
    depot(&conn, region_id, "alpha");
    depot(&conn, region_id, "beta");

    let bulk = BulkUpdate::new(&DEPOT)
        .filter(Expr::col("name").ne("beta"))
        .set("name", Expr::col("name").concat(" (closed)"))
        .set("capacity", Expr::col("capacity").mul(2));
    let result = conn
        .execute_sync(&Statement::Update(bulk_update_statement(&bulk).unwrap()))
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    let rows = db.rows("depots").unwrap();
    assert_eq!(
        rows[0].get_by_name("name"),
        Some(&Value::Text("alpha (closed)".into()))
    );
    assert_eq!(rows[0].get_by_name("capacity"), Some(&Value::Int(200)));
    assert_eq!(rows[1].get_by_name("capacity"), Some(&Value::Int(100)));
}

#[test]
fn statement_log_records_rendered_sql() {
    let db = database();
    let conn = db.connect();
    region(&conn, "north");
    let statements = db.statements();
    assert_eq!(
        statements,
        vec!["INSERT INTO \"regions\" (\"name\") VALUES (?1) RETURNING \"id\"".to_string()]
    );

    db.clear_statements();
    assert!(db.statements().is_empty());

    let quiet = Database::new(
        &Schema::new(&[&REGION, &DEPOT, &PALLET, &SENSOR]).unwrap(),
        MemoryConfig::default().record_statements(false),
    );
    region(&quiet.connect(), "south");
    assert!(quiet.statements().is_empty());
}
