use asupersync::{Cx, Outcome};
use folio_core::error::IdentityErrorKind;
use folio_core::{
    EntityDescriptor, Error, FieldDescriptor, FieldType, IndexDescriptor, KeyGeneration, Literal,
    Record, ReferentialAction, RelationshipDescriptor, Schema, ValidationErrorKind, Value, col,
};
use folio_memory::{Database, MemoryConfig, MemoryConnection};
use folio_query::{Include, Projection, Query, Tracking};
use folio_session::{EntityRef, EntityState, Session, SessionConfig};

static TEAM: EntityDescriptor = EntityDescriptor {
    name: "Team",
    table: "teams",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("name", FieldType::Text)
            .required()
            .max_length(40),
        FieldDescriptor::new("city", FieldType::Text),
        FieldDescriptor::new("version", FieldType::Token),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: Some("version"),
    relationships: &[RelationshipDescriptor::one_to_many(
        "players",
        &PLAYER,
        "id",
        "team_id",
        ReferentialAction::Cascade,
    )],
    indexes: &[IndexDescriptor::unique("ix_teams_name", &["name"])],
    soft_filter: None,
};

static PLAYER: EntityDescriptor = EntityDescriptor {
    name: "Player",
    table: "players",
    fields: &[
        FieldDescriptor::new("id", FieldType::BigInt).generated(),
        FieldDescriptor::new("team_id", FieldType::BigInt)
            .required()
            .references(&TEAM, "id", ReferentialAction::Cascade),
        FieldDescriptor::new("name", FieldType::Text).required(),
        FieldDescriptor::new("rating", FieldType::Int)
            .required()
            .store_default(Literal::Int(50)),
    ],
    key: &["id"],
    key_generation: KeyGeneration::Store,
    concurrency_token: None,
    relationships: &[RelationshipDescriptor::many_to_one(
        "team", &TEAM, "team_id", "id",
    )],
    indexes: &[],
    soft_filter: None,
};

fn database() -> Database {
    let schema = Schema::new(&[&TEAM, &PLAYER]).unwrap();
    Database::new(&schema, MemoryConfig::default())
}

fn block_on<F: Future>(f: F) -> F::Output {
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got a value"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn team(name: &str) -> Record {
    Record::new(&TEAM).with("name", name).unwrap()
}

fn player(name: &str) -> Record {
    Record::new(&PLAYER).with("name", name).unwrap()
}

/// One team with two players, written through a separate session.
fn seed(db: &Database, cx: &Cx) -> i64 {
    block_on(async {
        let mut session = Session::new(db.connect());
        let lions = session.add(team("Lions")).unwrap();
        for name in ["Ada", "Bo"] {
            let p = session.add(player(name)).unwrap();
            session.relate(&p, "team_id", &lions).unwrap();
        }
        unwrap_outcome(session.flush(cx).await);
        session.close(cx).await.unwrap();
        lions.get_as::<i64>("id").unwrap()
    })
}

fn open(db: &Database) -> Session<MemoryConnection> {
    Session::new(db.connect())
}

#[test]
fn flush_adopts_generated_keys_defaults_and_tokens() {
    let db = database();
    let cx = Cx::for_testing();
    block_on(async {
        let mut session = open(&db);
        let lions = session.add(team("Lions")).unwrap();
        assert_eq!(session.state_of(&lions), EntityState::Added);
        assert!(lions.entity_key().is_none());

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 1);

        assert!(lions.get_as::<i64>("id").unwrap() > 0);
        assert!(lions.read().token().is_some());
        assert_eq!(session.state_of(&lions), EntityState::Unchanged);
        assert!(session.contains(&lions));
        assert!(!session.has_changes());
    });
}

#[test]
fn related_children_are_inserted_after_their_parent() {
    let db = database();
    let cx = Cx::for_testing();
    block_on(async {
        let mut session = open(&db);
        // the child is added first; the flush still inserts the team first
        let ada = session.add(player("Ada")).unwrap();
        let lions = session.add(team("Lions")).unwrap();
        session.relate(&ada, "team_id", &lions).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        assert_eq!(ada.get("team_id"), lions.get("id"));
        assert_eq!(ada.get_as::<i32>("rating").unwrap(), 50);

        let inserts: Vec<String> = db
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("INSERT"))
            .collect();
        assert!(inserts[0].starts_with("INSERT INTO \"teams\""));
        assert!(inserts[1].starts_with("INSERT INTO \"players\""));
    });
}

#[test]
fn validation_failure_opens_no_transaction() {
    let db = database();
    let cx = Cx::for_testing();
    block_on(async {
        let mut session = open(&db);
        let nameless = session.add(Record::new(&TEAM)).unwrap();

        let err = expect_err(session.flush(&cx).await);
        match err {
            Error::Validation(v) => {
                assert_eq!(v.errors[0].kind, ValidationErrorKind::Required);
                assert_eq!(v.errors[0].field, "name");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(db.statements().is_empty());
        assert_eq!(session.state_of(&nameless), EntityState::Added);
    });
}

#[test]
fn store_failure_rolls_back_the_whole_flush() {
    let db = database();
    let cx = Cx::for_testing();
    seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let fresh = session.add(team("Tigers")).unwrap();
        let duplicate = session.add(team("Lions")).unwrap();

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::FlushFailed(_)), "got {err:?}");
        assert_eq!(db.row_count("teams").unwrap(), 1);
        assert_eq!(db.statements().last().map(String::as_str), Some("ROLLBACK"));

        // nothing was adopted, so both instances are still pending inserts
        assert!(fresh.entity_key().is_none());
        assert_eq!(session.state_of(&fresh), EntityState::Added);
        assert_eq!(session.state_of(&duplicate), EntityState::Added);
    });
}

#[test]
fn removing_an_owner_sweeps_and_detaches_dependents() {
    let db = database();
    let cx = Cx::for_testing();
    let team_id = seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let query = Query::new(&TEAM)
            .filter(col("id").eq(team_id))
            .include(Include::new("players"));
        let teams = unwrap_outcome(session.load(&cx, &query).await);
        let lions = teams[0].entity().clone();
        let ada = teams[0].many("players")[0].entity().clone();

        session.remove(&lions).unwrap();
        assert_eq!(session.state_of(&lions), EntityState::Deleted);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.cascaded, 2);

        assert_eq!(db.row_count("players").unwrap(), 0);
        assert_eq!(session.state_of(&lions), EntityState::Detached);
        assert_eq!(session.state_of(&ada), EntityState::Detached);
        assert_eq!(session.tracked_count(), 0);
    });
}

#[test]
fn removing_an_added_instance_forgets_it() {
    let db = database();
    let cx = Cx::for_testing();
    block_on(async {
        let mut session = open(&db);
        let lions = session.add(team("Lions")).unwrap();
        session.remove(&lions).unwrap();
        assert_eq!(session.state_of(&lions), EntityState::Detached);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert!(result.is_empty());

        let stranger = EntityRef::new(team("Nobody"));
        match session.remove(&stranger) {
            Err(Error::Identity(e)) => assert_eq!(e.kind, IdentityErrorKind::NotTracked),
            other => panic!("expected NotTracked, got {other:?}"),
        }
    });
}

#[test]
fn reload_discards_local_edits() {
    let db = database();
    let cx = Cx::for_testing();
    let team_id = seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let lions = unwrap_outcome(session.get(&cx, &TEAM, &[Value::BigInt(team_id)]).await);
        lions.set("city", "Leeds").unwrap();
        assert_eq!(session.state_of(&lions), EntityState::Modified);

        unwrap_outcome(session.reload(&cx, &lions).await);
        assert_eq!(lions.get("city"), Some(Value::Null));
        assert_eq!(session.state_of(&lions), EntityState::Unchanged);
    });
}

#[test]
fn find_uses_the_identity_map_before_the_store() {
    let db = database();
    let cx = Cx::for_testing();
    let team_id = seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let key = [Value::BigInt(team_id)];
        let first = unwrap_outcome(session.find(&cx, &TEAM, &key).await).unwrap();
        db.clear_statements();

        let again = unwrap_outcome(session.find(&cx, &TEAM, &key).await).unwrap();
        assert!(EntityRef::ptr_eq(&first, &again));
        assert!(db.statements().is_empty());

        let missing = session.get(&cx, &TEAM, &[Value::BigInt(999)]).await;
        assert!(matches!(expect_err(missing), Error::NotFound(_)));
    });
}

#[test]
fn update_writes_every_non_key_field_of_a_disconnected_instance() {
    let db = database();
    let cx = Cx::for_testing();
    let team_id = seed(&db, &cx);
    let token = db.rows("teams").unwrap()[0]
        .get_by_name("version")
        .cloned()
        .unwrap();
    block_on(async {
        let mut session = open(&db);
        let detached = team("Lions")
            .with("id", team_id)
            .unwrap()
            .with("city", "Hull")
            .unwrap()
            .with("version", token)
            .unwrap();
        let lions = session.update(detached).unwrap();
        assert_eq!(session.state_of(&lions), EntityState::Modified);
        db.clear_statements();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.updated, 1);
        let update = db
            .statements()
            .into_iter()
            .find(|s| s.starts_with("UPDATE"))
            .unwrap();
        assert!(
            update.starts_with("UPDATE \"teams\" SET \"name\" = ?1, \"city\" = ?2 WHERE"),
            "{update}"
        );
    });
}

#[test]
fn attaching_a_second_instance_for_a_key_is_rejected() {
    let db = database();
    let cx = Cx::for_testing();
    let team_id = seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        unwrap_outcome(session.get(&cx, &TEAM, &[Value::BigInt(team_id)]).await);
        match session.attach(team("Lions").with("id", team_id).unwrap()) {
            Err(Error::Identity(e)) => assert_eq!(e.kind, IdentityErrorKind::Duplicate),
            other => panic!("expected Duplicate, got {other:?}"),
        }
        assert!(matches!(session.attach(team("Keyless")), Err(Error::Validation(_))));
    });
}

#[test]
fn open_stream_keeps_the_session_busy() {
    let db = database();
    let cx = Cx::for_testing();
    seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let mut stream = unwrap_outcome(session.stream(&cx, &Query::new(&PLAYER)).await);
        assert!(session.is_busy());

        let first = unwrap_outcome(stream.next(&cx).await).unwrap();
        let busy = session.count(&cx, &Query::new(&TEAM)).await;
        assert!(matches!(expect_err(busy), Error::ConnectionBusy));
        assert!(matches!(expect_err(session.flush(&cx).await), Error::ConnectionBusy));

        stream.close();
        assert!(stream.is_closed());
        assert!(!session.is_busy());
        assert_eq!(unwrap_outcome(session.count(&cx, &Query::new(&TEAM)).await), 1);

        // the streamed instance is tracked like a loaded one
        assert_eq!(session.state_of(&first), EntityState::Unchanged);
    });
}

#[test]
fn cancelled_stream_aborts_and_keeps_produced_items() {
    let db = database();
    let cx = Cx::for_testing();
    seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let query = Query::new(&PLAYER).untracked();
        let mut stream = unwrap_outcome(session.stream(&cx, &query).await);
        let handle = stream.cancel_handle();

        let first = unwrap_outcome(stream.next(&cx).await).unwrap();
        handle.cancel();
        assert!(matches!(expect_err(stream.next(&cx).await), Error::StreamAborted(_)));
        assert!(stream.is_closed());
        assert_eq!(stream.produced(), 1);

        assert_eq!(first.get_as::<String>("name").unwrap(), "Ada");
        assert_eq!(session.state_of(&first), EntityState::Detached);
        assert!(!session.is_busy());
    });
}

#[test]
fn streams_reject_includes_unless_relaxed() {
    let db = database();
    let cx = Cx::for_testing();
    seed(&db, &cx);
    block_on(async {
        let query = Query::new(&TEAM).include(Include::new("players"));
        let mut strict = open(&db);
        let err = expect_err(strict.stream(&cx, &query).await);
        assert!(matches!(err, Error::Query(_)), "got {err:?}");
        assert!(!strict.is_busy());

        let mut relaxed = Session::with_config(
            db.connect(),
            SessionConfig::default().strict_streams(false),
        );
        let stream = unwrap_outcome(relaxed.stream(&cx, &query).await);
        let teams = unwrap_outcome(stream.collect(&cx).await);
        assert_eq!(teams.len(), 1);
    });
}

#[test]
fn projection_streams_rows_lazily() {
    let db = database();
    let cx = Cx::for_testing();
    seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let projection = Projection::new().field(&PLAYER, "name").unwrap();
        let mut rows = unwrap_outcome(
            session
                .stream_projection(&cx, &Query::new(&PLAYER), &projection)
                .await,
        );
        let mut names = Vec::new();
        while let Some(row) = unwrap_outcome(rows.next(&cx).await) {
            names.push(row.get_named::<String>("name").unwrap());
        }
        assert_eq!(names, ["Ada", "Bo"]);
        assert!(rows.is_closed());
        assert_eq!(session.tracked_count(), 0);
    });
}

#[test]
fn identity_resolution_shares_instances_within_one_query_only() {
    let db = database();
    let cx = Cx::for_testing();
    seed(&db, &cx);
    block_on(async {
        let mut session = open(&db);
        let query = Query::new(&PLAYER)
            .include(Include::new("team"))
            .untracked_with_identity_resolution();
        let players = unwrap_outcome(session.load(&cx, &query).await);
        let a = players[0].one("team").unwrap().entity();
        let b = players[1].one("team").unwrap().entity();
        assert!(EntityRef::ptr_eq(a, b));

        let again = unwrap_outcome(session.load(&cx, &query).await);
        assert!(!EntityRef::ptr_eq(a, again[0].one("team").unwrap().entity()));
        assert_eq!(session.tracked_count(), 0);

        let untracked = query.clone().tracking(Tracking::Untracked);
        let plain = unwrap_outcome(session.load(&cx, &untracked).await);
        let c = plain[0].one("team").unwrap().entity();
        let d = plain[1].one("team").unwrap().entity();
        assert!(!EntityRef::ptr_eq(c, d));
    });
}

#[test]
fn auto_flush_writes_pending_changes_before_tracked_queries() {
    let db = database();
    let cx = Cx::for_testing();
    block_on(async {
        let mut session =
            Session::with_config(db.connect(), SessionConfig::default().auto_flush(true));
        session.add(team("Lions")).unwrap();
        let teams = unwrap_outcome(session.load(&cx, &Query::new(&TEAM)).await);
        assert_eq!(teams.len(), 1);
        assert!(!session.has_changes());
    });
}

#[test]
fn scoped_session_closes_on_every_path() {
    let db = database();
    let cx = Cx::for_testing();
    block_on(async {
        let added = Session::scoped(db.connect(), SessionConfig::default(), &cx, async |s| {
            s.add(team("Lions")).unwrap();
            s.flush(&cx).await
        })
        .await;
        assert_eq!(unwrap_outcome(added).inserted, 1);

        let failed = Session::scoped(db.connect(), SessionConfig::default(), &cx, async |s| {
            s.get(&cx, &TEAM, &[Value::BigInt(404)]).await
        })
        .await;
        assert!(matches!(expect_err(failed), Error::NotFound(_)));
        assert_eq!(db.row_count("teams").unwrap(), 1);
    });
}
