mod common;
use common::*;

use std::time::Duration;

use bson::doc;
use doppio_db::{Doc, EngineError, Handle, OperationType, WatchOptions};

fn insert_one(engine: &doppio_db::Engine, id: i32) {
    let mut txn = engine.begin(true);
    ok(txn
        .insert(&accounts(), vec![Doc::new(doc! { "_id": id })], true)
        .unwrap());
    txn.commit().unwrap();
}

#[test]
fn committed_mutations_arrive_in_commit_order() {
    let engine = engine();
    let stream = engine.watch(accounts(), WatchOptions::default()).unwrap();

    insert_one(&engine, 1);
    insert_one(&engine, 2);

    let first = stream.try_next().unwrap().unwrap();
    let second = stream.try_next().unwrap().unwrap();
    assert_eq!(first.operation, OperationType::Insert);
    assert_eq!(
        first.document_key.as_ref().unwrap(),
        &doc! { "_id": 1 }
    );
    assert_eq!(
        second.document_key.as_ref().unwrap(),
        &doc! { "_id": 2 }
    );
    assert!(first.token < second.token);
    assert!(stream.try_next().unwrap().is_none());
}

#[test]
fn update_events_carry_update_description() {
    let engine = engine();
    insert_one(&engine, 1);
    let stream = engine.watch(accounts(), WatchOptions::default()).unwrap();

    let mut txn = engine.begin(true);
    txn.update(
        &accounts(),
        &doc! { "_id": 1 },
        None,
        &doc! { "$set": { "a": 5 }, "$unset": { "b": "" } },
        0,
        0,
        false,
        &[],
    )
    .unwrap();
    txn.commit().unwrap();

    let event = stream.next_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(event.operation, OperationType::Update);
    let desc = event.update_description.unwrap();
    assert_eq!(desc.updated_fields, doc! { "a": 5 });
    assert!(desc.removed_fields.is_empty());
    assert_eq!(
        event.full_document.unwrap().get_i32("a").unwrap(),
        5
    );
}

#[test]
fn resume_after_replays_only_later_events() {
    let engine = engine();
    let stream = engine.watch(accounts(), WatchOptions::default()).unwrap();

    insert_one(&engine, 1); // A
    insert_one(&engine, 2); // B

    stream.try_next().unwrap().unwrap();
    let token_b = stream.try_next().unwrap().unwrap().token;

    insert_one(&engine, 3); // C

    let resumed = engine
        .watch(
            accounts(),
            WatchOptions {
                resume_after: Some(token_b),
                ..WatchOptions::default()
            },
        )
        .unwrap();
    let event = resumed.try_next().unwrap().unwrap();
    assert_eq!(event.document_key.as_ref().unwrap(), &doc! { "_id": 3 });
    assert!(resumed.try_next().unwrap().is_none());
}

#[test]
fn scopes_filter_events() {
    let engine = engine();
    let cluster = engine.watch(Handle::cluster(), WatchOptions::default()).unwrap();
    let db = engine.watch(Handle::database("app"), WatchOptions::default()).unwrap();
    let other = engine
        .watch(Handle::new("elsewhere", "c"), WatchOptions::default())
        .unwrap();

    insert_one(&engine, 1);

    assert!(cluster.try_next().unwrap().is_some());
    assert!(db.try_next().unwrap().is_some());
    assert!(other.try_next().unwrap().is_none());
}

#[test]
fn drop_emits_invalidate_and_closes() {
    let engine = engine();
    insert_one(&engine, 1);
    let stream = engine.watch(accounts(), WatchOptions::default()).unwrap();

    let mut txn = engine.begin(true);
    txn.drop(&accounts()).unwrap();
    txn.commit().unwrap();

    let drop_event = stream.try_next().unwrap().unwrap();
    assert_eq!(drop_event.operation, OperationType::Drop);
    let invalidate = stream.try_next().unwrap().unwrap();
    assert_eq!(invalidate.operation, OperationType::Invalidate);
    assert!(stream.is_closed());
}

#[test]
fn database_drop_invalidates_streams_watching_inside_it() {
    let engine = engine();
    insert_one(&engine, 1);
    let coll_stream = engine.watch(accounts(), WatchOptions::default()).unwrap();
    let db_stream = engine
        .watch(Handle::database(DB), WatchOptions::default())
        .unwrap();

    let mut txn = engine.begin(true);
    txn.drop(&Handle::database(DB)).unwrap();
    txn.commit().unwrap();

    // the collection stream sees its drop, then closes
    let drop_event = coll_stream.try_next().unwrap().unwrap();
    assert_eq!(drop_event.operation, OperationType::Drop);
    let invalidate = coll_stream.try_next().unwrap().unwrap();
    assert_eq!(invalidate.operation, OperationType::Invalidate);
    assert!(coll_stream.is_closed());

    // the database stream sees the collection drop and the database drop
    let drop_event = db_stream.try_next().unwrap().unwrap();
    assert_eq!(drop_event.operation, OperationType::Drop);
    let db_drop = db_stream.try_next().unwrap().unwrap();
    assert_eq!(db_drop.operation, OperationType::DropDatabase);
    let invalidate = db_stream.try_next().unwrap().unwrap();
    assert_eq!(invalidate.operation, OperationType::Invalidate);
    assert!(db_stream.is_closed());
}

#[test]
fn lagged_subscriber_loses_history() {
    let engine = engine();
    let stream = engine
        .watch(
            accounts(),
            WatchOptions {
                buffer: 1,
                ..WatchOptions::default()
            },
        )
        .unwrap();

    let mut txn = engine.begin(true);
    ok(txn
        .insert(
            &accounts(),
            vec![Doc::new(doc! { "_id": 1 }), Doc::new(doc! { "_id": 2 })],
            true,
        )
        .unwrap());
    txn.commit().unwrap();

    // the buffered event is still delivered, then the overflow surfaces
    assert!(stream.try_next().unwrap().is_some());
    assert!(matches!(
        stream.try_next(),
        Err(EngineError::ChangeStreamHistoryLost)
    ));
    assert!(stream.is_closed());
}

#[test]
fn events_render_driver_shaped_documents() {
    let engine = engine();
    let stream = engine.watch(accounts(), WatchOptions::default()).unwrap();
    insert_one(&engine, 9);

    let event = stream.try_next().unwrap().unwrap();
    let rendered = event.to_document();
    assert_eq!(rendered.get_str("operationType").unwrap(), "insert");
    let ns = rendered.get_document("ns").unwrap();
    assert_eq!(ns.get_str("db").unwrap(), DB);
    assert_eq!(ns.get_str("coll").unwrap(), COLLECTION);
    assert!(rendered.get_document("_id").is_ok());
    assert!(rendered.get_document("fullDocument").is_ok());
}
