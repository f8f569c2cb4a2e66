use bson::{doc, Bson};
use mangrove::Database;
use pretty_assertions::assert_eq;

#[test]
fn insert_and_find_round_trip() {
    let db = Database::new("app");
    let insert_reply = db
        .run_command(doc! {
            "insert": "events",
            "documents": [ { "_id": 1, "kind": "a" }, { "_id": 2, "kind": "b" } ],
        })
        .unwrap();
    assert_eq!(insert_reply.get_i32("n").unwrap(), 2);
    assert_eq!(insert_reply.get_f64("ok").unwrap(), 1.0);

    let find_reply = db
        .run_command(doc! {
            "find": "events",
            "filter": { "kind": "a" },
        })
        .unwrap();
    let cursor = find_reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    assert_eq!(cursor.get_str("ns").unwrap(), "app.events");
    let batch = cursor.get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(
        batch[0].as_document().unwrap().get("kind"),
        Some(&Bson::String("a".into()))
    );
}

#[test]
fn find_batching_and_get_more() {
    let db = Database::new("app");
    let documents: Vec<Bson> = (0..10)
        .map(|i| Bson::Document(doc! { "_id": i }))
        .collect();
    db.run_command(doc! { "insert": "c", "documents": documents })
        .unwrap();

    let first = db
        .run_command(doc! { "find": "c", "batchSize": 4 })
        .unwrap();
    let cursor = first.get_document("cursor").unwrap();
    let cursor_id = cursor.get_i64("id").unwrap();
    assert_ne!(cursor_id, 0);
    assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 4);

    let more = db
        .run_command(doc! { "getMore": cursor_id, "collection": "c", "batchSize": 4 })
        .unwrap();
    let more_cursor = more.get_document("cursor").unwrap();
    assert_eq!(more_cursor.get_array("nextBatch").unwrap().len(), 4);
    assert_eq!(more_cursor.get_i64("id").unwrap(), cursor_id);

    let last = db
        .run_command(doc! { "getMore": cursor_id, "collection": "c" })
        .unwrap();
    let last_cursor = last.get_document("cursor").unwrap();
    assert_eq!(last_cursor.get_array("nextBatch").unwrap().len(), 2);
    assert_eq!(last_cursor.get_i64("id").unwrap(), 0);

    let gone = db
        .run_command(doc! { "getMore": cursor_id, "collection": "c" })
        .unwrap_err();
    assert_eq!(gone.code(), Some(43));
}

#[test]
fn insert_reply_carries_write_errors() {
    let db = Database::new("app");
    db.run_command(doc! {
        "createIndexes": "users",
        "indexes": [ { "key": { "email": 1 }, "name": "email_1", "unique": true } ],
    })
    .unwrap();
    db.run_command(doc! { "insert": "users", "documents": [ { "email": "x@y.z" } ] })
        .unwrap();

    let reply = db
        .run_command(doc! {
            "insert": "users",
            "documents": [ { "email": "x@y.z" }, { "email": "fresh@y.z" } ],
            "ordered": false,
        })
        .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    let write_errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(write_errors.len(), 1);
    let write_error = write_errors[0].as_document().unwrap();
    assert_eq!(write_error.get_i32("index").unwrap(), 0);
    assert_eq!(write_error.get_i32("code").unwrap(), 11000);
    assert!(write_error.get_str("errmsg").unwrap().contains("E11000"));
}

#[test]
fn update_command_reports_upserts() {
    let db = Database::new("app");
    let reply = db
        .run_command(doc! {
            "update": "inventory",
            "updates": [
                { "q": { "sku": "a" }, "u": { "$set": { "qty": 1 } }, "upsert": true },
                { "q": { "sku": "missing" }, "u": { "$set": { "qty": 2 } } },
            ],
        })
        .unwrap();
    assert_eq!(reply.get_i64("n").unwrap(), 1);
    assert_eq!(reply.get_i64("nModified").unwrap(), 0);
    let upserted = reply.get_array("upserted").unwrap();
    assert_eq!(upserted.len(), 1);
    assert_eq!(
        upserted[0].as_document().unwrap().get_i32("index").unwrap(),
        0
    );

    let multi = db
        .run_command(doc! {
            "update": "inventory",
            "updates": [
                { "q": {}, "u": { "$inc": { "qty": 10 } }, "multi": true },
            ],
        })
        .unwrap();
    assert_eq!(multi.get_i64("n").unwrap(), 1);
    assert_eq!(multi.get_i64("nModified").unwrap(), 1);
}

#[test]
fn delete_command_applies_limits() {
    let db = Database::new("app");
    let documents: Vec<Bson> = (0..5)
        .map(|i| Bson::Document(doc! { "_id": i, "k": i % 2 }))
        .collect();
    db.run_command(doc! { "insert": "c", "documents": documents })
        .unwrap();
    let reply = db
        .run_command(doc! {
            "delete": "c",
            "deletes": [
                { "q": { "k": 0 }, "limit": 1 },
                { "q": { "k": 1 }, "limit": 0 },
            ],
        })
        .unwrap();
    assert_eq!(reply.get_i64("n").unwrap(), 3);
}

#[test]
fn find_and_modify_returns_images() {
    let db = Database::new("app");
    db.run_command(doc! { "insert": "c", "documents": [ { "_id": 1, "v": 1 } ] })
        .unwrap();

    let before = db
        .run_command(doc! {
            "findAndModify": "c",
            "query": { "_id": 1 },
            "update": { "$inc": { "v": 1 } },
        })
        .unwrap();
    assert_eq!(
        before.get_document("value").unwrap(),
        &doc! { "_id": 1, "v": 1 }
    );

    let after = db
        .run_command(doc! {
            "findAndModify": "c",
            "query": { "_id": 1 },
            "update": { "$inc": { "v": 1 } },
            "new": true,
        })
        .unwrap();
    assert_eq!(
        after.get_document("value").unwrap(),
        &doc! { "_id": 1, "v": 3 }
    );

    let removed = db
        .run_command(doc! {
            "findAndModify": "c",
            "query": { "_id": 1 },
            "remove": true,
        })
        .unwrap();
    assert_eq!(
        removed.get_document("value").unwrap(),
        &doc! { "_id": 1, "v": 3 }
    );
    let gone = db
        .run_command(doc! {
            "findAndModify": "c",
            "query": { "_id": 1 },
            "remove": true,
        })
        .unwrap();
    assert_eq!(gone.get("value"), Some(&Bson::Null));
}

#[test]
fn count_and_distinct_commands() {
    let db = Database::new("app");
    let documents: Vec<Bson> = (0..6)
        .map(|i| Bson::Document(doc! { "g": i % 3 }))
        .collect();
    db.run_command(doc! { "insert": "c", "documents": documents })
        .unwrap();

    let count = db
        .run_command(doc! { "count": "c", "query": { "g": { "$gte": 1 } }, "limit": 3 })
        .unwrap();
    assert_eq!(count.get_i64("n").unwrap(), 3);

    let distinct = db
        .run_command(doc! { "distinct": "c", "key": "g" })
        .unwrap();
    assert_eq!(distinct.get_array("values").unwrap().len(), 3);
}

#[test]
fn index_ddl_commands() {
    let db = Database::new("app");
    let created = db
        .run_command(doc! {
            "createIndexes": "c",
            "indexes": [ { "key": { "a": 1, "b": -1 } } ],
        })
        .unwrap();
    assert_eq!(created.get_i32("numIndexesBefore").unwrap(), 1);
    assert_eq!(created.get_i32("numIndexesAfter").unwrap(), 2);

    let listed = db.run_command(doc! { "listIndexes": "c" }).unwrap();
    let batch = listed
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(
        batch[1].as_document().unwrap().get_str("name").unwrap(),
        "a_1_b_-1"
    );

    let dropped = db
        .run_command(doc! { "dropIndexes": "c", "index": "a_1_b_-1" })
        .unwrap();
    assert_eq!(dropped.get_i32("nIndexesWas").unwrap(), 2);

    let id_err = db
        .run_command(doc! { "dropIndexes": "c", "index": { "_id": 1 } })
        .unwrap_err();
    assert_eq!(id_err.code(), Some(72));
}

#[test]
fn aggregate_command_uses_cursor_shape() {
    let db = Database::new("app");
    db.run_command(doc! {
        "insert": "sales",
        "documents": [ { "v": 1 }, { "v": 2 }, { "v": 3 } ],
    })
    .unwrap();
    let reply = db
        .run_command(doc! {
            "aggregate": "sales",
            "pipeline": [ { "$group": { "_id": null, "sum": { "$sum": "$v" } } } ],
            "cursor": {},
        })
        .unwrap();
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(
        batch[0].as_document().unwrap().get("sum"),
        Some(&Bson::Int32(6))
    );
}

#[test]
fn unknown_commands_and_error_envelope() {
    let db = Database::new("app");
    let err = db.run_command(doc! { "frobnicate": 1 }).unwrap_err();
    assert_eq!(err.code(), Some(59));
    assert_eq!(err.code_name(), Some("CommandNotFound"));

    let envelope = db.run_command_reply(doc! { "frobnicate": 1 });
    assert_eq!(envelope.get_f64("ok").unwrap(), 0.0);
    assert_eq!(envelope.get_i32("code").unwrap(), 59);
    assert_eq!(envelope.get_str("codeName").unwrap(), "CommandNotFound");
    assert!(envelope.get_str("errmsg").unwrap().contains("frobnicate"));
}

#[test]
fn drop_and_list_collections() {
    let db = Database::new("app");
    db.run_command(doc! { "insert": "temp", "documents": [ { "x": 1 } ] })
        .unwrap();
    let listed = db.run_command(doc! { "listCollections": 1 }).unwrap();
    let batch = listed
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch.len(), 1);

    let dropped = db.run_command(doc! { "drop": "temp" }).unwrap();
    assert_eq!(dropped.get_str("ns").unwrap(), "app.temp");
    assert!(db.list_collection_names().is_empty());
}
