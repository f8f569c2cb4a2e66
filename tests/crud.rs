use bson::{doc, Bson};
use mangrove::{
    error::ErrorKind,
    options::{
        FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions,
        InsertManyOptions, ReturnDocument, UpdateOptions,
    },
    Database, IndexModel, IndexOptions,
};
use pretty_assertions::assert_eq;

fn unique_email_collection(db: &Database) -> mangrove::Collection {
    let coll = db.collection("users");
    coll.create_index(
        IndexModel::builder()
            .keys(doc! { "email": 1 })
            .options(Some(IndexOptions::builder().unique(Some(true)).build()))
            .build(),
    )
    .unwrap();
    coll
}

#[test]
fn insert_generates_object_ids() {
    let db = Database::new("t");
    let coll = db.collection("c");
    let result = coll.insert_one(doc! { "x": 1 }).unwrap();
    assert!(matches!(result.inserted_id, Bson::ObjectId(_)));
    let stored = coll.find_one(doc! {}).unwrap().unwrap();
    assert_eq!(stored.keys().next().map(String::as_str), Some("_id"));
    assert_eq!(stored.get("x"), Some(&Bson::Int32(1)));
}

#[test]
fn insert_preserves_explicit_ids_and_rejects_duplicates() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_one(doc! { "_id": 7, "x": 1 }).unwrap();
    let err = coll.insert_one(doc! { "_id": 7, "x": 2 }).unwrap_err();
    assert!(err.is_duplicate_key());
    assert!(err.message().unwrap().contains("_id_"));
    assert_eq!(coll.estimated_document_count().unwrap(), 1);
}

#[test]
fn array_ids_are_rejected() {
    let db = Database::new("t");
    let coll = db.collection("c");
    let err = coll.insert_one(doc! { "_id": [1, 2] }).unwrap_err();
    assert_eq!(err.code(), Some(2));
}

#[test]
fn ordered_bulk_stops_at_first_duplicate() {
    let db = Database::new("t");
    let coll = unique_email_collection(&db);
    coll.insert_one(doc! { "email": "taken@x.io" }).unwrap();

    let err = coll
        .insert_many(
            vec![
                doc! { "email": "taken@x.io" },
                doc! { "email": "new@x.io" },
            ],
            InsertManyOptions::builder().ordered(Some(true)).build(),
        )
        .unwrap_err();
    match *err.kind {
        ErrorKind::BulkWrite(ref failure) => {
            assert_eq!(failure.write_errors.len(), 1);
            assert_eq!(failure.write_errors[0].index, 0);
            assert_eq!(failure.write_errors[0].code, 11000);
        }
        ref other => panic!("expected bulk write failure, got {:?}", other),
    }
    // The second insert never ran.
    assert_eq!(coll.count_documents(doc! { "email": "new@x.io" }).unwrap(), 0);
}

#[test]
fn unordered_bulk_completes_non_conflicting_inserts() {
    let db = Database::new("t");
    let coll = unique_email_collection(&db);
    coll.insert_one(doc! { "email": "taken@x.io" }).unwrap();

    let err = coll
        .insert_many(
            vec![
                doc! { "email": "taken@x.io" },
                doc! { "email": "new@x.io" },
            ],
            InsertManyOptions::builder().ordered(Some(false)).build(),
        )
        .unwrap_err();
    match *err.kind {
        ErrorKind::BulkWrite(ref failure) => {
            assert_eq!(failure.write_errors.len(), 1);
            assert_eq!(failure.inserted_ids.len(), 1);
        }
        ref other => panic!("expected bulk write failure, got {:?}", other),
    }
    // The second insert did run.
    assert_eq!(coll.count_documents(doc! { "email": "new@x.io" }).unwrap(), 1);
}

#[test]
fn update_accounting_distinguishes_matched_and_modified() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_one(doc! { "_id": 1, "v": 5 }).unwrap();

    let same = coll
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "v": 5 } }, Default::default())
        .unwrap();
    assert_eq!(same.matched_count, 1);
    assert_eq!(same.modified_count, 0);

    let changed = coll
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "v": 6 } }, Default::default())
        .unwrap();
    assert_eq!(changed.matched_count, 1);
    assert_eq!(changed.modified_count, 1);
}

#[test]
fn update_many_unique_violation_changes_nothing() {
    let db = Database::new("t");
    let coll = db.collection("items");
    coll.create_index(
        IndexModel::builder()
            .keys(doc! { "code": 1 })
            .options(Some(IndexOptions::builder().unique(Some(true)).build()))
            .build(),
    )
    .unwrap();
    coll.insert_many(
        vec![doc! { "code": 1 }, doc! { "code": 2 }, doc! { "code": 3 }],
        Default::default(),
    )
    .unwrap();

    let err = coll
        .update_many(
            doc! { "code": { "$gt": 1 } },
            doc! { "$set": { "code": 1 } },
            Default::default(),
        )
        .unwrap_err();
    assert!(err.is_duplicate_key());

    let mut codes = coll.distinct("code", doc! {}).unwrap();
    codes.sort_by_key(|c| c.as_i32().unwrap());
    assert_eq!(codes, vec![Bson::Int32(1), Bson::Int32(2), Bson::Int32(3)]);
}

#[test]
fn upsert_inserts_seed_and_reports_id() {
    let db = Database::new("t");
    let coll = db.collection("c");
    let result = coll
        .update_one(
            doc! { "sku": "abc", "qty": { "$gt": 0 } },
            doc! { "$set": { "qty": 10 } },
            UpdateOptions::builder().upsert(Some(true)).build(),
        )
        .unwrap();
    assert_eq!(result.matched_count, 0);
    assert_eq!(result.modified_count, 0);
    let upserted_id = result.upserted_id.expect("upserted id");
    let stored = coll.find_one(doc! { "_id": upserted_id }).unwrap().unwrap();
    assert_eq!(stored.get("sku"), Some(&Bson::String("abc".into())));
    assert_eq!(stored.get("qty"), Some(&Bson::Int32(10)));
}

#[test]
fn find_one_and_replace_upsert_returns_post_image() {
    let db = Database::new("t");
    let coll = db.collection("c");
    let value = coll
        .find_one_and_replace(
            doc! { "name": "X" },
            doc! { "name": "X", "v": 1 },
            FindOneAndReplaceOptions::builder()
                .upsert(Some(true))
                .return_document(Some(ReturnDocument::After))
                .build(),
        )
        .unwrap()
        .expect("post image");
    assert!(matches!(value.get("_id"), Some(Bson::ObjectId(_))));
    assert_eq!(value.get("name"), Some(&Bson::String("X".into())));
    assert_eq!(value.get("v"), Some(&Bson::Int32(1)));
}

#[test]
fn find_one_and_update_images_and_sort() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_many(
        vec![
            doc! { "_id": 1, "rank": 5 },
            doc! { "_id": 2, "rank": 1 },
            doc! { "_id": 3, "rank": 9 },
        ],
        Default::default(),
    )
    .unwrap();

    // Default is the pre-image; sort picks the lowest rank.
    let before = coll
        .find_one_and_update(
            doc! {},
            doc! { "$inc": { "rank": 100 } },
            FindOneAndUpdateOptions::builder()
                .sort(Some(doc! { "rank": 1 }))
                .build(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(before.get("_id"), Some(&Bson::Int32(2)));
    assert_eq!(before.get("rank"), Some(&Bson::Int32(1)));
    assert_eq!(
        coll.find_one(doc! { "_id": 2 }).unwrap().unwrap().get("rank"),
        Some(&Bson::Int32(101))
    );

    // Upsert with the default pre-image returns None while creating the document.
    let missing = coll
        .find_one_and_update(
            doc! { "_id": 99 },
            doc! { "$set": { "rank": 0 } },
            FindOneAndUpdateOptions::builder().upsert(Some(true)).build(),
        )
        .unwrap();
    assert!(missing.is_none());
    assert!(coll.find_one(doc! { "_id": 99 }).unwrap().is_some());
}

#[test]
fn find_one_and_delete_returns_and_removes() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_one(doc! { "_id": 1, "x": 1 }).unwrap();
    let deleted = coll
        .find_one_and_delete(doc! { "_id": 1 }, Default::default())
        .unwrap()
        .unwrap();
    assert_eq!(deleted.get("x"), Some(&Bson::Int32(1)));
    assert_eq!(coll.estimated_document_count().unwrap(), 0);
    assert!(coll
        .find_one_and_delete(doc! { "_id": 1 }, Default::default())
        .unwrap()
        .is_none());
}

#[test]
fn delete_one_and_many() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_many(
        vec![doc! { "k": 1 }, doc! { "k": 1 }, doc! { "k": 2 }],
        Default::default(),
    )
    .unwrap();
    assert_eq!(coll.delete_one(doc! { "k": 1 }).unwrap().deleted_count, 1);
    assert_eq!(coll.delete_many(doc! {}).unwrap().deleted_count, 2);
}

#[test]
fn limit_skip_boundaries() {
    let db = Database::new("t");
    let coll = db.collection("c");
    for i in 0..10 {
        coll.insert_one(doc! { "i": i }).unwrap();
    }

    // limit 0 means no limit.
    let all: Vec<_> = coll
        .find_with_options(doc! {}, FindOptions::builder().limit(Some(0)).build())
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert_eq!(all.len(), 10);

    // A negative limit caps at |n|.
    let capped: Vec<_> = coll
        .find_with_options(doc! {}, FindOptions::builder().limit(Some(-3)).build())
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert!(capped.len() <= 3);

    // Skipping past the candidate set yields nothing.
    let none: Vec<_> = coll
        .find_with_options(doc! {}, FindOptions::builder().skip(Some(100)).build())
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn cursors_snapshot_membership_but_observe_updates() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_many(
        vec![doc! { "_id": 1, "v": 1 }, doc! { "_id": 2, "v": 2 }],
        Default::default(),
    )
    .unwrap();

    let mut cursor = coll.find(doc! {}).unwrap();
    // Inserted after the snapshot: invisible.
    coll.insert_one(doc! { "_id": 3, "v": 3 }).unwrap();
    // Updated after the snapshot: post-image observed.
    coll.update_one(doc! { "_id": 2 }, doc! { "$set": { "v": 20 } }, Default::default())
        .unwrap();
    // Deleted after the snapshot: skipped.
    coll.delete_one(doc! { "_id": 1 }).unwrap();

    let remaining: Vec<_> = cursor.by_ref().collect::<mangrove::error::Result<_>>().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].get("v"), Some(&Bson::Int32(20)));
}

#[test]
fn projection_shapes_results() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_one(doc! { "_id": 1, "a": 1, "b": { "c": 2, "d": 3 } })
        .unwrap();

    let included = coll
        .find_one_with_options(
            doc! {},
            FindOneOptions::builder()
                .projection(Some(doc! { "b.c": 1 }))
                .build(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(included, doc! { "_id": 1, "b": { "c": 2 } });

    let excluded = coll
        .find_one_with_options(
            doc! {},
            FindOneOptions::builder()
                .projection(Some(doc! { "_id": 0, "b": 0 }))
                .build(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(excluded, doc! { "a": 1 });
}

#[test]
fn count_and_distinct() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_many(
        vec![
            doc! { "tags": ["a", "b"] },
            doc! { "tags": ["b", "c"] },
            doc! { "tags": "c" },
        ],
        Default::default(),
    )
    .unwrap();
    assert_eq!(coll.count_documents(doc! { "tags": "b" }).unwrap(), 2);
    let distinct = coll.distinct("tags", doc! {}).unwrap();
    assert_eq!(distinct.len(), 3);
}

#[test]
fn replace_one_keeps_id() {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_one(doc! { "_id": 5, "a": 1 }).unwrap();
    let result = coll
        .replace_one(doc! { "_id": 5 }, doc! { "b": 2 }, Default::default())
        .unwrap();
    assert_eq!(result.modified_count, 1);
    assert_eq!(
        coll.find_one(doc! {}).unwrap().unwrap(),
        doc! { "_id": 5, "b": 2 }
    );
}
