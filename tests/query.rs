use bson::{doc, Bson};
use mangrove::{options::FindOptions, Collection, Database, IndexModel};

fn seeded(docs: Vec<bson::Document>) -> Collection {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_many(docs, Default::default()).unwrap();
    coll
}

fn ids(coll: &Collection, filter: bson::Document) -> Vec<i32> {
    let mut found: Vec<i32> = coll
        .find(filter)
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    found.sort_unstable();
    found
}

#[test]
fn comparison_operators_across_types() {
    let coll = seeded(vec![
        doc! { "_id": 1, "v": 5 },
        doc! { "_id": 2, "v": 5.5 },
        doc! { "_id": 3, "v": "text" },
        doc! { "_id": 4, "v": Bson::Null },
        doc! { "_id": 5 },
    ]);
    assert_eq!(ids(&coll, doc! { "v": { "$gt": 5 } }), vec![2]);
    assert_eq!(ids(&coll, doc! { "v": { "$gte": 5 } }), vec![1, 2]);
    assert_eq!(ids(&coll, doc! { "v": { "$lt": 100 } }), vec![1, 2]);
    // Null equality also matches missing.
    assert_eq!(ids(&coll, doc! { "v": Bson::Null }), vec![4, 5]);
    assert_eq!(ids(&coll, doc! { "v": { "$ne": 5 } }), vec![2, 3, 4, 5]);
    assert_eq!(ids(&coll, doc! { "v": { "$exists": true } }), vec![1, 2, 3, 4]);
    assert_eq!(ids(&coll, doc! { "v": { "$type": "string" } }), vec![3]);
}

#[test]
fn array_semantics() {
    let coll = seeded(vec![
        doc! { "_id": 1, "a": [1, 2, 3] },
        doc! { "_id": 2, "a": [3, 4] },
        doc! { "_id": 3, "a": 3 },
        doc! { "_id": 4, "a": [] },
        doc! { "_id": 5, "a": [[1, 2]] },
    ]);
    // Literal matches whole value or any element.
    assert_eq!(ids(&coll, doc! { "a": 3 }), vec![1, 2, 3]);
    assert_eq!(ids(&coll, doc! { "a": [1, 2] }), vec![5]);
    assert_eq!(ids(&coll, doc! { "a": { "$size": 2 } }), vec![2]);
    assert_eq!(ids(&coll, doc! { "a": { "$all": [1, 3] } }), vec![1]);
    assert_eq!(
        ids(&coll, doc! { "a": { "$elemMatch": { "$gte": 4 } } }),
        vec![2]
    );
    assert_eq!(ids(&coll, doc! { "a.1": 2 }), vec![1]);
}

#[test]
fn dotted_paths_flatten_through_arrays() {
    let coll = seeded(vec![
        doc! { "_id": 1, "items": [ { "qty": 5 }, { "qty": 10 } ] },
        doc! { "_id": 2, "items": [ { "qty": 1 } ] },
        doc! { "_id": 3, "items": { "qty": 10 } },
    ]);
    assert_eq!(ids(&coll, doc! { "items.qty": 10 }), vec![1, 3]);
    assert_eq!(
        ids(&coll, doc! { "items.qty": { "$lt": 2 } }),
        vec![2]
    );
    assert_eq!(ids(&coll, doc! { "items.0.qty": 5 }), vec![1]);
}

#[test]
fn logical_operators() {
    let coll = seeded(vec![
        doc! { "_id": 1, "a": 1, "b": 1 },
        doc! { "_id": 2, "a": 1, "b": 2 },
        doc! { "_id": 3, "a": 2, "b": 2 },
    ]);
    assert_eq!(
        ids(&coll, doc! { "$or": [ { "a": 2 }, { "b": 1 } ] }),
        vec![1, 3]
    );
    assert_eq!(
        ids(&coll, doc! { "$and": [ { "a": 1 }, { "b": 2 } ] }),
        vec![2]
    );
    assert_eq!(
        ids(&coll, doc! { "$nor": [ { "a": 1 }, { "b": 1 } ] }),
        vec![3]
    );
    assert_eq!(
        ids(&coll, doc! { "$expr": { "$eq": ["$a", "$b"] } }),
        vec![1, 3]
    );
}

#[test]
fn in_nin_with_empty_arrays() {
    let coll = seeded(vec![doc! { "_id": 1, "v": 1 }, doc! { "_id": 2 }]);
    assert_eq!(ids(&coll, doc! { "v": { "$in": [] } }), Vec::<i32>::new());
    // Empty $nin matches everything, missing included.
    assert_eq!(ids(&coll, doc! { "v": { "$nin": [] } }), vec![1, 2]);
}

#[test]
fn regex_matching() {
    let coll = seeded(vec![
        doc! { "_id": 1, "name": "Alice" },
        doc! { "_id": 2, "name": "alina" },
        doc! { "_id": 3, "name": "Bob" },
        doc! { "_id": 4, "name": ["carol", "alex"] },
    ]);
    assert_eq!(
        ids(&coll, doc! { "name": { "$regex": "^al", "$options": "i" } }),
        vec![1, 2, 4]
    );
}

#[test]
fn mod_and_bitwise() {
    let coll = seeded(vec![
        doc! { "_id": 1, "v": 8 },
        doc! { "_id": 2, "v": 9 },
        doc! { "_id": 3, "v": "8" },
    ]);
    assert_eq!(ids(&coll, doc! { "v": { "$mod": [4, 0] } }), vec![1]);
    assert_eq!(ids(&coll, doc! { "v": { "$bitsAllSet": 8 } }), vec![1, 2]);
    assert_eq!(ids(&coll, doc! { "v": { "$bitsAnyClear": 1 } }), vec![1]);
}

#[test]
fn sort_uses_array_extremes_and_empty_array_first() {
    let coll = seeded(vec![
        doc! { "_id": 1, "v": [3, 9] },
        doc! { "_id": 2, "v": [5] },
        doc! { "_id": 3, "v": 4 },
        doc! { "_id": 4, "v": Bson::Null },
        doc! { "_id": 5, "v": [] },
    ]);
    let ascending: Vec<i32> = coll
        .find_with_options(
            doc! {},
            FindOptions::builder().sort(Some(doc! { "v": 1 })).build(),
        )
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    // Empty array sorts before null; arrays sort by least element ascending.
    assert_eq!(ascending, vec![5, 4, 1, 3, 2]);

    let descending: Vec<i32> = coll
        .find_with_options(
            doc! {},
            FindOptions::builder().sort(Some(doc! { "v": -1 })).build(),
        )
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    // Arrays sort by greatest element descending.
    assert_eq!(descending, vec![1, 2, 3, 4, 5]);
}

#[test]
fn index_assisted_and_scan_paths_agree() {
    let db = Database::new("t");
    let scan = db.collection("scan");
    let indexed = db.collection("indexed");
    indexed
        .create_index(IndexModel::builder().keys(doc! { "k": 1, "r": 1 }).build())
        .unwrap();
    let fixtures: Vec<bson::Document> = (0..50)
        .map(|i| doc! { "_id": i, "k": i % 5, "r": i, "tag": (["x", "y"][i as usize % 2]) })
        .collect();
    scan.insert_many(fixtures.clone(), Default::default()).unwrap();
    indexed.insert_many(fixtures, Default::default()).unwrap();

    let filters = vec![
        doc! { "k": 2 },
        doc! { "k": 2, "r": { "$gte": 10, "$lt": 40 } },
        doc! { "k": { "$in": [1, 3] } },
        doc! { "$or": [ { "k": 0 }, { "k": 4, "r": { "$gt": 20 } } ] },
        doc! { "k": { "$gt": 2 } },
        doc! { "k": { "$ne": 2 } },
        doc! { "tag": "x", "k": 1 },
    ];
    for filter in filters {
        assert_eq!(
            ids(&scan, filter.clone()),
            ids(&indexed, filter.clone()),
            "filter {:?} must produce identical ids on both paths",
            filter
        );
    }
}

#[test]
fn compile_errors_are_eager_and_side_effect_free() {
    let coll = seeded(vec![doc! { "_id": 1 }]);
    assert!(coll.find(doc! { "a": { "$badOp": 1 } }).is_err());
    assert!(coll.find(doc! { "$where": "x" }).is_err());
    assert!(coll
        .delete_many(doc! { "a": { "$mod": [0, 0] } })
        .is_err());
    assert_eq!(coll.estimated_document_count().unwrap(), 1);
}
