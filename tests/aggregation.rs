use bson::{doc, Bson, Document};
use mangrove::{options::AggregateOptions, Collection, Database};
use pretty_assertions::assert_eq;

fn seeded(docs: Vec<Document>) -> (Database, Collection) {
    let db = Database::new("t");
    let coll = db.collection("c");
    coll.insert_many(docs, Default::default()).unwrap();
    (db, coll)
}

fn run(coll: &Collection, pipeline: Vec<Document>) -> Vec<Document> {
    coll.aggregate(pipeline)
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap()
}

#[test]
fn group_with_nested_accumulator_expression() {
    let (_db, coll) = seeded(vec![
        doc! { "price": 10, "qty": 2 },
        doc! { "price": 20, "qty": 3 },
        doc! { "price": 15, "qty": 4 },
    ]);
    let out = run(
        &coll,
        vec![doc! { "$group": {
            "_id": null,
            "totalRevenue": { "$sum": { "$multiply": ["$price", "$qty"] } },
        } }],
    );
    assert_eq!(out, vec![doc! { "_id": null, "totalRevenue": 140 }]);
}

#[test]
fn group_accumulators() {
    let (_db, coll) = seeded(vec![
        doc! { "k": "a", "v": 1 },
        doc! { "k": "a", "v": 3 },
        doc! { "k": "b", "v": 5 },
        doc! { "k": "b", "v": "skipped" },
    ]);
    let mut out = run(
        &coll,
        vec![
            doc! { "$group": {
                "_id": "$k",
                "total": { "$sum": "$v" },
                "average": { "$avg": "$v" },
                "low": { "$min": "$v" },
                "high": { "$max": "$v" },
                "all": { "$push": "$v" },
                "n": { "$count": {} },
            } },
            doc! { "$sort": { "_id": 1 } },
        ],
    );
    assert_eq!(out.len(), 2);
    let a = out.remove(0);
    assert_eq!(a.get("total"), Some(&Bson::Int32(4)));
    assert_eq!(a.get("average"), Some(&Bson::Double(2.0)));
    assert_eq!(a.get("n"), Some(&Bson::Int32(2)));
    let b = out.remove(0);
    // $sum ignores non-numeric input; $min/$max consider strings in the total order.
    assert_eq!(b.get("total"), Some(&Bson::Int32(5)));
    assert_eq!(b.get("low"), Some(&Bson::Int32(5)));
    assert_eq!(b.get("high"), Some(&Bson::String("skipped".into())));
    assert_eq!(b.get("all"), Some(&bson::bson!([5, "skipped"])));
}

#[test]
fn group_null_and_missing_share_a_bucket() {
    let (_db, coll) = seeded(vec![
        doc! { "k": Bson::Null, "v": 1 },
        doc! { "v": 2 },
        doc! { "k": "x", "v": 3 },
    ]);
    let out = run(
        &coll,
        vec![
            doc! { "$group": { "_id": "$k", "n": { "$sum": 1 } } },
            doc! { "$sort": { "_id": 1 } },
        ],
    );
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].get("_id"), Some(&Bson::Null));
    assert_eq!(out[0].get("n"), Some(&Bson::Int32(2)));
}

#[test]
fn facet_with_mixed_pipelines() {
    let (_db, coll) = seeded(vec![
        doc! { "type": "A", "value": 1 },
        doc! { "type": "A", "value": 2 },
        doc! { "type": "B", "value": 3 },
        doc! { "type": "B", "value": 4 },
    ]);
    let out = run(
        &coll,
        vec![doc! { "$facet": {
            "byType": [ { "$group": { "_id": "$type", "total": { "$sum": "$value" } } } ],
            "count": [ { "$count": "total" } ],
        } }],
    );
    assert_eq!(out.len(), 1);
    let facets = &out[0];
    assert_eq!(facets.get_array("byType").unwrap().len(), 2);
    let count = facets.get_array("count").unwrap();
    assert_eq!(count.len(), 1);
    assert_eq!(
        count[0].as_document().unwrap().get("total"),
        Some(&Bson::Int32(4))
    );
}

#[test]
fn facet_rejects_nested_facet_and_geo_near() {
    let (_db, coll) = seeded(vec![doc! { "x": 1 }]);
    assert!(coll
        .aggregate(vec![doc! { "$facet": { "inner": [ { "$facet": { "deep": [] } } ] } }])
        .is_err());
    assert!(coll
        .aggregate(vec![doc! { "$facet": { "inner": [ { "$geoNear": {} } ] } }])
        .is_err());
}

#[test]
fn project_inclusion_exclusion_and_computed() {
    let (_db, coll) = seeded(vec![doc! { "_id": 1, "a": 2, "b": 3, "c": { "d": 4 } }]);
    let out = run(
        &coll,
        vec![doc! { "$project": {
            "a": 1,
            "doubled": { "$multiply": ["$a", 2] },
            "c.d": 1,
        } }],
    );
    assert_eq!(
        out,
        vec![doc! { "_id": 1, "a": 2, "c": { "d": 4 }, "doubled": 4 }]
    );

    let excluded = run(&coll, vec![doc! { "$project": { "b": 0, "_id": 0 } }]);
    assert_eq!(excluded, vec![doc! { "a": 2, "c": { "d": 4 } }]);

    assert!(coll
        .aggregate(vec![doc! { "$project": { "a": 1, "b": 0 } }])
        .is_err());
}

#[test]
fn unwind_variants() {
    let (_db, coll) = seeded(vec![
        doc! { "_id": 1, "sizes": ["S", "M"] },
        doc! { "_id": 2, "sizes": [] },
        doc! { "_id": 3, "sizes": Bson::Null },
        doc! { "_id": 4 },
        doc! { "_id": 5, "sizes": "L" },
    ]);
    let plain = run(&coll, vec![doc! { "$unwind": "$sizes" }]);
    assert_eq!(plain.len(), 3);
    assert_eq!(plain[0].get("sizes"), Some(&Bson::String("S".into())));

    let preserved = run(
        &coll,
        vec![doc! { "$unwind": {
            "path": "$sizes",
            "preserveNullAndEmptyArrays": true,
            "includeArrayIndex": "idx",
        } }],
    );
    assert_eq!(preserved.len(), 6);
    let first = &preserved[0];
    assert_eq!(first.get("idx"), Some(&Bson::Int64(0)));
    // Preserved and non-array documents carry a null index.
    let kept: Vec<_> = preserved
        .iter()
        .filter(|doc| doc.get("idx") == Some(&Bson::Null))
        .collect();
    assert_eq!(kept.len(), 4);
}

#[test]
fn lookup_local_foreign_join() {
    let db = Database::new("t");
    let orders = db.collection("orders");
    let inventory = db.collection("inventory");
    orders
        .insert_many(
            vec![
                doc! { "_id": 1, "item": "almonds", "qty": 2 },
                doc! { "_id": 2, "item": "pecans", "qty": 1 },
                doc! { "_id": 3 },
            ],
            Default::default(),
        )
        .unwrap();
    inventory
        .insert_many(
            vec![
                doc! { "_id": 1, "sku": "almonds", "instock": 120 },
                doc! { "_id": 2, "sku": "pecans", "instock": 80 },
                doc! { "_id": 3, "sku": Bson::Null },
            ],
            Default::default(),
        )
        .unwrap();
    let out = orders
        .aggregate(vec![doc! { "$lookup": {
            "from": "inventory",
            "localField": "item",
            "foreignField": "sku",
            "as": "docs",
        } }])
        .unwrap()
        .collect::<mangrove::error::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(out[0].get_array("docs").unwrap().len(), 1);
    assert_eq!(out[1].get_array("docs").unwrap().len(), 1);
    // Missing localField joins against null foreignField.
    assert_eq!(out[2].get_array("docs").unwrap().len(), 1);
}

#[test]
fn lookup_pipeline_form_with_let() {
    let db = Database::new("t");
    let orders = db.collection("orders");
    let warehouses = db.collection("warehouses");
    orders
        .insert_many(
            vec![
                doc! { "_id": 1, "item": "a", "ordered": 5 },
                doc! { "_id": 2, "item": "b", "ordered": 50 },
            ],
            Default::default(),
        )
        .unwrap();
    warehouses
        .insert_many(
            vec![
                doc! { "item": "a", "stock": 10 },
                doc! { "item": "b", "stock": 20 },
            ],
            Default::default(),
        )
        .unwrap();
    let out = orders
        .aggregate(vec![doc! { "$lookup": {
            "from": "warehouses",
            "let": { "needed": "$ordered" },
            "pipeline": [
                { "$match": { "$expr": { "$gte": ["$stock", "$$needed"] } } },
            ],
            "as": "sources",
        } }])
        .unwrap()
        .collect::<mangrove::error::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(out[0].get_array("sources").unwrap().len(), 2);
    assert_eq!(out[1].get_array("sources").unwrap().len(), 0);
}

#[test]
fn union_with_and_replace_root() {
    let db = Database::new("t");
    let a = db.collection("a");
    let b = db.collection("b");
    a.insert_one(doc! { "_id": 1, "payload": { "v": 1 } }).unwrap();
    b.insert_one(doc! { "_id": 2, "payload": { "v": 2 } }).unwrap();
    let out = a
        .aggregate(vec![
            doc! { "$unionWith": "b" },
            doc! { "$replaceRoot": { "newRoot": "$payload" } },
            doc! { "$sort": { "v": 1 } },
        ])
        .unwrap()
        .collect::<mangrove::error::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(out, vec![doc! { "v": 1 }, doc! { "v": 2 }]);
}

#[test]
fn bucket_places_documents_and_errors_without_default() {
    let (_db, coll) = seeded(vec![
        doc! { "score": 5 },
        doc! { "score": 15 },
        doc! { "score": 25 },
        doc! { "score": 95 },
    ]);
    let out = run(
        &coll,
        vec![doc! { "$bucket": {
            "groupBy": "$score",
            "boundaries": [0, 10, 30],
            "default": "other",
        } }],
    );
    // Only non-empty buckets are emitted.
    assert_eq!(out.len(), 3);
    assert_eq!(out[0], doc! { "_id": 0, "count": 1 });
    assert_eq!(out[1], doc! { "_id": 10, "count": 2 });
    assert_eq!(out[2], doc! { "_id": "other", "count": 1 });

    assert!(coll
        .aggregate(vec![doc! { "$bucket": {
            "groupBy": "$score",
            "boundaries": [0, 10, 30],
        } }])
        .is_err());
}

#[test]
fn bucket_auto_splits_population() {
    let docs: Vec<Document> = (1..=10).map(|i| doc! { "n": i }).collect();
    let (_db, coll) = seeded(docs);
    let out = run(
        &coll,
        vec![doc! { "$bucketAuto": { "groupBy": "$n", "buckets": 2 } }],
    );
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].get("count"), Some(&Bson::Int32(5)));
    let id = out[0].get_document("_id").unwrap();
    assert_eq!(id.get("min"), Some(&Bson::Int32(1)));
    assert_eq!(id.get("max"), Some(&Bson::Int32(6)));
    let last = out[1].get_document("_id").unwrap();
    assert_eq!(last.get("max"), Some(&Bson::Int32(10)));
}

#[test]
fn sort_by_count() {
    let (_db, coll) = seeded(vec![
        doc! { "tag": "x" },
        doc! { "tag": "y" },
        doc! { "tag": "x" },
    ]);
    let out = run(&coll, vec![doc! { "$sortByCount": "$tag" }]);
    assert_eq!(out[0], doc! { "_id": "x", "count": 2 });
    assert_eq!(out[1], doc! { "_id": "y", "count": 1 });
}

#[test]
fn sample_sizes() {
    let docs: Vec<Document> = (0..20).map(|i| doc! { "i": i }).collect();
    let (_db, coll) = seeded(docs);
    let empty = run(&coll, vec![doc! { "$sample": { "size": 0 } }]);
    assert!(empty.is_empty());
    let five = run(&coll, vec![doc! { "$sample": { "size": 5 } }]);
    assert_eq!(five.len(), 5);
    let all = run(&coll, vec![doc! { "$sample": { "size": 100 } }]);
    assert_eq!(all.len(), 20);
}

#[test]
fn rand_is_deterministic_under_a_seed() {
    let docs: Vec<Document> = (0..5).map(|i| doc! { "_id": i }).collect();
    let (_db, coll) = seeded(docs);
    let pipeline = vec![doc! { "$addFields": { "r": { "$rand": {} } } }];
    let run_seeded = |seed: u64| -> Vec<Document> {
        coll.aggregate_with_options(
            pipeline.clone(),
            AggregateOptions::builder().seed(Some(seed)).build(),
        )
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap()
    };
    let first = run_seeded(42);
    let second = run_seeded(42);
    let different = run_seeded(43);
    assert_eq!(first, second);
    assert_ne!(first, different);
    // Every draw lies in [0, 1) and draws differ across documents.
    let values: Vec<f64> = first
        .iter()
        .map(|doc| doc.get_f64("r").unwrap())
        .collect();
    assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    assert!(values.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn add_fields_set_and_unset() {
    let (_db, coll) = seeded(vec![doc! { "_id": 1, "a": 1 }]);
    let out = run(
        &coll,
        vec![
            doc! { "$addFields": { "b": { "$add": ["$a", 1] }, "nested.deep": 7 } },
            doc! { "$set": { "a": 100 } },
            doc! { "$unset": "nested" },
        ],
    );
    assert_eq!(out, vec![doc! { "_id": 1, "a": 100, "b": 2 }]);
}

#[test]
fn geo_near_must_be_first() {
    let (_db, coll) = seeded(vec![doc! { "x": 1 }]);
    let err = coll
        .aggregate(vec![
            doc! { "$match": {} },
            doc! { "$geoNear": { "near": [0.0, 0.0], "distanceField": "d" } },
        ])
        .unwrap_err();
    assert!(err.message().unwrap().contains("first stage"));
}

#[test]
fn skip_limit_count_stages() {
    let docs: Vec<Document> = (0..10).map(|i| doc! { "i": i }).collect();
    let (_db, coll) = seeded(docs);
    let out = run(
        &coll,
        vec![
            doc! { "$sort": { "i": 1 } },
            doc! { "$skip": 2 },
            doc! { "$limit": 3 },
            doc! { "$count": "kept" },
        ],
    );
    assert_eq!(out, vec![doc! { "kept": 3 }]);
}
