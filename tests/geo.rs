use approx::assert_relative_eq;
use bson::{doc, Document};
use mangrove::{Collection, Database, IndexModel};

fn nyc_landmarks(db: &Database) -> Collection {
    let coll = db.collection("places");
    coll.create_index(
        IndexModel::builder()
            .keys(doc! { "location": "2dsphere" })
            .build(),
    )
    .unwrap();
    coll.insert_many(
        vec![
            doc! {
                "name": "Times Square",
                "location": { "type": "Point", "coordinates": [-73.9855, 40.7580] },
            },
            doc! {
                "name": "Empire State Building",
                "location": { "type": "Point", "coordinates": [-73.9857, 40.7484] },
            },
            doc! {
                "name": "Central Park Zoo",
                "location": { "type": "Point", "coordinates": [-73.9665, 40.7812] },
            },
            doc! {
                "name": "Statue of Liberty",
                "location": { "type": "Point", "coordinates": [-74.0445, 40.6892] },
            },
        ],
        Default::default(),
    )
    .unwrap();
    coll
}

fn names(docs: &[Document]) -> Vec<&str> {
    docs.iter().map(|doc| doc.get_str("name").unwrap()).collect()
}

#[test]
fn near_returns_distance_ordered_results_within_bounds() {
    let db = Database::new("t");
    let coll = nyc_landmarks(&db);
    let found: Vec<Document> = coll
        .find(doc! { "location": { "$near": {
            "$geometry": { "type": "Point", "coordinates": [-73.985, 40.758] },
            "$maxDistance": 2000,
        } } })
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert_eq!(names(&found), vec!["Times Square", "Empire State Building"]);
}

#[test]
fn near_without_geo_index_raises_291() {
    let db = Database::new("t");
    let coll = db.collection("bare");
    coll.insert_one(doc! { "location": [0.0, 0.0] }).unwrap();
    let err = coll
        .find(doc! { "location": { "$near": [0.0, 0.0] } })
        .unwrap_err();
    assert_eq!(err.code(), Some(291));
    assert_eq!(err.code_name(), Some("NoQueryExecutionPlans"));
}

#[test]
fn near_min_distance_excludes_close_points() {
    let db = Database::new("t");
    let coll = nyc_landmarks(&db);
    let found: Vec<Document> = coll
        .find(doc! { "location": { "$near": {
            "$geometry": { "type": "Point", "coordinates": [-73.985, 40.758] },
            "$minDistance": 500,
            "$maxDistance": 5000,
        } } })
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert_eq!(
        names(&found),
        vec!["Empire State Building", "Central Park Zoo"]
    );
}

#[test]
fn planar_2d_near_and_within() {
    let db = Database::new("t");
    let coll = db.collection("grid");
    coll.create_index(IndexModel::builder().keys(doc! { "pos": "2d" }).build())
        .unwrap();
    coll.insert_many(
        vec![
            doc! { "_id": 1, "pos": [0.0, 0.0] },
            doc! { "_id": 2, "pos": [3.0, 4.0] },
            doc! { "_id": 3, "pos": [10.0, 0.0] },
        ],
        Default::default(),
    )
    .unwrap();

    let near: Vec<i32> = coll
        .find(doc! { "pos": { "$near": [0.0, 0.0], "$maxDistance": 6.0 } })
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(near, vec![1, 2]);

    let boxed: Vec<i32> = coll
        .find(doc! { "pos": { "$geoWithin": { "$box": [[-1.0, -1.0], [5.0, 5.0]] } } })
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(boxed, vec![1, 2]);

    let circled: Vec<i32> = coll
        .find(doc! { "pos": { "$geoWithin": { "$center": [[0.0, 0.0], 5.0] } } })
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(circled, vec![1, 2]);

    let polygon: Vec<i32> = coll
        .find(doc! { "pos": { "$geoWithin": {
            "$polygon": [[-1.0, -1.0], [11.0, -1.0], [11.0, 1.0], [-1.0, 1.0]],
        } } })
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(polygon, vec![1, 3]);
}

#[test]
fn geo_within_geometry_and_center_sphere() {
    let db = Database::new("t");
    let coll = nyc_landmarks(&db);

    // A polygon roughly covering midtown Manhattan.
    let midtown: Vec<Document> = coll
        .find(doc! { "location": { "$geoWithin": { "$geometry": {
            "type": "Polygon",
            "coordinates": [[
                [-74.0, 40.74], [-73.95, 40.74], [-73.95, 40.79], [-74.0, 40.79],
                [-74.0, 40.74],
            ]],
        } } } })
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert_eq!(
        names(&midtown),
        vec!["Times Square", "Empire State Building", "Central Park Zoo"]
    );

    // 3.5 km cap around Times Square, radius in radians.
    let radius_radians = 3500.0 / 6_378_100.0;
    let close = coll
        .find(doc! { "location": { "$geoWithin": {
            "$centerSphere": [[-73.9855, 40.7580], radius_radians],
        } } })
        .unwrap()
        .collect::<mangrove::error::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(
        names(&close),
        vec!["Times Square", "Empire State Building", "Central Park Zoo"]
    );
}

#[test]
fn geo_intersects_line_and_polygon() {
    let db = Database::new("t");
    let coll = db.collection("shapes");
    coll.create_index(
        IndexModel::builder().keys(doc! { "geo": "2dsphere" }).build(),
    )
    .unwrap();
    coll.insert_many(
        vec![
            doc! { "_id": 1, "geo": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [0.0, 0.0]]],
            } },
            doc! { "_id": 2, "geo": {
                "type": "LineString",
                "coordinates": [[10.0, 10.0], [12.0, 12.0]],
            } },
        ],
        Default::default(),
    )
    .unwrap();

    let crossing: Vec<i32> = coll
        .find(doc! { "geo": { "$geoIntersects": { "$geometry": {
            "type": "LineString",
            "coordinates": [[-1.0, 2.0], [5.0, 2.0]],
        } } } })
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(crossing, vec![1]);

    let point_inside: Vec<i32> = coll
        .find(doc! { "geo": { "$geoIntersects": { "$geometry": {
            "type": "Point",
            "coordinates": [2.0, 2.0],
        } } } })
        .unwrap()
        .map(|doc| doc.unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(point_inside, vec![1]);
}

#[test]
fn geo_near_stage_emits_sorted_distances() {
    let db = Database::new("t");
    let coll = nyc_landmarks(&db);
    let out: Vec<Document> = coll
        .aggregate(vec![doc! { "$geoNear": {
            "near": { "type": "Point", "coordinates": [-73.985, 40.758] },
            "distanceField": "dist",
            "maxDistance": 5000,
            "query": { "name": { "$ne": "Central Park Zoo" } },
            "includeLocs": "where",
        } }])
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    assert_eq!(names(&out), vec!["Times Square", "Empire State Building"]);
    let first_distance = out[0].get_f64("dist").unwrap();
    assert!(first_distance < 100.0);
    let second_distance = out[1].get_f64("dist").unwrap();
    assert_relative_eq!(second_distance, 1068.0, max_relative = 0.05);
    assert!(out[0].get_document("where").is_ok());
}

#[test]
fn geo_near_distance_multiplier_scales() {
    let db = Database::new("t");
    let coll = nyc_landmarks(&db);
    let out: Vec<Document> = coll
        .aggregate(vec![doc! { "$geoNear": {
            "near": { "type": "Point", "coordinates": [-73.9855, 40.7580] },
            "distanceField": "km",
            "distanceMultiplier": 0.001,
            "maxDistance": 2000,
        } }])
        .unwrap()
        .collect::<mangrove::error::Result<_>>()
        .unwrap();
    let furthest = out.last().unwrap().get_f64("km").unwrap();
    assert_relative_eq!(furthest, 1.068, max_relative = 0.05);
}

#[test]
fn geo_near_without_index_raises_291() {
    let db = Database::new("t");
    let coll = db.collection("bare");
    coll.insert_one(doc! { "p": [0.0, 0.0] }).unwrap();
    let err = coll
        .aggregate(vec![doc! { "$geoNear": {
            "near": [0.0, 0.0],
            "distanceField": "d",
        } }])
        .unwrap_err();
    assert_eq!(err.code(), Some(291));
}
