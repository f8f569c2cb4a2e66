//! Geospatial evaluation: legacy coordinate pairs, GeoJSON geometries, planar and
//! great-circle distance, and the containment/intersection tests behind `$geoWithin`,
//! `$geoIntersects`, `$near` and `$geoNear`.
//!
//! Evaluation is linear over candidate documents; distances use the spherical law of
//! cosines on a sphere of Earth radius 6378.1 km.

use bson::{Bson, Document};

use crate::{
    bson_util,
    error::{Error, Result},
};

/// Earth radius used for 2dsphere distances, in metres.
pub const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

/// A planar or (longitude, latitude) coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Point {
    pub(crate) x: f64,
    pub(crate) y: f64,
}

/// A parsed GeoJSON geometry (or a legacy point promoted to one).
#[derive(Debug, Clone)]
pub(crate) enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    Polygon(Vec<Vec<Point>>),
    MultiPoint(Vec<Point>),
    MultiLineString(Vec<Vec<Point>>),
    MultiPolygon(Vec<Vec<Vec<Point>>>),
}

impl Geometry {
    /// Parses a GeoJSON geometry document (`{type, coordinates}`).
    pub(crate) fn parse(doc: &Document) -> Result<Geometry> {
        let kind = doc
            .get_str("type")
            .map_err(|_| Error::bad_value("GeoJSON geometry must have a string 'type'"))?;
        let coordinates = doc
            .get_array("coordinates")
            .map_err(|_| Error::bad_value("GeoJSON geometry must have 'coordinates'"))?;
        match kind {
            "Point" => Ok(Geometry::Point(parse_position(coordinates)?)),
            "LineString" => Ok(Geometry::LineString(parse_line(coordinates)?)),
            "Polygon" => Ok(Geometry::Polygon(parse_rings(coordinates)?)),
            "MultiPoint" => Ok(Geometry::MultiPoint(parse_line(coordinates)?)),
            "MultiLineString" => {
                let mut lines = Vec::with_capacity(coordinates.len());
                for entry in coordinates {
                    lines.push(parse_line(as_array(entry)?)?);
                }
                Ok(Geometry::MultiLineString(lines))
            }
            "MultiPolygon" => {
                let mut polygons = Vec::with_capacity(coordinates.len());
                for entry in coordinates {
                    polygons.push(parse_rings(as_array(entry)?)?);
                }
                Ok(Geometry::MultiPolygon(polygons))
            }
            other => Err(Error::bad_value(format!(
                "unknown GeoJSON type: {}",
                other
            ))),
        }
    }

    /// Every vertex of the geometry.
    pub(crate) fn points(&self) -> Vec<Point> {
        match self {
            Geometry::Point(p) => vec![*p],
            Geometry::LineString(line) | Geometry::MultiPoint(line) => line.clone(),
            Geometry::Polygon(rings) => rings.iter().flatten().copied().collect(),
            Geometry::MultiLineString(lines) => lines.iter().flatten().copied().collect(),
            Geometry::MultiPolygon(polygons) => polygons
                .iter()
                .flat_map(|rings| rings.iter().flatten())
                .copied()
                .collect(),
        }
    }

    /// The point used as the geometry's location for distance ranking: the centroid of its
    /// vertices. For a `Point` this is the point itself.
    pub(crate) fn representative_point(&self) -> Option<Point> {
        let points = self.points();
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        Some(Point {
            x: points.iter().map(|p| p.x).sum::<f64>() / n,
            y: points.iter().map(|p| p.y).sum::<f64>() / n,
        })
    }
}

fn as_array(value: &Bson) -> Result<&bson::Array> {
    value
        .as_array()
        .ok_or_else(|| Error::bad_value("GeoJSON coordinates must be arrays"))
}

fn parse_position(coordinates: &bson::Array) -> Result<Point> {
    if coordinates.len() < 2 {
        return Err(Error::bad_value(
            "GeoJSON position must have at least two elements",
        ));
    }
    match (
        bson_util::as_f64(&coordinates[0]),
        bson_util::as_f64(&coordinates[1]),
    ) {
        (Some(x), Some(y)) => Ok(Point { x, y }),
        _ => Err(Error::bad_value("GeoJSON position must be numeric")),
    }
}

fn parse_line(coordinates: &bson::Array) -> Result<Vec<Point>> {
    coordinates
        .iter()
        .map(|entry| parse_position(as_array(entry)?))
        .collect()
}

fn parse_rings(coordinates: &bson::Array) -> Result<Vec<Vec<Point>>> {
    let rings: Vec<Vec<Point>> = coordinates
        .iter()
        .map(|entry| parse_line(as_array(entry)?))
        .collect::<Result<_>>()?;
    if rings.is_empty() {
        return Err(Error::bad_value("Polygon must have at least one ring"));
    }
    Ok(rings)
}

/// Interprets a stored field value as a point: a legacy two-element array, a document of
/// two numeric fields (in insertion order), or a GeoJSON `Point`.
pub(crate) fn parse_point_like(value: &Bson) -> Option<Point> {
    match value {
        Bson::Array(arr) if arr.len() >= 2 => {
            match (bson_util::as_f64(&arr[0]), bson_util::as_f64(&arr[1])) {
                (Some(x), Some(y)) => Some(Point { x, y }),
                _ => None,
            }
        }
        Bson::Document(doc) => {
            if doc.get_str("type").is_ok() {
                match Geometry::parse(doc) {
                    Ok(Geometry::Point(p)) => Some(p),
                    _ => None,
                }
            } else {
                let mut numbers = doc.values().filter_map(bson_util::as_f64);
                match (numbers.next(), numbers.next()) {
                    (Some(x), Some(y)) => Some(Point { x, y }),
                    _ => None,
                }
            }
        }
        _ => None,
    }
}

/// Interprets a stored field value as the geometries it contains: a GeoJSON document, a
/// legacy point, or an array of either.
pub(crate) fn value_geometries(value: &Bson) -> Vec<Geometry> {
    match value {
        Bson::Document(doc) if doc.get_str("type").is_ok() => {
            Geometry::parse(doc).map(|g| vec![g]).unwrap_or_default()
        }
        Bson::Document(_) => parse_point_like(value)
            .map(|p| vec![Geometry::Point(p)])
            .unwrap_or_default(),
        Bson::Array(arr) => {
            // Either one legacy pair or an array of point-likes.
            if let Some(p) = parse_point_like(value) {
                if arr.iter().all(|e| bson_util::is_number(e)) {
                    return vec![Geometry::Point(p)];
                }
            }
            arr.iter().flat_map(value_geometries).collect()
        }
        _ => Vec::new(),
    }
}

/// The shapes `$geoWithin` accepts.
#[derive(Debug, Clone)]
pub(crate) enum WithinShape {
    /// `$box`: planar rectangle from two opposite corners.
    Box(Point, Point),
    /// `$polygon`: planar polygon from a list of vertices.
    Polygon(Vec<Point>),
    /// `$center`: planar circle, Euclidean radius.
    Center(Point, f64),
    /// `$centerSphere`: spherical cap, radius in radians.
    CenterSphere(Point, f64),
    /// `$geometry`: a GeoJSON polygon or multipolygon.
    Geometry(Geometry),
}

impl WithinShape {
    /// Parses the argument document of `$geoWithin`.
    pub(crate) fn parse(arg: &Bson) -> Result<WithinShape> {
        let doc = arg
            .as_document()
            .ok_or_else(|| Error::bad_value("$geoWithin argument must be a document"))?;
        let (key, value) = doc
            .iter()
            .next()
            .ok_or_else(|| Error::bad_value("$geoWithin argument must not be empty"))?;
        match key.as_str() {
            "$box" => {
                let corners = shape_points(value, 2)?;
                Ok(WithinShape::Box(corners[0], corners[1]))
            }
            "$polygon" => {
                let vertices = shape_points(value, 3)?;
                Ok(WithinShape::Polygon(vertices))
            }
            "$center" => {
                let (center, radius) = center_spec(value)?;
                Ok(WithinShape::Center(center, radius))
            }
            "$centerSphere" => {
                let (center, radius) = center_spec(value)?;
                Ok(WithinShape::CenterSphere(center, radius))
            }
            "$geometry" => {
                let geometry_doc = value
                    .as_document()
                    .ok_or_else(|| Error::bad_value("$geometry must be a document"))?;
                let geometry = Geometry::parse(geometry_doc)?;
                match geometry {
                    Geometry::Polygon(_) | Geometry::MultiPolygon(_) => {
                        Ok(WithinShape::Geometry(geometry))
                    }
                    _ => Err(Error::bad_value(
                        "$geoWithin $geometry must be a Polygon or MultiPolygon",
                    )),
                }
            }
            other => Err(Error::bad_value(format!(
                "unknown $geoWithin shape: {}",
                other
            ))),
        }
    }
}

fn shape_points(value: &Bson, minimum: usize) -> Result<Vec<Point>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::bad_value("shape must be an array of points"))?;
    let points: Vec<Point> = arr
        .iter()
        .map(|entry| {
            parse_point_like(entry)
                .ok_or_else(|| Error::bad_value("shape vertices must be points"))
        })
        .collect::<Result<_>>()?;
    if points.len() < minimum {
        return Err(Error::bad_value(format!(
            "shape requires at least {} points",
            minimum
        )));
    }
    Ok(points)
}

fn center_spec(value: &Bson) -> Result<(Point, f64)> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::bad_value("$center must be [[x, y], radius]"))?;
    if arr.len() != 2 {
        return Err(Error::bad_value("$center must be [[x, y], radius]"));
    }
    let center = parse_point_like(&arr[0])
        .ok_or_else(|| Error::bad_value("$center center must be a point"))?;
    let radius = bson_util::as_f64(&arr[1])
        .ok_or_else(|| Error::bad_value("$center radius must be numeric"))?;
    if radius < 0.0 {
        return Err(Error::bad_value("radius must be non-negative"));
    }
    Ok((center, radius))
}

/// Planar Euclidean distance.
pub(crate) fn planar_distance(a: &Point, b: &Point) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Great-circle distance in metres between two (longitude, latitude) pairs, by the
/// spherical law of cosines.
pub(crate) fn sphere_distance_meters(a: &Point, b: &Point) -> f64 {
    let (lon1, lat1) = (a.x.to_radians(), a.y.to_radians());
    let (lon2, lat2) = (b.x.to_radians(), b.y.to_radians());
    let central = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * (lon2 - lon1).cos();
    EARTH_RADIUS_METERS * central.clamp(-1.0, 1.0).acos()
}

/// Ray-casting point-in-polygon over a single ring. Points on an edge count as inside.
fn point_in_ring(point: &Point, ring: &[Point]) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (ring[i], ring[j]);
        if on_segment(point, &pi, &pj) {
            return true;
        }
        if (pi.y > point.y) != (pj.y > point.y) {
            let x_cross = (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(point: &Point, a: &Point, b: &Point) -> bool {
    let cross = (b.x - a.x) * (point.y - a.y) - (b.y - a.y) * (point.x - a.x);
    if cross.abs() > 1e-12 {
        return false;
    }
    point.x >= a.x.min(b.x) - 1e-12
        && point.x <= a.x.max(b.x) + 1e-12
        && point.y >= a.y.min(b.y) - 1e-12
        && point.y <= a.y.max(b.y) + 1e-12
}

fn point_in_polygon(point: &Point, rings: &[Vec<Point>]) -> bool {
    let Some(outer) = rings.first() else {
        return false;
    };
    if !point_in_ring(point, outer) {
        return false;
    }
    // Interior rings are holes.
    !rings[1..].iter().any(|hole| point_in_ring(point, hole))
}

fn point_in_shape(point: &Point, shape: &WithinShape) -> bool {
    match shape {
        WithinShape::Box(a, b) => {
            point.x >= a.x.min(b.x)
                && point.x <= a.x.max(b.x)
                && point.y >= a.y.min(b.y)
                && point.y <= a.y.max(b.y)
        }
        WithinShape::Polygon(vertices) => point_in_ring(point, vertices),
        WithinShape::Center(center, radius) => planar_distance(point, center) <= *radius,
        WithinShape::CenterSphere(center, radians) => {
            sphere_distance_meters(point, center) <= radians * EARTH_RADIUS_METERS
        }
        WithinShape::Geometry(Geometry::Polygon(rings)) => point_in_polygon(point, rings),
        WithinShape::Geometry(Geometry::MultiPolygon(polygons)) => polygons
            .iter()
            .any(|rings| point_in_polygon(point, rings)),
        WithinShape::Geometry(_) => false,
    }
}

/// Whether every point of `geometry` lies within `shape`.
pub(crate) fn within(geometry: &Geometry, shape: &WithinShape) -> bool {
    let points = geometry.points();
    !points.is_empty() && points.iter().all(|point| point_in_shape(point, shape))
}

fn segments(line: &[Point]) -> Vec<(Point, Point)> {
    line.windows(2).map(|w| (w[0], w[1])).collect()
}

fn geometry_segments(geometry: &Geometry) -> Vec<(Point, Point)> {
    match geometry {
        Geometry::Point(_) | Geometry::MultiPoint(_) => Vec::new(),
        Geometry::LineString(line) => segments(line),
        Geometry::MultiLineString(lines) => lines.iter().flat_map(|l| segments(l)).collect(),
        Geometry::Polygon(rings) => rings.iter().flat_map(|r| segments(r)).collect(),
        Geometry::MultiPolygon(polygons) => polygons
            .iter()
            .flat_map(|rings| rings.iter().flat_map(|r| segments(r)))
            .collect(),
    }
}

fn segments_intersect(a: &(Point, Point), b: &(Point, Point)) -> bool {
    fn orientation(p: &Point, q: &Point, r: &Point) -> f64 {
        (q.x - p.x) * (r.y - p.y) - (q.y - p.y) * (r.x - p.x)
    }
    let d1 = orientation(&a.0, &a.1, &b.0);
    let d2 = orientation(&a.0, &a.1, &b.1);
    let d3 = orientation(&b.0, &b.1, &a.0);
    let d4 = orientation(&b.0, &b.1, &a.1);
    if ((d1 > 0.0) != (d2 > 0.0)) && ((d3 > 0.0) != (d4 > 0.0)) {
        return true;
    }
    on_segment(&b.0, &a.0, &a.1)
        || on_segment(&b.1, &a.0, &a.1)
        || on_segment(&a.0, &b.0, &b.1)
        || on_segment(&a.1, &b.0, &b.1)
}

fn contains_any_point(container: &Geometry, other: &Geometry) -> bool {
    let rings_list: Vec<&Vec<Vec<Point>>> = match container {
        Geometry::Polygon(rings) => vec![rings],
        Geometry::MultiPolygon(polygons) => polygons.iter().collect(),
        _ => return false,
    };
    other.points().iter().any(|point| {
        rings_list
            .iter()
            .any(|rings| point_in_polygon(point, rings))
    })
}

/// Whether two geometries share at least one point: any segment pair crosses, either
/// polygon contains a vertex of the other, or a point lies on/within the other geometry.
pub(crate) fn intersects(a: &Geometry, b: &Geometry) -> bool {
    // Point containment either way.
    if contains_any_point(a, b) || contains_any_point(b, a) {
        return true;
    }
    let (segs_a, segs_b) = (geometry_segments(a), geometry_segments(b));
    for sa in &segs_a {
        for sb in &segs_b {
            if segments_intersect(sa, sb) {
                return true;
            }
        }
    }
    // Point-on-segment for point-like geometries.
    let point_on = |points: Vec<Point>, segs: &[(Point, Point)]| {
        points
            .iter()
            .any(|p| segs.iter().any(|(s, e)| on_segment(p, s, e)))
    };
    if segs_b.is_empty() && !segs_a.is_empty() && point_on(b.points(), &segs_a) {
        return true;
    }
    if segs_a.is_empty() && !segs_b.is_empty() && point_on(a.points(), &segs_b) {
        return true;
    }
    // Two points intersect when equal.
    if segs_a.is_empty() && segs_b.is_empty() {
        return a
            .points()
            .iter()
            .any(|pa| b.points().iter().any(|pb| pa == pb));
    }
    false
}

/// A parsed `$near` / `$nearSphere` query component.
#[derive(Debug, Clone)]
pub(crate) struct NearQuery {
    /// The indexed field the query targets.
    pub(crate) path: String,
    /// The query origin.
    pub(crate) point: Point,
    /// Whether distances are great-circle metres (2dsphere) or planar units (2d).
    pub(crate) spherical: bool,
    /// Inclusive lower distance bound.
    pub(crate) min_distance: Option<f64>,
    /// Inclusive upper distance bound.
    pub(crate) max_distance: Option<f64>,
}

impl NearQuery {
    /// Parses the operator document containing `$near`/`$nearSphere` and the sibling
    /// `$minDistance`/`$maxDistance` keys.
    pub(crate) fn parse(path: &str, operators: &Document) -> Result<NearQuery> {
        let (spherical_op, argument) = match (operators.get("$near"), operators.get("$nearSphere"))
        {
            (Some(arg), None) => (false, arg),
            (None, Some(arg)) => (true, arg),
            _ => return Err(Error::bad_value("duplicate $near predicate")),
        };
        let mut min_distance = operators.get("$minDistance").map(require_f64).transpose()?;
        let mut max_distance = operators.get("$maxDistance").map(require_f64).transpose()?;
        let (point, spherical) = match argument {
            Bson::Document(doc) if doc.contains_key("$geometry") => {
                let geometry_doc = doc
                    .get_document("$geometry")
                    .map_err(|_| Error::bad_value("$geometry must be a document"))?;
                let point = match Geometry::parse(geometry_doc)? {
                    Geometry::Point(p) => p,
                    _ => return Err(Error::bad_value("$near requires a Point geometry")),
                };
                if let Some(value) = doc.get("$minDistance") {
                    min_distance = Some(require_f64(value)?);
                }
                if let Some(value) = doc.get("$maxDistance") {
                    max_distance = Some(require_f64(value)?);
                }
                (point, true)
            }
            other => {
                let point = parse_point_like(other)
                    .ok_or_else(|| Error::bad_value("$near requires a point"))?;
                (point, spherical_op)
            }
        };
        Ok(NearQuery {
            path: path.to_string(),
            point,
            spherical,
            min_distance,
            max_distance,
        })
    }

    /// The distance from this query's origin to the nearest geometry stored in `value`,
    /// or `None` when the value holds no geometry.
    pub(crate) fn distance_to(&self, value: &Bson) -> Option<f64> {
        value_geometries(value)
            .iter()
            .filter_map(|geometry| geometry.representative_point())
            .map(|point| {
                if self.spherical {
                    sphere_distance_meters(&self.point, &point)
                } else {
                    planar_distance(&self.point, &point)
                }
            })
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Whether a distance passes the `$minDistance`/`$maxDistance` bounds.
    pub(crate) fn in_bounds(&self, distance: f64) -> bool {
        self.min_distance.map_or(true, |min| distance >= min)
            && self.max_distance.map_or(true, |max| distance <= max)
    }
}

fn require_f64(value: &Bson) -> Result<f64> {
    bson_util::as_f64(value).ok_or_else(|| Error::bad_value("distance must be numeric"))
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use bson::doc;

    use super::*;

    #[test]
    fn parses_geojson_polygon() {
        let geometry = Geometry::parse(&doc! {
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [0.0, 0.0]]],
        })
        .unwrap();
        assert!(matches!(geometry, Geometry::Polygon(ref rings) if rings[0].len() == 5));
    }

    #[test]
    fn point_in_polygon_with_hole() {
        let rings = vec![
            vec![
                Point { x: 0.0, y: 0.0 },
                Point { x: 10.0, y: 0.0 },
                Point { x: 10.0, y: 10.0 },
                Point { x: 0.0, y: 10.0 },
                Point { x: 0.0, y: 0.0 },
            ],
            vec![
                Point { x: 4.0, y: 4.0 },
                Point { x: 6.0, y: 4.0 },
                Point { x: 6.0, y: 6.0 },
                Point { x: 4.0, y: 6.0 },
                Point { x: 4.0, y: 4.0 },
            ],
        ];
        assert!(point_in_polygon(&Point { x: 2.0, y: 2.0 }, &rings));
        assert!(!point_in_polygon(&Point { x: 5.0, y: 5.0 }, &rings));
        assert!(!point_in_polygon(&Point { x: 11.0, y: 5.0 }, &rings));
    }

    #[test]
    fn sphere_distance_nyc_landmarks() {
        // Times Square to the Empire State Building is roughly 1.1 km.
        let times_square = Point { x: -73.9855, y: 40.7580 };
        let empire_state = Point { x: -73.9857, y: 40.7484 };
        let d = sphere_distance_meters(&times_square, &empire_state);
        assert_relative_eq!(d, 1068.0, max_relative = 0.05);
    }

    #[test]
    fn near_query_parses_geometry_form() {
        let operators = doc! {
            "$near": {
                "$geometry": { "type": "Point", "coordinates": [-73.985, 40.758] },
                "$maxDistance": 2000,
            }
        };
        let near = NearQuery::parse("location", &operators).unwrap();
        assert!(near.spherical);
        assert_eq!(near.max_distance, Some(2000.0));
        assert!(near.in_bounds(1999.0));
        assert!(!near.in_bounds(2001.0));
    }

    #[test]
    fn legacy_near_is_planar() {
        let near = NearQuery::parse("loc", &doc! { "$near": [0.0, 0.0], "$maxDistance": 5.0 })
            .unwrap();
        assert!(!near.spherical);
        assert_eq!(near.distance_to(&bson::bson!([3.0, 4.0])), Some(5.0));
    }

    #[test]
    fn within_box_and_center() {
        let point = Geometry::Point(Point { x: 1.0, y: 1.0 });
        let shape = WithinShape::parse(&bson::bson!({ "$box": [[0.0, 0.0], [2.0, 2.0]] })).unwrap();
        assert!(within(&point, &shape));
        let circle = WithinShape::parse(&bson::bson!({ "$center": [[0.0, 0.0], 1.0] })).unwrap();
        assert!(!within(&point, &circle));
    }

    #[test]
    fn line_intersects_polygon() {
        let polygon = Geometry::Polygon(vec![vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 4.0, y: 0.0 },
            Point { x: 4.0, y: 4.0 },
            Point { x: 0.0, y: 4.0 },
            Point { x: 0.0, y: 0.0 },
        ]]);
        let crossing = Geometry::LineString(vec![
            Point { x: -1.0, y: 2.0 },
            Point { x: 5.0, y: 2.0 },
        ]);
        let outside = Geometry::LineString(vec![
            Point { x: 5.0, y: 5.0 },
            Point { x: 6.0, y: 6.0 },
        ]);
        assert!(intersects(&polygon, &crossing));
        assert!(!intersects(&polygon, &outside));
    }
}
