//! Helpers for working with `Bson` values: the engine's total order, cross-type numeric
//! equality, and the BSON type taxonomy used by `$type` and sort-key extraction.

use std::cmp::Ordering;

use bson::{oid::ObjectId, Bson, Document};

use crate::error::{Error, Result};

/// Relative position of each BSON type in the engine's total order. Types with the same
/// rank are compared by value; types with different ranks compare by rank alone.
pub(crate) fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Undefined => 1,
        Bson::Null => 2,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::JavaScriptCodeWithScope(_) => 14,
        Bson::DbPointer(_) => 15,
        Bson::MaxKey => 16,
    }
}

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this `Bson` is
/// not numeric or the conversion would be lossy (e.g. `1.5 -> 1`), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if f == f as i64 as f64 => Some(f as i64),
        _ => None,
    }
}

/// The `f64` view of any numeric `Bson`, including `Decimal128`.
pub(crate) fn as_f64(val: &Bson) -> Option<f64> {
    match val {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        Bson::Decimal128(d) => decimal_to_f64(d),
        _ => None,
    }
}

/// Parses a `Decimal128` through its string form. Returns `None` for the decimal NaN.
pub(crate) fn decimal_to_f64(d: &bson::Decimal128) -> Option<f64> {
    let repr = d.to_string();
    match repr.as_str() {
        "NaN" | "-NaN" => None,
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => repr.parse::<f64>().ok(),
    }
}

pub(crate) fn is_number(val: &Bson) -> bool {
    matches!(
        val,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)
    )
}

/// Whether this numeric value is a NaN of any width.
pub(crate) fn is_nan(val: &Bson) -> bool {
    match val {
        Bson::Double(f) => f.is_nan(),
        Bson::Decimal128(d) => decimal_to_f64(d).is_none(),
        _ => false,
    }
}

/// Compares two `Bson` values under the engine's total order:
/// minKey < undefined < null < numbers < string < object < array < binData < objectId <
/// bool < date < timestamp < regex < maxKey. Numeric variants compare as real numbers; NaN
/// compares below every other number so that sorts and index keys stay antisymmetric.
pub(crate) fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }
    match (a, b) {
        (Bson::MinKey, Bson::MaxKey)
        | (Bson::MaxKey, Bson::MinKey)
        | (Bson::MinKey, Bson::MinKey)
        | (Bson::MaxKey, Bson::MaxKey)
        | (Bson::Null, Bson::Null)
        | (Bson::Undefined, Bson::Undefined) => Ordering::Equal,
        _ if rank_a == 3 => cmp_numbers(a, b),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::String(x), Bson::Symbol(y)) | (Bson::Symbol(y), Bson::String(x)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => cmp_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                let ord = cmp_bson(ea, eb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            x.time.cmp(&y.time).then_with(|| x.increment.cmp(&y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .cmp(&y.pattern)
            .then_with(|| x.options.cmp(&y.options)),
        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn cmp_numbers(a: &Bson, b: &Bson) -> Ordering {
    if let (Bson::Int32(x), Bson::Int32(y)) = (a, b) {
        return x.cmp(y);
    }
    if let (Some(x), Some(y)) = (get_int(a), get_int(b)) {
        if !matches!((a, b), (Bson::Double(_), _) | (_, Bson::Double(_))) {
            return x.cmp(&y);
        }
    }
    match (as_f64(a), as_f64(b)) {
        // NaN sorts below every other number.
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => {
            if x.is_nan() && y.is_nan() {
                Ordering::Equal
            } else if x.is_nan() {
                Ordering::Less
            } else if y.is_nan() {
                Ordering::Greater
            } else {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        }
    }
}

fn cmp_documents(a: &Document, b: &Document) -> Ordering {
    let mut iter_a = a.iter();
    let mut iter_b = b.iter();
    loop {
        match (iter_a.next(), iter_b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = ka.cmp(kb).then_with(|| cmp_bson(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Engine equality: consistent with [`cmp_bson`] except that NaN never equals anything,
/// itself included.
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    if is_nan(a) || is_nan(b) {
        return false;
    }
    cmp_bson(a, b) == Ordering::Equal
}

/// Structural equality used by modification accounting: `cmp_bson == Equal`, so a document
/// rewritten to an identical value (NaN fields included) does not count as modified.
pub(crate) fn structural_eq(a: &Bson, b: &Bson) -> bool {
    cmp_bson(a, b) == Ordering::Equal
}

pub(crate) fn documents_equal(a: &Document, b: &Document) -> bool {
    cmp_documents(a, b) == Ordering::Equal
}

/// A `Bson` wrapper ordered by [`cmp_bson`], usable as a `BTreeMap` key (group keys,
/// `$addToSet` dedup, index components).
#[derive(Debug, Clone)]
pub(crate) struct OrderedBson(pub(crate) Bson);

impl PartialEq for OrderedBson {
    fn eq(&self, other: &Self) -> bool {
        cmp_bson(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for OrderedBson {}

impl PartialOrd for OrderedBson {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedBson {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_bson(&self.0, &other.0)
    }
}

/// An index key tuple ordered component-wise by [`cmp_bson`].
#[derive(Debug, Clone)]
pub(crate) struct OrderedKey(pub(crate) Vec<Bson>);

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = cmp_bson(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

/// The BSON type name, as accepted by `$type` and reported by the `$type` expression.
pub(crate) fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
    }
}

/// The numeric BSON type code, as accepted by `$type`.
pub(crate) fn type_code(value: &Bson) -> i32 {
    match value {
        Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::Undefined => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Null => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::Symbol(_) => 14,
        Bson::JavaScriptCodeWithScope(_) => 15,
        Bson::Int32(_) => 16,
        Bson::Timestamp(_) => 17,
        Bson::Int64(_) => 18,
        Bson::Decimal128(_) => 19,
        Bson::MinKey => -1,
        Bson::MaxKey => 127,
    }
}

/// Resolves a `$type` alias or numeric code to a matcher over type codes. The `number`
/// alias covers int, long, double and decimal.
pub(crate) fn resolve_type_spec(spec: &Bson) -> Result<Vec<i32>> {
    match spec {
        Bson::String(alias) => match alias.as_str() {
            "double" => Ok(vec![1]),
            "string" => Ok(vec![2]),
            "object" => Ok(vec![3]),
            "array" => Ok(vec![4]),
            "binData" => Ok(vec![5]),
            "undefined" => Ok(vec![6]),
            "objectId" => Ok(vec![7]),
            "bool" => Ok(vec![8]),
            "date" => Ok(vec![9]),
            "null" => Ok(vec![10]),
            "regex" => Ok(vec![11]),
            "dbPointer" => Ok(vec![12]),
            "javascript" => Ok(vec![13]),
            "symbol" => Ok(vec![14]),
            "javascriptWithScope" => Ok(vec![15]),
            "int" => Ok(vec![16]),
            "timestamp" => Ok(vec![17]),
            "long" => Ok(vec![18]),
            "decimal" => Ok(vec![19]),
            "minKey" => Ok(vec![-1]),
            "maxKey" => Ok(vec![127]),
            "number" => Ok(vec![1, 16, 18, 19]),
            other => Err(Error::bad_value(format!(
                "Unknown type name alias: {}",
                other
            ))),
        },
        _ => match get_int(spec) {
            Some(code) if code == -1 || code == 127 || (1..=19).contains(&code) => {
                Ok(vec![code as i32])
            }
            Some(code) => Err(Error::bad_value(format!(
                "Invalid numerical type code: {}",
                code
            ))),
            None => Err(Error::bad_value(
                "type must be represented as a number or a string",
            )),
        },
    }
}

/// Inserts a generated `ObjectId` under `_id` if the document has none, and returns the
/// document's `_id` either way.
pub(crate) fn ensure_id(doc: &mut Document) -> Bson {
    if let Some(id) = doc.get("_id") {
        return id.clone();
    }
    let id = Bson::ObjectId(ObjectId::new());
    doc.insert("_id", id.clone());
    id
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Moves `_id` to the front of the document, matching how the storage layer returns
/// documents.
pub(crate) fn id_first(doc: &mut Document) {
    if first_key(doc) == Some("_id") {
        return;
    }
    if let Some(id) = doc.remove("_id") {
        let rest = std::mem::take(doc);
        doc.insert("_id", id);
        doc.extend(rest);
    }
}

/// How an update argument document is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateDocKind {
    /// Every key is a `$` operator.
    Operators,
    /// No key is a `$` operator; the document replaces the matched one.
    Replacement,
}

/// Classifies an update argument, rejecting documents that mix `$` operators with plain
/// fields.
pub(crate) fn classify_update(update: &Document) -> Result<UpdateDocKind> {
    let mut kind = None;
    for key in update.keys() {
        let this = if key.starts_with('$') {
            UpdateDocKind::Operators
        } else {
            UpdateDocKind::Replacement
        };
        match kind {
            None => kind = Some(this),
            Some(prev) if prev != this => {
                return Err(Error::failed_to_parse(format!(
                    "Unknown modifier: {}. Expected a valid update modifier or pipeline-style \
                     update specified as an array",
                    key
                )))
            }
            _ => {}
        }
    }
    // An empty update document is a no-op replacement.
    Ok(kind.unwrap_or(UpdateDocKind::Replacement))
}

#[cfg(test)]
mod test {
    use bson::{bson, doc};

    use super::*;

    #[test]
    fn total_order_across_types() {
        let ordered = [
            Bson::MinKey,
            Bson::Null,
            bson!(f64::NAN),
            bson!(-3),
            bson!(2.5),
            bson!(3_i64),
            bson!("abc"),
            bson!({ "a": 1 }),
            bson!([1, 2]),
            Bson::ObjectId(ObjectId::new()),
            bson!(false),
            bson!(true),
            Bson::DateTime(bson::DateTime::from_millis(0)),
            Bson::MaxKey,
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                cmp_bson(&window[0], &window[1]),
                Ordering::Less,
                "{:?} < {:?}",
                window[0],
                window[1]
            );
            assert_eq!(cmp_bson(&window[1], &window[0]), Ordering::Greater);
        }
    }

    #[test]
    fn mixed_numeric_equality() {
        assert!(values_equal(&bson!(1), &bson!(1.0)));
        assert!(values_equal(&bson!(1_i64), &bson!(1)));
        assert!(!values_equal(&bson!(1), &bson!(1.5)));
        assert!(!values_equal(&bson!(f64::NAN), &bson!(f64::NAN)));
        assert!(structural_eq(&bson!(f64::NAN), &bson!(f64::NAN)));
    }

    #[test]
    fn array_and_document_order() {
        assert_eq!(cmp_bson(&bson!([1, 2]), &bson!([1, 2, 0])), Ordering::Less);
        assert_eq!(cmp_bson(&bson!([2]), &bson!([1, 9])), Ordering::Greater);
        assert_eq!(
            cmp_bson(&bson!({ "a": 1, "b": 2 }), &bson!({ "a": 1, "b": 3 })),
            Ordering::Less
        );
        assert_eq!(
            cmp_bson(&bson!({ "a": 1 }), &bson!({ "b": 0 })),
            Ordering::Less
        );
    }

    #[test]
    fn classify_update_rejects_mixed_documents() {
        assert_eq!(
            classify_update(&doc! { "$set": { "a": 1 } }).unwrap(),
            UpdateDocKind::Operators
        );
        assert_eq!(
            classify_update(&doc! { "a": 1 }).unwrap(),
            UpdateDocKind::Replacement
        );
        assert!(classify_update(&doc! { "$set": { "a": 1 }, "b": 2 }).is_err());
    }

    #[test]
    fn type_spec_resolution() {
        assert_eq!(resolve_type_spec(&bson!("number")).unwrap(), vec![1, 16, 18, 19]);
        assert_eq!(resolve_type_spec(&bson!(4)).unwrap(), vec![4]);
        assert!(resolve_type_spec(&bson!("nope")).is_err());
        assert!(resolve_type_spec(&bson!(42)).is_err());
    }

    #[test]
    fn ensure_id_generates_once() {
        let mut doc = doc! { "x": 1 };
        let id = ensure_id(&mut doc);
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(ensure_id(&mut doc), id);
    }
}
