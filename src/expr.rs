//! The aggregation expression evaluator.
//!
//! Expressions are evaluated directly from their BSON form against a context holding the
//! current document, the variable scope, and the PRNG behind `$rand`. A missing value is
//! represented as `Bson::Undefined` inside the evaluator: document construction drops
//! undefined fields, and operators that receive one typically produce null.

use std::cell::RefCell;

use bson::{oid::ObjectId, Bson, DateTime, Document};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use rand::{rngs::SmallRng, Rng};

use crate::{
    bson_util,
    error::{code, Error, Result},
    path,
};

/// Evaluation context: the root document, the variable scope stack, and the `$rand`
/// source.
pub(crate) struct ExprContext<'a> {
    root: &'a Document,
    vars: Vec<(String, Bson)>,
    rng: Option<&'a RefCell<SmallRng>>,
}

impl<'a> ExprContext<'a> {
    pub(crate) fn new(root: &'a Document) -> Self {
        ExprContext {
            root,
            vars: Vec::new(),
            rng: None,
        }
    }

    /// A context drawing `$rand` values from a caller-owned generator, which makes a whole
    /// pipeline deterministic under an external seed.
    pub(crate) fn with_rng(root: &'a Document, rng: &'a RefCell<SmallRng>) -> Self {
        ExprContext {
            root,
            vars: Vec::new(),
            rng: Some(rng),
        }
    }

    fn bind(&self, name: &str, value: Bson) -> ExprContext<'a> {
        let mut vars = self.vars.clone();
        vars.push((name.to_string(), value));
        ExprContext {
            root: self.root,
            vars,
            rng: self.rng,
        }
    }

    fn variable(&self, name: &str) -> Result<Bson> {
        match name {
            "ROOT" | "CURRENT" => Ok(Bson::Document(self.root.clone())),
            "NOW" => Ok(Bson::DateTime(DateTime::now())),
            other => self
                .vars
                .iter()
                .rev()
                .find(|(bound, _)| bound == other)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| {
                    Error::command(
                        code::INVALID_PIPELINE_OPERATOR,
                        format!("Use of undefined variable: {}", other),
                    )
                }),
        }
    }

    fn rand(&self) -> f64 {
        match self.rng {
            Some(cell) => cell.borrow_mut().random::<f64>(),
            None => rand::rng().random::<f64>(),
        }
    }
}

/// Evaluates an expression for `$expr` inside a query filter.
pub(crate) fn evaluate_for_match(expr: &Bson, doc: &Document) -> Result<Bson> {
    evaluate(expr, &ExprContext::new(doc))
}

/// Aggregation truthiness: null, missing, false, numeric zero, NaN and the empty string
/// are false; everything else is true.
pub(crate) fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        Bson::String(s) => !s.is_empty(),
        other => match bson_util::as_f64(other) {
            Some(f) => f != 0.0 && !f.is_nan(),
            None => true,
        },
    }
}

/// Evaluates an aggregation expression.
pub(crate) fn evaluate(expr: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => {
            let reference = &s[2..];
            match reference.split_once('.') {
                None => ctx.variable(reference),
                Some((name, rest)) => {
                    let bound = ctx.variable(name)?;
                    Ok(match bound {
                        Bson::Document(doc) => {
                            path::expr_get(&doc, rest).unwrap_or(Bson::Undefined)
                        }
                        _ => Bson::Undefined,
                    })
                }
            }
        }
        Bson::String(s) if s.starts_with('$') => {
            Ok(path::expr_get(ctx.root, &s[1..]).unwrap_or(Bson::Undefined))
        }
        Bson::Document(doc) => {
            if let Some(first) = bson_util::first_key(doc) {
                if first.starts_with('$') {
                    if doc.len() != 1 {
                        return Err(Error::command(
                            code::INVALID_PIPELINE_OPERATOR,
                            format!(
                                "an expression specification must contain exactly one \
                                 field, found {} including {}",
                                doc.len(),
                                first
                            ),
                        ));
                    }
                    let (op, arg) = doc.iter().next().unwrap();
                    return apply_operator(op, arg, ctx);
                }
            }
            let mut out = Document::new();
            for (key, value) in doc {
                let evaluated = evaluate(value, ctx)?;
                if !matches!(evaluated, Bson::Undefined) {
                    out.insert(key.clone(), evaluated);
                }
            }
            Ok(Bson::Document(out))
        }
        Bson::Array(items) => {
            let evaluated: Vec<Bson> = items
                .iter()
                .map(|item| {
                    evaluate(item, ctx).map(|v| {
                        if matches!(v, Bson::Undefined) {
                            Bson::Null
                        } else {
                            v
                        }
                    })
                })
                .collect::<Result<_>>()?;
            Ok(Bson::Array(evaluated))
        }
        literal => Ok(literal.clone()),
    }
}

fn apply_operator(op: &str, arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    match op {
        "$literal" => return Ok(arg.clone()),
        "$let" => return eval_let(arg, ctx),
        "$filter" => return eval_filter(arg, ctx),
        "$map" => return eval_map(arg, ctx),
        "$reduce" => return eval_reduce(arg, ctx),
        "$cond" => return eval_cond(arg, ctx),
        "$switch" => return eval_switch(arg, ctx),
        "$ifNull" => return eval_if_null(arg, ctx),
        "$and" | "$or" => return eval_short_circuit(op, arg, ctx),
        _ if is_document_operator(op) => return eval_document_operator(op, arg, ctx),
        _ => {}
    }

    let args = eval_args(arg, ctx)?;
    match op {
        // -- boolean -------------------------------------------------------
        "$not" => {
            let [value] = take_args::<1>(op, args)?;
            Ok(Bson::Boolean(!is_truthy(&value)))
        }

        // -- comparison ----------------------------------------------------
        "$cmp" | "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let [a, b] = take_args::<2>(op, args)?;
            let ord = bson_util::cmp_bson(&normalize(&a), &normalize(&b));
            Ok(match op {
                "$cmp" => Bson::Int32(match ord {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }),
                "$eq" => Bson::Boolean(ord.is_eq()),
                "$ne" => Bson::Boolean(ord.is_ne()),
                "$gt" => Bson::Boolean(ord.is_gt()),
                "$gte" => Bson::Boolean(ord.is_ge()),
                "$lt" => Bson::Boolean(ord.is_lt()),
                _ => Bson::Boolean(ord.is_le()),
            })
        }

        // -- arithmetic ----------------------------------------------------
        "$add" => eval_add(args),
        "$subtract" => eval_subtract(op, args),
        "$multiply" => {
            if args.iter().any(is_nullish) {
                return Ok(Bson::Null);
            }
            let mut int_product: Option<i64> = Some(1);
            let mut product = 1.0;
            for value in &args {
                let f = require_number(op, value)?;
                product *= f;
                int_product = match (int_product, bson_util::get_int(value)) {
                    (Some(acc), Some(i)) if !matches!(value, Bson::Double(_)) => {
                        acc.checked_mul(i)
                    }
                    _ => None,
                };
            }
            Ok(match int_product {
                Some(i) => narrow_int(i),
                None => Bson::Double(product),
            })
        }
        "$divide" => {
            let [a, b] = take_args::<2>(op, args)?;
            if is_nullish(&a) || is_nullish(&b) {
                return Ok(Bson::Null);
            }
            // IEEE-754 semantics: dividing by zero yields an infinity or NaN.
            Ok(Bson::Double(require_number(op, &a)? / require_number(op, &b)?))
        }
        "$mod" => {
            let [a, b] = take_args::<2>(op, args)?;
            if is_nullish(&a) || is_nullish(&b) {
                return Ok(Bson::Null);
            }
            let divisor = require_number(op, &b)?;
            if divisor == 0.0 {
                return Err(Error::bad_value("can't $mod by zero"));
            }
            match (bson_util::get_int(&a), bson_util::get_int(&b)) {
                (Some(x), Some(y))
                    if !matches!(a, Bson::Double(_)) && !matches!(b, Bson::Double(_)) =>
                {
                    Ok(narrow_int(x % y))
                }
                _ => Ok(Bson::Double(require_number(op, &a)? % divisor)),
            }
        }
        "$abs" => {
            let [value] = take_args::<1>(op, args)?;
            if is_nullish(&value) {
                return Ok(Bson::Null);
            }
            Ok(match value {
                Bson::Int32(i) => Bson::Int32(i.abs()),
                Bson::Int64(i) => Bson::Int64(i.abs()),
                other => Bson::Double(require_number(op, &other)?.abs()),
            })
        }
        "$ceil" | "$floor" | "$trunc" | "$round" => eval_rounding(op, args),
        "$sqrt" => unary_double(op, args, f64::sqrt),
        "$exp" => unary_double(op, args, f64::exp),
        "$ln" => unary_double(op, args, f64::ln),
        "$log10" => unary_double(op, args, f64::log10),
        "$log" => {
            let [value, base] = take_args::<2>(op, args)?;
            if is_nullish(&value) || is_nullish(&base) {
                return Ok(Bson::Null);
            }
            Ok(Bson::Double(
                require_number(op, &value)?.log(require_number(op, &base)?),
            ))
        }
        "$pow" => {
            let [base, exponent] = take_args::<2>(op, args)?;
            if is_nullish(&base) || is_nullish(&exponent) {
                return Ok(Bson::Null);
            }
            match (bson_util::get_int(&base), bson_util::get_int(&exponent)) {
                (Some(b), Some(e))
                    if e >= 0
                        && !matches!(base, Bson::Double(_))
                        && !matches!(exponent, Bson::Double(_)) =>
                {
                    match u32::try_from(e).ok().and_then(|e| b.checked_pow(e)) {
                        Some(result) => Ok(narrow_int(result)),
                        None => Ok(Bson::Double(
                            require_number(op, &base)?.powf(require_number(op, &exponent)?),
                        )),
                    }
                }
                _ => Ok(Bson::Double(
                    require_number(op, &base)?.powf(require_number(op, &exponent)?),
                )),
            }
        }

        // -- strings -------------------------------------------------------
        "$concat" => {
            let mut out = String::new();
            for value in &args {
                match value {
                    Bson::Null | Bson::Undefined => return Ok(Bson::Null),
                    Bson::String(s) => out.push_str(s),
                    other => {
                        return Err(Error::type_mismatch(format!(
                            "$concat only supports strings, not {}",
                            bson_util::type_name(other)
                        )))
                    }
                }
            }
            Ok(Bson::String(out))
        }
        "$toLower" | "$toUpper" => {
            let [value] = take_args::<1>(op, args)?;
            let s = coerce_to_string(&value)?;
            Ok(Bson::String(if op == "$toLower" {
                s.to_lowercase()
            } else {
                s.to_uppercase()
            }))
        }
        "$strLenCP" => {
            let [value] = take_args::<1>(op, args)?;
            let s = require_string(op, &value)?;
            Ok(Bson::Int32(s.chars().count() as i32))
        }
        "$strLenBytes" => {
            let [value] = take_args::<1>(op, args)?;
            let s = require_string(op, &value)?;
            Ok(Bson::Int32(s.len() as i32))
        }
        "$substrCP" | "$substr" | "$substrBytes" => eval_substr(op, args),
        "$split" => {
            let [input, delimiter] = take_args::<2>(op, args)?;
            if is_nullish(&input) {
                return Ok(Bson::Null);
            }
            let input = require_string(op, &input)?;
            let delimiter = require_string(op, &delimiter)?;
            if delimiter.is_empty() {
                return Err(Error::bad_value("$split requires a non-empty separator"));
            }
            Ok(Bson::Array(
                input
                    .split(delimiter.as_str())
                    .map(|piece| Bson::String(piece.to_string()))
                    .collect(),
            ))
        }
        // -- arrays --------------------------------------------------------
        "$size" => {
            let [value] = take_args::<1>(op, args)?;
            match value {
                Bson::Array(items) => Ok(Bson::Int32(items.len() as i32)),
                other => Err(Error::type_mismatch(format!(
                    "The argument to $size must be an array, but was of type: {}",
                    bson_util::type_name(&other)
                ))),
            }
        }
        "$arrayElemAt" => {
            let [array, index] = take_args::<2>(op, args)?;
            if is_nullish(&array) {
                return Ok(Bson::Null);
            }
            let items = require_array(op, &array)?;
            let index = require_int(op, &index)?;
            let resolved = if index < 0 {
                items.len().checked_sub(index.unsigned_abs() as usize)
            } else {
                Some(index as usize)
            };
            Ok(resolved
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Bson::Undefined))
        }
        "$first" => {
            let [array] = take_args::<1>(op, args)?;
            if is_nullish(&array) {
                return Ok(Bson::Null);
            }
            Ok(require_array(op, &array)?.first().cloned().unwrap_or(Bson::Undefined))
        }
        "$last" => {
            let [array] = take_args::<1>(op, args)?;
            if is_nullish(&array) {
                return Ok(Bson::Null);
            }
            Ok(require_array(op, &array)?.last().cloned().unwrap_or(Bson::Undefined))
        }
        "$slice" => eval_slice(op, args),
        "$concatArrays" => {
            let mut out = Vec::new();
            for value in &args {
                match value {
                    Bson::Null | Bson::Undefined => return Ok(Bson::Null),
                    Bson::Array(items) => out.extend(items.iter().cloned()),
                    other => {
                        return Err(Error::type_mismatch(format!(
                            "$concatArrays only supports arrays, not {}",
                            bson_util::type_name(other)
                        )))
                    }
                }
            }
            Ok(Bson::Array(out))
        }
        "$in" => {
            let [needle, haystack] = take_args::<2>(op, args)?;
            let items = require_array(op, &haystack)?;
            Ok(Bson::Boolean(
                items
                    .iter()
                    .any(|item| bson_util::values_equal(item, &needle)),
            ))
        }
        "$indexOfArray" => {
            let mut args = args;
            if args.len() < 2 || args.len() > 4 {
                return Err(wrong_arity(op, "2 to 4", args.len()));
            }
            let rest = args.split_off(2);
            let haystack = args.remove(0);
            let needle = args.remove(0);
            if is_nullish(&haystack) {
                return Ok(Bson::Null);
            }
            let items = require_array(op, &haystack)?;
            let start = rest
                .first()
                .map(|v| require_int(op, v))
                .transpose()?
                .unwrap_or(0)
                .max(0) as usize;
            let end = rest
                .get(1)
                .map(|v| require_int(op, v))
                .transpose()?
                .map(|e| (e.max(0) as usize).min(items.len()))
                .unwrap_or(items.len());
            for (index, item) in items.iter().enumerate().take(end).skip(start) {
                if bson_util::values_equal(item, &needle) {
                    return Ok(Bson::Int32(index as i32));
                }
            }
            Ok(Bson::Int32(-1))
        }
        "$range" => {
            let mut args = args;
            if args.len() < 2 || args.len() > 3 {
                return Err(wrong_arity(op, "2 or 3", args.len()));
            }
            let step = if args.len() == 3 {
                require_int(op, &args.pop().unwrap())?
            } else {
                1
            };
            if step == 0 {
                return Err(Error::bad_value("$range requires a non-zero step value"));
            }
            let end = require_int(op, &args.pop().unwrap())?;
            let start = require_int(op, &args.pop().unwrap())?;
            let mut out = Vec::new();
            let mut current = start;
            while (step > 0 && current < end) || (step < 0 && current > end) {
                out.push(Bson::Int32(current as i32));
                current += step;
            }
            Ok(Bson::Array(out))
        }
        "$reverseArray" => {
            let [array] = take_args::<1>(op, args)?;
            if is_nullish(&array) {
                return Ok(Bson::Null);
            }
            let mut items = require_array(op, &array)?.clone();
            items.reverse();
            Ok(Bson::Array(items))
        }
        "$isArray" => {
            let [value] = take_args::<1>(op, args)?;
            Ok(Bson::Boolean(matches!(value, Bson::Array(_))))
        }
        // -- objects -------------------------------------------------------
        "$mergeObjects" => {
            let mut out = Document::new();
            for value in &args {
                match value {
                    Bson::Null | Bson::Undefined => {}
                    Bson::Document(doc) => {
                        for (key, field) in doc {
                            out.insert(key.clone(), field.clone());
                        }
                    }
                    other => {
                        return Err(Error::type_mismatch(format!(
                            "$mergeObjects requires object inputs, but input is of type {}",
                            bson_util::type_name(other)
                        )))
                    }
                }
            }
            Ok(Bson::Document(out))
        }
        "$objectToArray" => {
            let [value] = take_args::<1>(op, args)?;
            if is_nullish(&value) {
                return Ok(Bson::Null);
            }
            let doc = value.as_document().ok_or_else(|| {
                Error::type_mismatch(format!(
                    "$objectToArray requires a document input, found: {}",
                    bson_util::type_name(&value)
                ))
            })?;
            Ok(Bson::Array(
                doc.iter()
                    .map(|(k, v)| {
                        Bson::Document(bson::doc! { "k": k.clone(), "v": v.clone() })
                    })
                    .collect(),
            ))
        }
        "$arrayToObject" => {
            let [value] = take_args::<1>(op, args)?;
            if is_nullish(&value) {
                return Ok(Bson::Null);
            }
            let items = require_array(op, &value)?;
            let mut out = Document::new();
            for item in items {
                match item {
                    Bson::Array(pair) if pair.len() == 2 => {
                        let key = pair[0].as_str().ok_or_else(|| {
                            Error::bad_value("$arrayToObject requires string keys")
                        })?;
                        out.insert(key.to_string(), pair[1].clone());
                    }
                    Bson::Document(kv) => {
                        let key = kv.get_str("k").map_err(|_| {
                            Error::bad_value("$arrayToObject requires a 'k' string field")
                        })?;
                        let v = kv.get("v").cloned().unwrap_or(Bson::Null);
                        out.insert(key.to_string(), v);
                    }
                    _ => {
                        return Err(Error::bad_value(
                            "$arrayToObject requires [k, v] pairs or {k, v} documents",
                        ))
                    }
                }
            }
            Ok(Bson::Document(out))
        }

        // -- types ---------------------------------------------------------
        "$type" => {
            let [value] = take_args::<1>(op, args)?;
            Ok(Bson::String(
                match value {
                    Bson::Undefined => "missing",
                    other => bson_util::type_name(&other),
                }
                .to_string(),
            ))
        }
        "$toInt" | "$toLong" | "$toDouble" | "$toString" | "$toBool" | "$toDate"
        | "$toObjectId" | "$toDecimal" => {
            let [value] = take_args::<1>(op, args)?;
            let target = format!("{}{}", op[3..4].to_lowercase(), &op[4..]);
            convert(&value, &target)
        }

        // -- dates ---------------------------------------------------------
        "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$second"
        | "$millisecond" | "$dayOfWeek" | "$dayOfYear" | "$week" => {
            let [value] = take_args::<1>(op, args)?;
            eval_date_part(op, &value)
        }
        // -- non-determinism ------------------------------------------------
        "$rand" => Ok(Bson::Double(ctx.rand())),

        unknown => Err(Error::command(
            code::INVALID_PIPELINE_OPERATOR,
            format!("Unrecognized expression '{}'", unknown),
        )),
    }
}

// Document-shaped operators take their argument unevaluated.
fn is_document_operator(op: &str) -> bool {
    matches!(
        op,
        "$trim"
            | "$ltrim"
            | "$rtrim"
            | "$regexMatch"
            | "$regexFind"
            | "$regexFindAll"
            | "$convert"
            | "$zip"
            | "$dateAdd"
            | "$dateSubtract"
            | "$dateDiff"
            | "$dateFromString"
            | "$dateToString"
    )
}

fn eval_args(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Vec<Bson>> {
    match arg {
        Bson::Array(items) => items.iter().map(|item| evaluate(item, ctx)).collect(),
        single => Ok(vec![evaluate(single, ctx)?]),
    }
}

fn take_args<const N: usize>(op: &str, args: Vec<Bson>) -> Result<[Bson; N]> {
    let len = args.len();
    args.try_into()
        .map_err(|_| wrong_arity(op, &N.to_string(), len))
}

fn wrong_arity(op: &str, expected: &str, found: usize) -> Error {
    Error::command(
        code::INVALID_PIPELINE_OPERATOR,
        format!(
            "Expression {} takes {} arguments; {} were passed in",
            op, expected, found
        ),
    )
}

fn is_nullish(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

fn normalize(value: &Bson) -> Bson {
    match value {
        Bson::Undefined => Bson::Null,
        other => other.clone(),
    }
}

fn require_number(op: &str, value: &Bson) -> Result<f64> {
    bson_util::as_f64(value).ok_or_else(|| {
        Error::type_mismatch(format!(
            "{} only supports numeric types, not {}",
            op,
            bson_util::type_name(value)
        ))
    })
}

fn require_int(op: &str, value: &Bson) -> Result<i64> {
    bson_util::get_int(value).ok_or_else(|| {
        Error::type_mismatch(format!(
            "{} requires an integral argument, found {}",
            op,
            bson_util::type_name(value)
        ))
    })
}

fn require_string(op: &str, value: &Bson) -> Result<String> {
    match value {
        Bson::String(s) => Ok(s.clone()),
        other => Err(Error::type_mismatch(format!(
            "{} requires a string argument, found {}",
            op,
            bson_util::type_name(other)
        ))),
    }
}

fn require_array<'v>(op: &str, value: &'v Bson) -> Result<&'v Vec<Bson>> {
    match value {
        Bson::Array(items) => Ok(items),
        other => Err(Error::type_mismatch(format!(
            "{} requires an array argument, found {}",
            op,
            bson_util::type_name(other)
        ))),
    }
}

fn coerce_to_string(value: &Bson) -> Result<String> {
    Ok(match value {
        Bson::Null | Bson::Undefined => String::new(),
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(f) => f.to_string(),
        other => {
            return Err(Error::type_mismatch(format!(
                "can't convert from BSON type {} to String",
                bson_util::type_name(other)
            )))
        }
    })
}

fn narrow_int(value: i64) -> Bson {
    match i32::try_from(value) {
        Ok(narrow) => Bson::Int32(narrow),
        Err(_) => Bson::Int64(value),
    }
}

fn eval_add(args: Vec<Bson>) -> Result<Bson> {
    if args.iter().any(is_nullish) {
        return Ok(Bson::Null);
    }
    let mut date_millis: Option<i64> = None;
    let mut int_sum: Option<i64> = Some(0);
    let mut sum = 0.0;
    for value in &args {
        if let Bson::DateTime(dt) = value {
            if date_millis.is_some() {
                return Err(Error::type_mismatch("only one date allowed in an $add expression"));
            }
            date_millis = Some(dt.timestamp_millis());
            continue;
        }
        let f = require_number("$add", value)?;
        sum += f;
        int_sum = match (int_sum, bson_util::get_int(value)) {
            (Some(acc), Some(i)) if !matches!(value, Bson::Double(_)) => acc.checked_add(i),
            _ => None,
        };
    }
    if let Some(base) = date_millis {
        let offset = int_sum.map(|i| i as f64).unwrap_or(sum);
        return Ok(Bson::DateTime(DateTime::from_millis(base + offset as i64)));
    }
    Ok(match int_sum {
        Some(i) => narrow_int(i),
        None => Bson::Double(sum),
    })
}

fn eval_subtract(op: &str, args: Vec<Bson>) -> Result<Bson> {
    let [a, b] = take_args::<2>(op, args)?;
    if is_nullish(&a) || is_nullish(&b) {
        return Ok(Bson::Null);
    }
    match (&a, &b) {
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            Ok(Bson::Int64(x.timestamp_millis() - y.timestamp_millis()))
        }
        (Bson::DateTime(x), other) => {
            let offset = require_number(op, other)?;
            Ok(Bson::DateTime(DateTime::from_millis(
                x.timestamp_millis() - offset as i64,
            )))
        }
        _ => {
            match (bson_util::get_int(&a), bson_util::get_int(&b)) {
                (Some(x), Some(y))
                    if !matches!(a, Bson::Double(_)) && !matches!(b, Bson::Double(_)) =>
                {
                    match x.checked_sub(y) {
                        Some(result) => Ok(narrow_int(result)),
                        None => Ok(Bson::Double(x as f64 - y as f64)),
                    }
                }
                _ => Ok(Bson::Double(require_number(op, &a)? - require_number(op, &b)?)),
            }
        }
    }
}

fn eval_rounding(op: &str, args: Vec<Bson>) -> Result<Bson> {
    let mut args = args;
    if args.is_empty() || args.len() > 2 {
        return Err(wrong_arity(op, "1 or 2", args.len()));
    }
    let places = if args.len() == 2 {
        require_int(op, &args.pop().unwrap())?
    } else {
        0
    };
    let value = args.pop().unwrap();
    if is_nullish(&value) {
        return Ok(Bson::Null);
    }
    if matches!(value, Bson::Int32(_) | Bson::Int64(_)) && places >= 0 {
        return Ok(value);
    }
    let f = require_number(op, &value)?;
    let factor = 10_f64.powi(places as i32);
    let scaled = f * factor;
    let rounded = match op {
        "$ceil" => scaled.ceil(),
        "$floor" => scaled.floor(),
        "$trunc" => scaled.trunc(),
        // Banker's rounding to match the reference server.
        _ => {
            let floor = scaled.floor();
            let diff = scaled - floor;
            if (diff - 0.5).abs() < f64::EPSILON {
                if (floor as i64) % 2 == 0 {
                    floor
                } else {
                    floor + 1.0
                }
            } else {
                scaled.round()
            }
        }
    };
    Ok(Bson::Double(rounded / factor))
}

fn unary_double(op: &str, args: Vec<Bson>, f: impl Fn(f64) -> f64) -> Result<Bson> {
    let [value] = take_args::<1>(op, args)?;
    if is_nullish(&value) {
        return Ok(Bson::Null);
    }
    Ok(Bson::Double(f(require_number(op, &value)?)))
}

fn eval_substr(op: &str, args: Vec<Bson>) -> Result<Bson> {
    let [input, start, count] = take_args::<3>(op, args)?;
    if is_nullish(&input) {
        return Ok(Bson::String(String::new()));
    }
    let input = coerce_to_string(&input)?;
    let start = require_int(op, &start)?.max(0) as usize;
    let count = require_int(op, &count)?;
    if op == "$substrCP" {
        let chars: Vec<char> = input.chars().collect();
        if start >= chars.len() || count < 0 {
            return Ok(Bson::String(String::new()));
        }
        let end = (start + count as usize).min(chars.len());
        Ok(Bson::String(chars[start..end].iter().collect()))
    } else {
        // Byte-based, clamped to char boundaries.
        let len = input.len();
        let mut from = start.min(len);
        while from < len && !input.is_char_boundary(from) {
            from += 1;
        }
        let mut to = if count < 0 {
            len
        } else {
            (from + count as usize).min(len)
        };
        while to < len && !input.is_char_boundary(to) {
            to += 1;
        }
        Ok(Bson::String(input[from..to].to_string()))
    }
}

fn eval_slice(op: &str, args: Vec<Bson>) -> Result<Bson> {
    if args.len() < 2 || args.len() > 3 {
        return Err(wrong_arity(op, "2 or 3", args.len()));
    }
    if is_nullish(&args[0]) {
        return Ok(Bson::Null);
    }
    let items = require_array(op, &args[0])?;
    if args.len() == 2 {
        let n = require_int(op, &args[1])?;
        let slice: Vec<Bson> = if n >= 0 {
            items.iter().take(n as usize).cloned().collect()
        } else {
            let keep = (n.unsigned_abs() as usize).min(items.len());
            items[items.len() - keep..].to_vec()
        };
        return Ok(Bson::Array(slice));
    }
    let position = require_int(op, &args[1])?;
    let n = require_int(op, &args[2])?;
    if n <= 0 {
        return Err(Error::bad_value(
            "$slice limit must be positive when a position is given",
        ));
    }
    let start = if position >= 0 {
        (position as usize).min(items.len())
    } else {
        items.len().saturating_sub(position.unsigned_abs() as usize)
    };
    let end = (start + n as usize).min(items.len());
    Ok(Bson::Array(items[start..end].to_vec()))
}

fn eval_short_circuit(op: &str, arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let items: Vec<&Bson> = match arg {
        Bson::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    for item in items {
        let value = evaluate(item, ctx)?;
        let truthy = is_truthy(&value);
        if op == "$and" && !truthy {
            return Ok(Bson::Boolean(false));
        }
        if op == "$or" && truthy {
            return Ok(Bson::Boolean(true));
        }
    }
    Ok(Bson::Boolean(op == "$and"))
}

fn eval_let(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$let requires a document argument"))?;
    let vars = spec
        .get_document("vars")
        .map_err(|_| Error::bad_value("$let requires a 'vars' document"))?;
    let body = spec
        .get("in")
        .ok_or_else(|| Error::bad_value("$let requires an 'in' expression"))?;
    let mut scoped = ExprContext {
        root: ctx.root,
        vars: ctx.vars.clone(),
        rng: ctx.rng,
    };
    for (name, value_expr) in vars {
        let value = evaluate(value_expr, ctx)?;
        scoped.vars.push((name.clone(), value));
    }
    evaluate(body, &scoped)
}

fn eval_filter(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$filter requires a document argument"))?;
    let input = evaluate(
        spec.get("input")
            .ok_or_else(|| Error::bad_value("$filter requires an 'input' expression"))?,
        ctx,
    )?;
    if is_nullish(&input) {
        return Ok(Bson::Null);
    }
    let items = require_array("$filter", &input)?;
    let var = spec.get_str("as").unwrap_or("this");
    let cond = spec
        .get("cond")
        .ok_or_else(|| Error::bad_value("$filter requires a 'cond' expression"))?;
    let limit = spec
        .get("limit")
        .map(|expr| evaluate(expr, ctx))
        .transpose()?
        .map(|v| require_int("$filter", &v))
        .transpose()?;
    let mut out = Vec::new();
    for item in items {
        let scoped = ctx.bind(var, item.clone());
        if is_truthy(&evaluate(cond, &scoped)?) {
            out.push(item.clone());
            if limit.is_some_and(|l| out.len() as i64 >= l) {
                break;
            }
        }
    }
    Ok(Bson::Array(out))
}

fn eval_map(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$map requires a document argument"))?;
    let input = evaluate(
        spec.get("input")
            .ok_or_else(|| Error::bad_value("$map requires an 'input' expression"))?,
        ctx,
    )?;
    if is_nullish(&input) {
        return Ok(Bson::Null);
    }
    let items = require_array("$map", &input)?;
    let var = spec.get_str("as").unwrap_or("this");
    let body = spec
        .get("in")
        .ok_or_else(|| Error::bad_value("$map requires an 'in' expression"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let scoped = ctx.bind(var, item.clone());
        let mapped = evaluate(body, &scoped)?;
        out.push(normalize(&mapped));
    }
    Ok(Bson::Array(out))
}

fn eval_reduce(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$reduce requires a document argument"))?;
    let input = evaluate(
        spec.get("input")
            .ok_or_else(|| Error::bad_value("$reduce requires an 'input' expression"))?,
        ctx,
    )?;
    if is_nullish(&input) {
        return Ok(Bson::Null);
    }
    let items = require_array("$reduce", &input)?.clone();
    let mut value = evaluate(
        spec.get("initialValue")
            .ok_or_else(|| Error::bad_value("$reduce requires an 'initialValue' expression"))?,
        ctx,
    )?;
    let body = spec
        .get("in")
        .ok_or_else(|| Error::bad_value("$reduce requires an 'in' expression"))?;
    for item in items {
        let scoped = ctx.bind("value", value).bind("this", item);
        value = evaluate(body, &scoped)?;
    }
    Ok(value)
}

fn eval_cond(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let (condition, then_branch, else_branch) = match arg {
        Bson::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Bson::Document(spec) => {
            let condition = spec
                .get("if")
                .ok_or_else(|| Error::bad_value("Missing 'if' parameter to $cond"))?;
            let then_branch = spec
                .get("then")
                .ok_or_else(|| Error::bad_value("Missing 'then' parameter to $cond"))?;
            let else_branch = spec
                .get("else")
                .ok_or_else(|| Error::bad_value("Missing 'else' parameter to $cond"))?;
            (condition, then_branch, else_branch)
        }
        _ => return Err(Error::bad_value("$cond requires either 3 arguments or an object")),
    };
    if is_truthy(&evaluate(condition, ctx)?) {
        evaluate(then_branch, ctx)
    } else {
        evaluate(else_branch, ctx)
    }
}

fn eval_switch(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$switch requires a document argument"))?;
    let branches = spec
        .get_array("branches")
        .map_err(|_| Error::bad_value("$switch requires a 'branches' array"))?;
    for branch in branches {
        let branch = branch
            .as_document()
            .ok_or_else(|| Error::bad_value("$switch branches must be documents"))?;
        let case = branch
            .get("case")
            .ok_or_else(|| Error::bad_value("$switch branches require a 'case'"))?;
        if is_truthy(&evaluate(case, ctx)?) {
            let then = branch
                .get("then")
                .ok_or_else(|| Error::bad_value("$switch branches require a 'then'"))?;
            return evaluate(then, ctx);
        }
    }
    match spec.get("default") {
        Some(default) => evaluate(default, ctx),
        None => Err(Error::bad_value(
            "$switch could not find a matching branch for an input, and no default was \
             specified",
        )),
    }
}

fn eval_if_null(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let items = match arg {
        Bson::Array(items) if items.len() >= 2 => items,
        _ => {
            return Err(Error::bad_value(
                "$ifNull needs at least two arguments",
            ))
        }
    };
    for (index, item) in items.iter().enumerate() {
        let value = evaluate(item, ctx)?;
        if !is_nullish(&value) || index == items.len() - 1 {
            return Ok(normalize(&value));
        }
    }
    Ok(Bson::Null)
}

// ---------------------------------------------------------------------------
// Document-shaped operators
// ---------------------------------------------------------------------------

fn eval_document_operator(op: &str, arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    match op {
        "$trim" | "$ltrim" | "$rtrim" => {
            let spec = arg
                .as_document()
                .ok_or_else(|| Error::bad_value(format!("{} requires a document argument", op)))?;
            let input = evaluate(
                spec.get("input")
                    .ok_or_else(|| Error::bad_value(format!("{} requires an 'input'", op)))?,
                ctx,
            )?;
            if is_nullish(&input) {
                return Ok(Bson::Null);
            }
            let input = require_string(op, &input)?;
            let chars: Option<Vec<char>> = match spec.get("chars") {
                Some(expr) => {
                    let value = evaluate(expr, ctx)?;
                    if is_nullish(&value) {
                        None
                    } else {
                        Some(require_string(op, &value)?.chars().collect())
                    }
                }
                None => None,
            };
            let pred = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let trimmed = match op {
                "$trim" => input.trim_matches(pred),
                "$ltrim" => input.trim_start_matches(pred),
                _ => input.trim_end_matches(pred),
            };
            Ok(Bson::String(trimmed.to_string()))
        }
        "$regexMatch" | "$regexFind" | "$regexFindAll" => eval_regex_op(op, arg, ctx),
        "$convert" => {
            let spec = arg
                .as_document()
                .ok_or_else(|| Error::bad_value("$convert requires a document argument"))?;
            let input = evaluate(
                spec.get("input")
                    .ok_or_else(|| Error::bad_value("$convert requires an 'input'"))?,
                ctx,
            )?;
            let to = evaluate(
                spec.get("to")
                    .ok_or_else(|| Error::bad_value("$convert requires a 'to'"))?,
                ctx,
            )?;
            let target = match &to {
                Bson::String(name) => name.clone(),
                other => match bson_util::get_int(other) {
                    Some(code) => type_name_for_code(code)?.to_string(),
                    None => {
                        return Err(Error::bad_value(
                            "$convert 'to' must be a type name or number",
                        ))
                    }
                },
            };
            let on_error = spec.get("onError");
            let on_null = spec.get("onNull");
            match convert(&input, &target) {
                Ok(Bson::Null) if on_null.is_some() && is_nullish(&input) => {
                    evaluate(on_null.unwrap(), ctx)
                }
                Ok(value) => Ok(value),
                Err(_) if on_error.is_some() => evaluate(on_error.unwrap(), ctx),
                Err(error) => Err(error),
            }
        }
        "$zip" => {
            let spec = arg
                .as_document()
                .ok_or_else(|| Error::bad_value("$zip requires a document argument"))?;
            let inputs_value = evaluate(
                spec.get("inputs")
                    .ok_or_else(|| Error::bad_value("$zip requires an 'inputs' array"))?,
                ctx,
            )?;
            let inputs = require_array("$zip", &inputs_value)?;
            let mut arrays: Vec<&Vec<Bson>> = Vec::with_capacity(inputs.len());
            for input in inputs {
                if is_nullish(input) {
                    return Ok(Bson::Null);
                }
                arrays.push(require_array("$zip", input)?);
            }
            if arrays.is_empty() {
                return Err(Error::bad_value("$zip requires at least one input array"));
            }
            let use_longest = spec.get_bool("useLongestLength").unwrap_or(false);
            let defaults: Vec<Bson> = match spec.get("defaults") {
                Some(expr) => {
                    let value = evaluate(expr, ctx)?;
                    require_array("$zip", &value)?.clone()
                }
                None => vec![Bson::Null; arrays.len()],
            };
            let length = if use_longest {
                arrays.iter().map(|a| a.len()).max().unwrap_or(0)
            } else {
                arrays.iter().map(|a| a.len()).min().unwrap_or(0)
            };
            let mut out = Vec::with_capacity(length);
            for i in 0..length {
                let row: Vec<Bson> = arrays
                    .iter()
                    .enumerate()
                    .map(|(j, array)| {
                        array
                            .get(i)
                            .cloned()
                            .unwrap_or_else(|| defaults.get(j).cloned().unwrap_or(Bson::Null))
                    })
                    .collect();
                out.push(Bson::Array(row));
            }
            Ok(Bson::Array(out))
        }
        "$dateAdd" | "$dateSubtract" => eval_date_arith(op, arg, ctx),
        "$dateDiff" => eval_date_diff(arg, ctx),
        "$dateFromString" => eval_date_from_string(arg, ctx),
        "$dateToString" => eval_date_to_string(arg, ctx),
        _ => unreachable!(),
    }
}

fn eval_regex_op(op: &str, arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value(format!("{} requires a document argument", op)))?;
    let input = evaluate(
        spec.get("input")
            .ok_or_else(|| Error::bad_value(format!("{} requires an 'input'", op)))?,
        ctx,
    )?;
    let regex_value = evaluate(
        spec.get("regex")
            .ok_or_else(|| Error::bad_value(format!("{} requires a 'regex'", op)))?,
        ctx,
    )?;
    let options = match spec.get("options") {
        Some(expr) => {
            let value = evaluate(expr, ctx)?;
            require_string(op, &value)?
        }
        None => String::new(),
    };
    if is_nullish(&input) || is_nullish(&regex_value) {
        return Ok(match op {
            "$regexMatch" => Bson::Boolean(false),
            "$regexFind" => Bson::Null,
            _ => Bson::Array(Vec::new()),
        });
    }
    let input = require_string(op, &input)?;
    let (pattern, inline_options) = match &regex_value {
        Bson::String(pattern) => (pattern.clone(), String::new()),
        Bson::RegularExpression(regex) => (regex.pattern.clone(), regex.options.clone()),
        other => {
            return Err(Error::type_mismatch(format!(
                "{} requires a string or regex for 'regex', found {}",
                op,
                bson_util::type_name(other)
            )))
        }
    };
    let merged_options = if options.is_empty() {
        inline_options
    } else {
        options
    };
    let regex = crate::matcher::build_regex(&pattern, &merged_options)?;
    match op {
        "$regexMatch" => Ok(Bson::Boolean(regex.is_match(&input))),
        "$regexFind" => Ok(regex
            .captures(&input)
            .map(|captures| capture_document(&input, &captures))
            .unwrap_or(Bson::Null)),
        _ => {
            let mut out = Vec::new();
            for captures in regex.captures_iter(&input) {
                out.push(capture_document(&input, &captures));
            }
            Ok(Bson::Array(out))
        }
    }
}

fn capture_document(input: &str, captures: &regex::Captures<'_>) -> Bson {
    let overall = captures.get(0).unwrap();
    let idx = input[..overall.start()].chars().count() as i32;
    let groups: Vec<Bson> = captures
        .iter()
        .skip(1)
        .map(|group| match group {
            Some(m) => Bson::String(m.as_str().to_string()),
            None => Bson::Null,
        })
        .collect();
    Bson::Document(bson::doc! {
        "match": overall.as_str(),
        "idx": idx,
        "captures": groups,
    })
}

fn type_name_for_code(code: i64) -> Result<&'static str> {
    Ok(match code {
        1 => "double",
        2 => "string",
        7 => "objectId",
        8 => "bool",
        9 => "date",
        16 => "int",
        18 => "long",
        19 => "decimal",
        _ => return Err(Error::bad_value(format!("unsupported conversion target: {}", code))),
    })
}

fn conversion_failure(value: &Bson, target: &str) -> Error {
    Error::command(
        code::CONVERSION_FAILURE,
        format!(
            "Unsupported conversion from {} to {} in $convert with no onError value",
            bson_util::type_name(value),
            target
        ),
    )
}

fn convert(value: &Bson, target: &str) -> Result<Bson> {
    if is_nullish(value) {
        return Ok(Bson::Null);
    }
    match target {
        "double" => match value {
            Bson::Boolean(b) => Ok(Bson::Double(if *b { 1.0 } else { 0.0 })),
            Bson::String(s) => s
                .parse::<f64>()
                .map(Bson::Double)
                .map_err(|_| conversion_failure(value, target)),
            Bson::DateTime(dt) => Ok(Bson::Double(dt.timestamp_millis() as f64)),
            other => bson_util::as_f64(other)
                .map(Bson::Double)
                .ok_or_else(|| conversion_failure(value, target)),
        },
        "int" => match value {
            Bson::Boolean(b) => Ok(Bson::Int32(*b as i32)),
            Bson::String(s) => s
                .parse::<i32>()
                .map(Bson::Int32)
                .map_err(|_| conversion_failure(value, target)),
            other => match bson_util::as_f64(other) {
                Some(f) if f.is_finite() && (f.trunc() >= i32::MIN as f64) && (f.trunc() <= i32::MAX as f64) => {
                    Ok(Bson::Int32(f.trunc() as i32))
                }
                _ => Err(conversion_failure(value, target)),
            },
        },
        "long" => match value {
            Bson::Boolean(b) => Ok(Bson::Int64(*b as i64)),
            Bson::String(s) => s
                .parse::<i64>()
                .map(Bson::Int64)
                .map_err(|_| conversion_failure(value, target)),
            Bson::DateTime(dt) => Ok(Bson::Int64(dt.timestamp_millis())),
            other => match bson_util::as_f64(other) {
                Some(f) if f.is_finite() => Ok(Bson::Int64(f.trunc() as i64)),
                _ => Err(conversion_failure(value, target)),
            },
        },
        "decimal" => {
            let repr = match value {
                Bson::String(s) => s.clone(),
                Bson::Boolean(b) => (*b as i32).to_string(),
                other => match bson_util::as_f64(other) {
                    Some(f) => f.to_string(),
                    None => return Err(conversion_failure(value, target)),
                },
            };
            repr.parse::<bson::Decimal128>()
                .map(Bson::Decimal128)
                .map_err(|_| conversion_failure(value, target))
        }
        "string" => match value {
            Bson::String(s) => Ok(Bson::String(s.clone())),
            Bson::Boolean(b) => Ok(Bson::String(b.to_string())),
            Bson::ObjectId(oid) => Ok(Bson::String(oid.to_hex())),
            Bson::DateTime(dt) => Ok(Bson::String(
                format_datetime(&dt.to_chrono(), "%Y-%m-%dT%H:%M:%S.%LZ")?,
            )),
            Bson::Decimal128(d) => Ok(Bson::String(d.to_string())),
            other => coerce_to_string(other).map(Bson::String),
        },
        "bool" => Ok(Bson::Boolean(match value {
            Bson::Boolean(b) => *b,
            Bson::String(_) => true,
            other => bson_util::as_f64(other).map_or(true, |f| f != 0.0),
        })),
        "date" => match value {
            Bson::DateTime(dt) => Ok(Bson::DateTime(*dt)),
            Bson::String(s) => parse_date_string(s, None).map(Bson::DateTime),
            Bson::ObjectId(oid) => Ok(Bson::DateTime(oid.timestamp())),
            other => match bson_util::get_int(other) {
                Some(millis) => Ok(Bson::DateTime(DateTime::from_millis(millis))),
                None => Err(conversion_failure(value, target)),
            },
        },
        "objectId" => match value {
            Bson::ObjectId(oid) => Ok(Bson::ObjectId(*oid)),
            Bson::String(s) => ObjectId::parse_str(s)
                .map(Bson::ObjectId)
                .map_err(|_| conversion_failure(value, target)),
            _ => Err(conversion_failure(value, target)),
        },
        other => Err(Error::bad_value(format!(
            "$convert cannot convert to {}",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

fn require_date(op: &str, value: &Bson) -> Result<chrono::DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Ok(dt.to_chrono()),
        other => Err(Error::type_mismatch(format!(
            "{} requires a date, found {}",
            op,
            bson_util::type_name(other)
        ))),
    }
}

fn eval_date_part(op: &str, value: &Bson) -> Result<Bson> {
    if is_nullish(value) {
        return Ok(Bson::Null);
    }
    let dt = require_date(op, value)?;
    Ok(Bson::Int32(match op {
        "$year" => dt.year(),
        "$month" => dt.month() as i32,
        "$dayOfMonth" => dt.day() as i32,
        "$hour" => dt.hour() as i32,
        "$minute" => dt.minute() as i32,
        "$second" => dt.second() as i32,
        "$millisecond" => dt.timestamp_subsec_millis() as i32,
        // Sunday = 1 .. Saturday = 7.
        "$dayOfWeek" => dt.weekday().num_days_from_sunday() as i32 + 1,
        "$dayOfYear" => dt.ordinal() as i32,
        _ => (dt.ordinal() as i32 + 6 - dt.weekday().num_days_from_sunday() as i32) / 7,
    }))
}

fn date_unit_millis(unit: &str) -> Option<i64> {
    Some(match unit {
        "millisecond" => 1,
        "second" => 1_000,
        "minute" => 60_000,
        "hour" => 3_600_000,
        "day" => 86_400_000,
        "week" => 7 * 86_400_000,
        _ => return None,
    })
}

fn add_months(dt: chrono::DateTime<Utc>, months: i64) -> chrono::DateTime<Utc> {
    let total = dt.year() as i64 * 12 + dt.month0() as i64 + months;
    let year = total.div_euclid(12) as i32;
    let month = total.rem_euclid(12) as u32 + 1;
    let last_day = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31][month as usize - 1]
        + if month == 2
            && (year % 4 == 0 && (year % 100 != 0 || year % 400 == 0))
        {
            1
        } else {
            0
        };
    let day = dt.day().min(last_day);
    Utc.with_ymd_and_hms(year, month, day, dt.hour(), dt.minute(), dt.second())
        .single()
        .map(|d| d + chrono::Duration::milliseconds(dt.timestamp_subsec_millis() as i64))
        .unwrap_or(dt)
}

fn eval_date_arith(op: &str, arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value(format!("{} requires a document argument", op)))?;
    let start = evaluate(
        spec.get("startDate")
            .ok_or_else(|| Error::bad_value(format!("{} requires a 'startDate'", op)))?,
        ctx,
    )?;
    if is_nullish(&start) {
        return Ok(Bson::Null);
    }
    let start = require_date(op, &start)?;
    let unit_value = evaluate(
        spec.get("unit")
            .ok_or_else(|| Error::bad_value(format!("{} requires a 'unit'", op)))?,
        ctx,
    )?;
    let unit = require_string(op, &unit_value)?;
    let amount_value = evaluate(
        spec.get("amount")
            .ok_or_else(|| Error::bad_value(format!("{} requires an 'amount'", op)))?,
        ctx,
    )?;
    let mut amount = require_int(op, &amount_value)?;
    if op == "$dateSubtract" {
        amount = -amount;
    }
    let result = match unit.as_str() {
        "year" => add_months(start, amount * 12),
        "quarter" => add_months(start, amount * 3),
        "month" => add_months(start, amount),
        other => {
            let millis = date_unit_millis(other).ok_or_else(|| {
                Error::bad_value(format!("unknown time unit value: {}", other))
            })?;
            start + chrono::Duration::milliseconds(amount * millis)
        }
    };
    Ok(Bson::DateTime(DateTime::from_chrono(result)))
}

fn eval_date_diff(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let op = "$dateDiff";
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$dateDiff requires a document argument"))?;
    let start = evaluate(
        spec.get("startDate")
            .ok_or_else(|| Error::bad_value("$dateDiff requires a 'startDate'"))?,
        ctx,
    )?;
    let end = evaluate(
        spec.get("endDate")
            .ok_or_else(|| Error::bad_value("$dateDiff requires an 'endDate'"))?,
        ctx,
    )?;
    if is_nullish(&start) || is_nullish(&end) {
        return Ok(Bson::Null);
    }
    let (start, end) = (require_date(op, &start)?, require_date(op, &end)?);
    let unit_value = evaluate(
        spec.get("unit")
            .ok_or_else(|| Error::bad_value("$dateDiff requires a 'unit'"))?,
        ctx,
    )?;
    let unit = require_string(op, &unit_value)?;
    let diff = match unit.as_str() {
        "year" => (end.year() - start.year()) as i64,
        "quarter" => {
            (end.year() as i64 * 4 + end.month0() as i64 / 3)
                - (start.year() as i64 * 4 + start.month0() as i64 / 3)
        }
        "month" => {
            (end.year() as i64 * 12 + end.month0() as i64)
                - (start.year() as i64 * 12 + start.month0() as i64)
        }
        other => {
            let millis = date_unit_millis(other).ok_or_else(|| {
                Error::bad_value(format!("unknown time unit value: {}", other))
            })?;
            (end.timestamp_millis() - start.timestamp_millis()).div_euclid(millis)
        }
    };
    Ok(Bson::Int64(diff))
}

fn parse_date_string(input: &str, format: Option<&str>) -> Result<DateTime> {
    if let Some(format) = format {
        let chrono_format = translate_format(format)?;
        let parsed = chrono::NaiveDateTime::parse_from_str(input, &chrono_format)
            .map(|dt| dt.and_utc())
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(input, &chrono_format)
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc())
            })
            .map_err(|e| {
                Error::command(
                    code::CONVERSION_FAILURE,
                    format!("Error parsing date string '{}': {}", input, e),
                )
            })?;
        return Ok(DateTime::from_chrono(parsed));
    }
    // Without a format: RFC 3339, then the common ISO shapes.
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(input) {
        return Ok(DateTime::from_chrono(parsed.with_timezone(&Utc)));
    }
    for pattern in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d",
    ] {
        if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(input, pattern) {
            return Ok(DateTime::from_chrono(parsed.and_utc()));
        }
        if let Ok(parsed) = chrono::NaiveDate::parse_from_str(input, pattern) {
            return Ok(DateTime::from_chrono(
                parsed.and_hms_opt(0, 0, 0).unwrap().and_utc(),
            ));
        }
    }
    Err(Error::command(
        code::CONVERSION_FAILURE,
        format!("Error parsing date string '{}'", input),
    ))
}

/// Maps the server's date format specifiers onto chrono's. `%L` (milliseconds) becomes
/// `%3f`; the shared specifiers pass through.
fn translate_format(format: &str) -> Result<String> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('L') => out.push_str("%3f"),
            Some(spec @ ('Y' | 'm' | 'd' | 'H' | 'M' | 'S' | 'j' | 'w' | 'u' | 'U' | 'V' | 'G' | '%')) => {
                out.push('%');
                out.push(spec);
            }
            Some(other) => {
                return Err(Error::bad_value(format!(
                    "Invalid format character '%{}' in format string",
                    other
                )))
            }
            None => {
                return Err(Error::bad_value(
                    "Unmatched '%' at end of format string",
                ))
            }
        }
    }
    Ok(out)
}

fn format_datetime(dt: &chrono::DateTime<Utc>, format: &str) -> Result<String> {
    let translated = translate_format(format)?;
    // The server's %w is 1-7 (Sunday first); chrono's is 0-6.
    let translated = translated.replace(
        "%w",
        &(dt.weekday().num_days_from_sunday() + 1).to_string(),
    );
    Ok(dt.format(&translated).to_string())
}

fn eval_date_from_string(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$dateFromString requires a document argument"))?;
    let input = evaluate(
        spec.get("dateString")
            .ok_or_else(|| Error::bad_value("$dateFromString requires a 'dateString'"))?,
        ctx,
    )?;
    if is_nullish(&input) {
        return match spec.get("onNull") {
            Some(fallback) => evaluate(fallback, ctx),
            None => Ok(Bson::Null),
        };
    }
    let format = match spec.get("format") {
        Some(expr) => {
            let value = evaluate(expr, ctx)?;
            Some(require_string("$dateFromString", &value)?)
        }
        None => None,
    };
    let input = require_string("$dateFromString", &input)?;
    match parse_date_string(&input, format.as_deref()) {
        Ok(parsed) => Ok(Bson::DateTime(parsed)),
        Err(_) if spec.contains_key("onError") => evaluate(spec.get("onError").unwrap(), ctx),
        Err(error) => Err(error),
    }
}

fn eval_date_to_string(arg: &Bson, ctx: &ExprContext<'_>) -> Result<Bson> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$dateToString requires a document argument"))?;
    let date = evaluate(
        spec.get("date")
            .ok_or_else(|| Error::bad_value("$dateToString requires a 'date'"))?,
        ctx,
    )?;
    if is_nullish(&date) {
        return match spec.get("onNull") {
            Some(fallback) => evaluate(fallback, ctx),
            None => Ok(Bson::Null),
        };
    }
    let date = require_date("$dateToString", &date)?;
    let format = match spec.get("format") {
        Some(expr) => {
            let value = evaluate(expr, ctx)?;
            require_string("$dateToString", &value)?
        }
        None => "%Y-%m-%dT%H:%M:%S.%LZ".to_string(),
    };
    Ok(Bson::String(format_datetime(&date, &format)?))
}
