//! The update-operator engine: applies update documents and replacements to a single
//! document, reports whether the document actually changed, and builds the seed document
//! for upserts.
//!
//! Callers apply updates to a clone of the stored document; on any operator error the
//! clone is discarded, which gives each single-document update its all-or-nothing
//! behavior.

use std::cmp::Ordering;

use bson::{Bson, DateTime, Document, Timestamp};

use crate::{
    bson_util::{self, UpdateDocKind},
    error::{code, Error, Result},
    matcher::{self, ElementCondition},
    path::{self, CreateMode, Slot},
};

/// Context threaded through one update application.
pub(crate) struct UpdateContext<'a> {
    /// The filter that selected the document; consulted by positional `$` segments and by
    /// upsert seeding.
    pub(crate) filter: &'a Document,
    /// Whether this application is creating a new document via upsert.
    pub(crate) upserting: bool,
}

/// Applies an operator-style update document to `doc` in place. Returns an error on the
/// first failing operator; the caller is responsible for discarding the partial result.
pub(crate) fn apply_operators(
    doc: &mut Document,
    update: &Document,
    ctx: &UpdateContext<'_>,
) -> Result<()> {
    let mut touched: Vec<String> = Vec::new();
    for (op, arg) in update {
        let targets = arg.as_document().ok_or_else(|| {
            Error::failed_to_parse(format!(
                "Modifiers operate on fields but we found type {} instead",
                bson_util::type_name(arg)
            ))
        })?;
        for (raw_path, value) in targets {
            let target_path = resolve_positional(doc, raw_path, ctx)?;
            check_conflict(&mut touched, &target_path)?;
            apply_one(doc, op, &target_path, value, ctx)?;
        }
    }
    Ok(())
}

/// Applies a replacement document: every field except `_id` is replaced. The stored
/// `_id` is preserved; a replacement carrying a different `_id` is rejected.
pub(crate) fn apply_replacement(doc: &mut Document, replacement: &Document) -> Result<()> {
    if let (Some(old_id), Some(new_id)) = (doc.get("_id"), replacement.get("_id")) {
        if !bson_util::values_equal(old_id, new_id) {
            return Err(Error::command(
                code::IMMUTABLE_FIELD,
                "Performing an update on the path '_id' would modify the immutable field '_id'",
            ));
        }
    }
    let mut rebuilt = Document::new();
    if let Some(id) = doc.get("_id").cloned() {
        rebuilt.insert("_id", id);
    }
    for (key, value) in replacement {
        if key != "_id" {
            rebuilt.insert(key.clone(), value.clone());
        }
    }
    *doc = rebuilt;
    Ok(())
}

/// Whether applying `update` changed `doc` relative to `original`, by structural
/// equality. Drives `modifiedCount`.
pub(crate) fn was_modified(original: &Document, updated: &Document) -> bool {
    !bson_util::documents_equal(original, updated)
}

/// Builds the document an upsert inserts when no document matched: the filter's equality
/// fragments, then the update applied with missing-field initialization, then a generated
/// `_id` if none resulted.
pub(crate) fn build_upsert(
    fragments: Document,
    update: &Document,
    kind: UpdateDocKind,
    filter: &Document,
) -> Result<Document> {
    let mut seed = match kind {
        UpdateDocKind::Operators => {
            let mut seed = fragments;
            let ctx = UpdateContext {
                filter,
                upserting: true,
            };
            apply_operators(&mut seed, update, &ctx)?;
            seed
        }
        UpdateDocKind::Replacement => {
            let mut seed = update.clone();
            for (key, value) in fragments {
                if !seed.contains_key(&key) {
                    seed.insert(key, value);
                }
            }
            seed
        }
    };
    bson_util::ensure_id(&mut seed);
    bson_util::id_first(&mut seed);
    Ok(seed)
}

fn check_conflict(touched: &mut Vec<String>, target: &str) -> Result<()> {
    for prior in touched.iter() {
        let conflict = prior == target
            || prior.starts_with(&format!("{}.", target))
            || target.starts_with(&format!("{}.", prior));
        if conflict {
            return Err(Error::command(
                code::CONFLICTING_UPDATE_OPERATORS,
                format!(
                    "Updating the path '{}' would create a conflict at '{}'",
                    target, prior
                ),
            ));
        }
    }
    touched.push(target.to_string());
    Ok(())
}

/// Resolves a positional `$` segment to the index of the first array element matched by
/// the originating filter.
fn resolve_positional(
    doc: &Document,
    raw_path: &str,
    ctx: &UpdateContext<'_>,
) -> Result<String> {
    if !raw_path.split('.').any(|segment| segment == "$") {
        return Ok(raw_path.to_string());
    }
    let segments: Vec<&str> = raw_path.split('.').collect();
    let dollar = segments.iter().position(|s| *s == "$").unwrap();
    if dollar == 0 {
        return Err(Error::bad_value(
            "Cannot have positional (i.e. '$') element in the first position",
        ));
    }
    let array_path = segments[..dollar].join(".");
    let array = match path::collect(doc, &array_path)
        .into_iter()
        .find_map(|v| v.as_present().cloned())
    {
        Some(Bson::Array(elements)) => elements,
        _ => {
            return Err(Error::bad_value(format!(
                "The positional operator did not find the match needed from the query; \
                 field '{}' is not an array",
                array_path
            )))
        }
    };
    let index = matcher::first_matching_element_index(ctx.filter, &array_path, &array)?
        .ok_or_else(|| {
            Error::bad_value(
                "The positional operator did not find the match needed from the query",
            )
        })?;
    let mut resolved = segments.clone();
    let index_string = index.to_string();
    resolved[dollar] = &index_string;
    Ok(resolved.join("."))
}

fn apply_one(
    doc: &mut Document,
    op: &str,
    target: &str,
    value: &Bson,
    ctx: &UpdateContext<'_>,
) -> Result<()> {
    match op {
        "$set" => {
            let slot = path::resolve_slot(doc, target, CreateMode::CreatePad)?
                .ok_or_else(|| Error::internal("unresolvable $set target"))?;
            slot.set(value.clone());
            Ok(())
        }
        "$unset" => {
            if let Some(slot) = path::resolve_slot(doc, target, CreateMode::NoCreate)? {
                slot.remove();
            }
            Ok(())
        }
        "$rename" => apply_rename(doc, target, value),
        "$setOnInsert" => {
            if ctx.upserting {
                let slot = path::resolve_slot(doc, target, CreateMode::CreatePad)?
                    .ok_or_else(|| Error::internal("unresolvable $setOnInsert target"))?;
                slot.set(value.clone());
            }
            Ok(())
        }
        "$inc" => apply_arithmetic(doc, target, value, ArithmeticOp::Inc),
        "$mul" => apply_arithmetic(doc, target, value, ArithmeticOp::Mul),
        "$min" => apply_min_max(doc, target, value, Ordering::Less),
        "$max" => apply_min_max(doc, target, value, Ordering::Greater),
        "$push" => apply_push(doc, target, value),
        "$addToSet" => apply_add_to_set(doc, target, value),
        "$pop" => apply_pop(doc, target, value),
        "$pull" => apply_pull(doc, target, value),
        "$pullAll" => apply_pull_all(doc, target, value),
        "$bit" => apply_bit(doc, target, value),
        "$currentDate" => apply_current_date(doc, target, value),
        unknown => Err(Error::failed_to_parse(format!(
            "Unknown modifier: {}",
            unknown
        ))),
    }
}

fn apply_rename(doc: &mut Document, source: &str, value: &Bson) -> Result<()> {
    let dest = match value {
        Bson::String(dest) => dest.clone(),
        _ => {
            return Err(Error::bad_value(format!(
                "The 'to' field for $rename must be a string: {}",
                value
            )))
        }
    };
    if dest == source {
        return Err(Error::bad_value(format!(
            "The source and target field for $rename must differ: {}",
            source
        )));
    }
    let taken = match path::resolve_slot(doc, source, CreateMode::NoCreate)? {
        Some(slot) => {
            if slot.is_element() {
                return Err(Error::bad_value(format!(
                    "The source field for $rename may not be dynamic: {}",
                    source
                )));
            }
            slot.remove()
        }
        None => None,
    };
    if let Some(taken) = taken {
        let slot = path::resolve_slot(doc, &dest, CreateMode::Create)?
            .ok_or_else(|| Error::internal("unresolvable $rename target"))?;
        if slot.is_element() {
            return Err(Error::bad_value(format!(
                "The destination field for $rename may not be dynamic: {}",
                dest
            )));
        }
        slot.set(taken);
    }
    Ok(())
}

enum ArithmeticOp {
    Inc,
    Mul,
}

fn apply_arithmetic(
    doc: &mut Document,
    target: &str,
    operand: &Bson,
    op: ArithmeticOp,
) -> Result<()> {
    if !bson_util::is_number(operand) {
        let name = match op {
            ArithmeticOp::Inc => "increment",
            ArithmeticOp::Mul => "multiply",
        };
        return Err(Error::type_mismatch(format!(
            "Cannot {} with non-numeric argument: {{{}: {}}}",
            name, target, operand
        )));
    }
    let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
    let slot = path::resolve_slot(doc, target, CreateMode::Create)?
        .ok_or_else(|| Error::internal("unresolvable arithmetic target"))?;
    let current = match slot.get() {
        None => Bson::Int32(0),
        Some(existing) => {
            if !bson_util::is_number(existing) {
                let name = match op {
                    ArithmeticOp::Inc => "$inc",
                    ArithmeticOp::Mul => "$mul",
                };
                return Err(Error::type_mismatch(format!(
                    "Cannot apply {} to a value of non-numeric type. {{_id: {}}} has the \
                     field '{}' of non-numeric type {}",
                    name,
                    id,
                    target,
                    bson_util::type_name(existing)
                )));
            }
            existing.clone()
        }
    };
    let result = match op {
        ArithmeticOp::Inc => numeric_add(&current, operand)?,
        ArithmeticOp::Mul => numeric_mul(&current, operand)?,
    };
    slot.set(result);
    Ok(())
}

fn numeric_add(a: &Bson, b: &Bson) -> Result<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Ok(match x.checked_add(*y) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(*x as i64 + *y as i64),
        }),
        (Bson::Double(_), _) | (_, Bson::Double(_)) | (Bson::Decimal128(_), _) | (_, Bson::Decimal128(_)) => {
            let (x, y) = (f64_of(a)?, f64_of(b)?);
            Ok(Bson::Double(x + y))
        }
        _ => {
            let (x, y) = (int_of(a)?, int_of(b)?);
            x.checked_add(y)
                .map(Bson::Int64)
                .ok_or_else(|| Error::bad_value("integer overflow in $inc"))
        }
    }
}

fn numeric_mul(a: &Bson, b: &Bson) -> Result<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Ok(match x.checked_mul(*y) {
            Some(product) => Bson::Int32(product),
            None => Bson::Int64(*x as i64 * *y as i64),
        }),
        (Bson::Double(_), _) | (_, Bson::Double(_)) | (Bson::Decimal128(_), _) | (_, Bson::Decimal128(_)) => {
            let (x, y) = (f64_of(a)?, f64_of(b)?);
            Ok(Bson::Double(x * y))
        }
        _ => {
            let (x, y) = (int_of(a)?, int_of(b)?);
            x.checked_mul(y)
                .map(Bson::Int64)
                .ok_or_else(|| Error::bad_value("integer overflow in $mul"))
        }
    }
}

fn f64_of(value: &Bson) -> Result<f64> {
    bson_util::as_f64(value).ok_or_else(|| Error::type_mismatch("expected a number"))
}

fn int_of(value: &Bson) -> Result<i64> {
    match value {
        Bson::Int32(i) => Ok(*i as i64),
        Bson::Int64(i) => Ok(*i),
        _ => Err(Error::type_mismatch("expected an integer")),
    }
}

fn apply_min_max(
    doc: &mut Document,
    target: &str,
    operand: &Bson,
    keep_when: Ordering,
) -> Result<()> {
    let slot = path::resolve_slot(doc, target, CreateMode::Create)?
        .ok_or_else(|| Error::internal("unresolvable $min/$max target"))?;
    let replace = match slot.get() {
        None => true,
        Some(existing) => bson_util::cmp_bson(operand, existing) == keep_when,
    };
    if replace {
        slot.set(operand.clone());
    }
    Ok(())
}

fn apply_current_date(doc: &mut Document, target: &str, spec: &Bson) -> Result<()> {
    let value = match spec {
        Bson::Boolean(_) => Bson::DateTime(DateTime::now()),
        Bson::Document(type_spec) => match type_spec.get_str("$type") {
            Ok("date") => Bson::DateTime(DateTime::now()),
            Ok("timestamp") => {
                let now = DateTime::now().timestamp_millis() / 1000;
                Bson::Timestamp(Timestamp {
                    time: now as u32,
                    increment: 1,
                })
            }
            _ => {
                return Err(Error::bad_value(
                    "$currentDate $type must be 'date' or 'timestamp'",
                ))
            }
        },
        _ => {
            return Err(Error::bad_value(format!(
                "{} is not valid type for $currentDate. Please use a boolean ('true') or a \
                 $type expression ({{$type: 'timestamp/date'}})",
                bson_util::type_name(spec)
            )))
        }
    };
    let slot = path::resolve_slot(doc, target, CreateMode::CreatePad)?
        .ok_or_else(|| Error::internal("unresolvable $currentDate target"))?;
    slot.set(value);
    Ok(())
}

/// Fetches the array slot an array operator targets, creating it for `create = true`.
/// Returns `Ok(None)` when the field is missing and creation is disabled.
fn array_slot<'a>(
    doc: &'a mut Document,
    target: &str,
    create: bool,
) -> Result<Option<Slot<'a>>> {
    let mode = if create {
        CreateMode::Create
    } else {
        CreateMode::NoCreate
    };
    let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
    let slot = match path::resolve_slot(doc, target, mode)? {
        Some(slot) => slot,
        None => return Ok(None),
    };
    match slot.get() {
        None if !create => Ok(None),
        None => Ok(Some(slot)),
        Some(Bson::Array(_)) => Ok(Some(slot)),
        Some(other) => Err(Error::bad_value(format!(
            "The field '{}' must be an array but is of type {} in document {{_id: {}}}",
            target,
            bson_util::type_name(other),
            id,
        ))),
    }
}

fn apply_push(doc: &mut Document, target: &str, arg: &Bson) -> Result<()> {
    let (each, position, slice, sort) = parse_push_modifiers(arg)?;
    let mut slot = match array_slot(doc, target, true)? {
        Some(slot) => slot,
        None => return Ok(()),
    };
    if slot.get().is_none() {
        slot.set(Bson::Array(Vec::new()));
        slot = path::resolve_slot(doc, target, CreateMode::NoCreate)?
            .ok_or_else(|| Error::internal("lost $push target"))?;
    }
    let Some(Bson::Array(elements)) = slot.get_mut() else {
        return Err(Error::internal("lost $push array"));
    };

    // Insert, then sort, then slice.
    let insert_at = match position {
        None => elements.len(),
        Some(p) if p >= 0 => (p as usize).min(elements.len()),
        Some(p) => elements.len().saturating_sub(p.unsigned_abs() as usize),
    };
    for (offset, value) in each.into_iter().enumerate() {
        elements.insert(insert_at + offset, value);
    }
    if let Some(sort_spec) = sort {
        sort_elements(elements, &sort_spec)?;
    }
    if let Some(keep) = slice {
        apply_slice(elements, keep);
    }
    Ok(())
}

#[allow(clippy::type_complexity)]
fn parse_push_modifiers(
    arg: &Bson,
) -> Result<(Vec<Bson>, Option<i64>, Option<i64>, Option<Bson>)> {
    let modifiers = match arg {
        Bson::Document(doc) if doc.contains_key("$each") => doc,
        other => return Ok((vec![other.clone()], None, None, None)),
    };
    let mut each = Vec::new();
    let mut position = None;
    let mut slice = None;
    let mut sort = None;
    for (key, value) in modifiers {
        match key.as_str() {
            "$each" => {
                let items = value.as_array().ok_or_else(|| {
                    Error::bad_value("The argument to $each must be an array")
                })?;
                each = items.clone();
            }
            "$position" => {
                position = Some(bson_util::get_int(value).ok_or_else(|| {
                    Error::bad_value("The value for $position must be an integer")
                })?)
            }
            "$slice" => {
                slice = Some(bson_util::get_int(value).ok_or_else(|| {
                    Error::bad_value("The value for $slice must be an integer")
                })?)
            }
            "$sort" => sort = Some(value.clone()),
            unknown => {
                return Err(Error::bad_value(format!(
                    "Unrecognized clause in $push: {}",
                    unknown
                )))
            }
        }
    }
    Ok((each, position, slice, sort))
}

fn sort_elements(elements: &mut [Bson], spec: &Bson) -> Result<()> {
    match spec {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            let ascending = bson_util::as_f64(spec) == Some(1.0);
            if !ascending && bson_util::as_f64(spec) != Some(-1.0) {
                return Err(Error::bad_value("The $sort element value must be either 1 or -1"));
            }
            elements.sort_unstable_by(|a, b| {
                let ord = bson_util::cmp_bson(a, b);
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
            Ok(())
        }
        Bson::Document(fields) => {
            let spec: Vec<(String, bool)> = fields
                .iter()
                .map(|(field, dir)| {
                    match bson_util::get_int(dir) {
                        Some(1) => Ok((field.clone(), true)),
                        Some(-1) => Ok((field.clone(), false)),
                        _ => Err(Error::bad_value(
                            "The $sort element value must be either 1 or -1",
                        )),
                    }
                })
                .collect::<Result<_>>()?;
            elements.sort_unstable_by(|a, b| {
                for (field, ascending) in &spec {
                    let va = a
                        .as_document()
                        .and_then(|d| path::expr_get(d, field))
                        .unwrap_or(Bson::Null);
                    let vb = b
                        .as_document()
                        .and_then(|d| path::expr_get(d, field))
                        .unwrap_or(Bson::Null);
                    let ord = bson_util::cmp_bson(&va, &vb);
                    if ord != Ordering::Equal {
                        return if *ascending { ord } else { ord.reverse() };
                    }
                }
                Ordering::Equal
            });
            Ok(())
        }
        _ => Err(Error::bad_value(
            "The $sort is invalid: use 1/-1 to sort the whole element, or {field:1/-1} to sort by a field",
        )),
    }
}

fn apply_slice(elements: &mut Vec<Bson>, keep: i64) {
    if keep == 0 {
        elements.clear();
    } else if keep > 0 {
        elements.truncate(keep as usize);
    } else {
        let keep = keep.unsigned_abs() as usize;
        if elements.len() > keep {
            elements.drain(..elements.len() - keep);
        }
    }
}

fn apply_add_to_set(doc: &mut Document, target: &str, arg: &Bson) -> Result<()> {
    let additions: Vec<Bson> = match arg {
        Bson::Document(modifiers) if modifiers.contains_key("$each") => {
            let items = modifiers
                .get_array("$each")
                .map_err(|_| Error::bad_value("The argument to $each must be an array"))?;
            for key in modifiers.keys() {
                if key != "$each" {
                    return Err(Error::bad_value(format!(
                        "Found unexpected fields after $each in $addToSet: {}",
                        key
                    )));
                }
            }
            items.clone()
        }
        other => vec![other.clone()],
    };
    let mut slot = match array_slot(doc, target, true)? {
        Some(slot) => slot,
        None => return Ok(()),
    };
    if slot.get().is_none() {
        slot.set(Bson::Array(Vec::new()));
        slot = path::resolve_slot(doc, target, CreateMode::NoCreate)?
            .ok_or_else(|| Error::internal("lost $addToSet target"))?;
    }
    let Some(Bson::Array(elements)) = slot.get_mut() else {
        return Err(Error::internal("lost $addToSet array"));
    };
    for addition in additions {
        if !elements
            .iter()
            .any(|existing| bson_util::structural_eq(existing, &addition))
        {
            elements.push(addition);
        }
    }
    Ok(())
}

fn apply_pop(doc: &mut Document, target: &str, arg: &Bson) -> Result<()> {
    let from_front = match bson_util::get_int(arg) {
        Some(1) => false,
        Some(-1) => true,
        _ => {
            return Err(Error::failed_to_parse(format!(
                "Expected a number in: {}: {}",
                target, arg
            )))
        }
    };
    let mut slot = match array_slot(doc, target, false)? {
        Some(slot) => slot,
        None => return Ok(()),
    };
    if let Some(Bson::Array(elements)) = slot.get_mut() {
        if !elements.is_empty() {
            if from_front {
                elements.remove(0);
            } else {
                elements.pop();
            }
        }
    }
    Ok(())
}

fn apply_pull(doc: &mut Document, target: &str, arg: &Bson) -> Result<()> {
    let condition = ElementCondition::parse(arg)?;
    let mut slot = match array_slot(doc, target, false)? {
        Some(slot) => slot,
        None => return Ok(()),
    };
    if let Some(Bson::Array(elements)) = slot.get_mut() {
        let mut kept = Vec::with_capacity(elements.len());
        for element in elements.drain(..) {
            if !condition.matches(&element)? {
                kept.push(element);
            }
        }
        *elements = kept;
    }
    Ok(())
}

fn apply_pull_all(doc: &mut Document, target: &str, arg: &Bson) -> Result<()> {
    let values = arg
        .as_array()
        .ok_or_else(|| Error::bad_value("$pullAll requires an array argument"))?
        .clone();
    let mut slot = match array_slot(doc, target, false)? {
        Some(slot) => slot,
        None => return Ok(()),
    };
    if let Some(Bson::Array(elements)) = slot.get_mut() {
        elements.retain(|element| {
            !values
                .iter()
                .any(|value| bson_util::values_equal(element, value))
        });
    }
    Ok(())
}

fn apply_bit(doc: &mut Document, target: &str, arg: &Bson) -> Result<()> {
    let operations = arg.as_document().ok_or_else(|| {
        Error::bad_value(format!(
            "The $bit modifier is not compatible with a {}. You must pass in an embedded \
             document: {{$bit: {{field: {{and/or/xor: #}}}}}}",
            bson_util::type_name(arg)
        ))
    })?;
    let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
    let slot = path::resolve_slot(doc, target, CreateMode::Create)?
        .ok_or_else(|| Error::internal("unresolvable $bit target"))?;
    let mut current = match slot.get() {
        None => Bson::Int32(0),
        Some(existing @ (Bson::Int32(_) | Bson::Int64(_))) => existing.clone(),
        Some(other) => {
            return Err(Error::bad_value(format!(
                "Cannot apply $bit to a value of non-integral type. {{_id: {}}} has the \
                 field '{}' of non-integer type {}",
                id,
                target,
                bson_util::type_name(other)
            )))
        }
    };
    for (operation, operand) in operations {
        let operand = match operand {
            Bson::Int32(_) | Bson::Int64(_) => operand.clone(),
            _ => {
                return Err(Error::bad_value(format!(
                    "The $bit modifier field must be an Integer(32/64 bit): {}: {}",
                    operation, operand
                )))
            }
        };
        let (x, y) = (int_of(&current)?, int_of(&operand)?);
        let wide = matches!(current, Bson::Int64(_)) || matches!(operand, Bson::Int64(_));
        let result = match operation.as_str() {
            "and" => x & y,
            "or" => x | y,
            "xor" => x ^ y,
            unknown => {
                return Err(Error::bad_value(format!(
                    "The $bit modifier only supports 'and', 'or', and 'xor', not '{}'",
                    unknown
                )))
            }
        };
        current = if wide {
            Bson::Int64(result)
        } else {
            Bson::Int32(result as i32)
        };
    }
    slot.set(current);
    Ok(())
}

#[cfg(test)]
mod test {
    use bson::{bson, doc};

    use super::*;

    fn apply(doc: &mut Document, update: Document) -> Result<()> {
        let filter = doc! {};
        let ctx = UpdateContext {
            filter: &filter,
            upserting: false,
        };
        apply_operators(doc, &update, &ctx)
    }

    #[test]
    fn set_creates_nested_paths() {
        let mut doc = doc! { "_id": 1 };
        apply(&mut doc, doc! { "$set": { "a.b": 2, "c": 3 } }).unwrap();
        assert_eq!(doc, doc! { "_id": 1, "a": { "b": 2 }, "c": 3 });
    }

    #[test]
    fn set_same_value_is_not_a_modification() {
        let original = doc! { "_id": 1, "a": 5 };
        let mut updated = original.clone();
        apply(&mut updated, doc! { "$set": { "a": 5 } }).unwrap();
        assert!(!was_modified(&original, &updated));
    }

    #[test]
    fn inc_initializes_missing_and_rejects_non_numeric() {
        let mut doc = doc! { "_id": 1, "n": 5, "s": "x" };
        apply(&mut doc, doc! { "$inc": { "n": 2, "m": 3 } }).unwrap();
        assert_eq!(doc.get("n"), Some(&bson!(7)));
        assert_eq!(doc.get("m"), Some(&bson!(3)));
        assert!(apply(&mut doc, doc! { "$inc": { "s": 1 } }).is_err());
    }

    #[test]
    fn mul_missing_field_yields_zero() {
        let mut doc = doc! { "_id": 1 };
        apply(&mut doc, doc! { "$mul": { "n": 5 } }).unwrap();
        assert_eq!(doc.get("n"), Some(&bson!(0_i64)));
    }

    #[test]
    fn min_max() {
        let mut doc = doc! { "_id": 1, "lo": 5, "hi": 5 };
        apply(&mut doc, doc! { "$min": { "lo": 3 }, "$max": { "hi": 9 } }).unwrap();
        assert_eq!(doc.get("lo"), Some(&bson!(3)));
        assert_eq!(doc.get("hi"), Some(&bson!(9)));
        apply(&mut doc, doc! { "$min": { "lo": 7 } }).unwrap();
        assert_eq!(doc.get("lo"), Some(&bson!(3)));
    }

    #[test]
    fn rename_moves_values() {
        let mut doc = doc! { "_id": 1, "old": 7 };
        apply(&mut doc, doc! { "$rename": { "old": "new" } }).unwrap();
        assert_eq!(doc, doc! { "_id": 1, "new": 7 });
        // Missing source is a no-op.
        apply(&mut doc, doc! { "$rename": { "ghost": "dest" } }).unwrap();
        assert!(!doc.contains_key("dest"));
        assert!(apply(&mut doc, doc! { "$rename": { "new": 3 } }).is_err());
    }

    #[test]
    fn push_modifiers_run_insert_sort_slice() {
        let mut doc = doc! { "_id": 1, "scores": [80, 95] };
        apply(
            &mut doc,
            doc! { "$push": { "scores": {
                "$each": [70, 90],
                "$sort": -1,
                "$slice": 3,
            } } },
        )
        .unwrap();
        assert_eq!(doc.get("scores"), Some(&bson!([95, 90, 80])));
    }

    #[test]
    fn push_position_negative_counts_from_end() {
        let mut doc = doc! { "_id": 1, "a": [1, 2, 3, 4] };
        apply(
            &mut doc,
            doc! { "$push": { "a": { "$each": [9], "$position": -1 } } },
        )
        .unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([1, 2, 3, 9, 4])));
        // Overflowing negative position clamps to a prepend.
        let mut doc = doc! { "_id": 1, "a": [1, 2] };
        apply(
            &mut doc,
            doc! { "$push": { "a": { "$each": [9], "$position": -10 } } },
        )
        .unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([9, 1, 2])));
    }

    #[test]
    fn push_slice_negative_keeps_tail() {
        let mut doc = doc! { "_id": 1, "a": [1, 2, 3] };
        apply(
            &mut doc,
            doc! { "$push": { "a": { "$each": [4, 5], "$slice": -2 } } },
        )
        .unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([4, 5])));
        let mut doc = doc! { "_id": 1, "a": [1, 2] };
        apply(&mut doc, doc! { "$push": { "a": { "$each": [], "$slice": 0 } } }).unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([])));
    }

    #[test]
    fn push_sort_by_subfield() {
        let mut doc = doc! { "_id": 1, "quizzes": [ { "score": 9 }, { "score": 4 } ] };
        apply(
            &mut doc,
            doc! { "$push": { "quizzes": { "$each": [ { "score": 7 } ], "$sort": { "score": 1 } } } },
        )
        .unwrap();
        assert_eq!(
            doc.get("quizzes"),
            Some(&bson!([{ "score": 4 }, { "score": 7 }, { "score": 9 }]))
        );
    }

    #[test]
    fn add_to_set_dedups_under_engine_equality() {
        let mut doc = doc! { "_id": 1, "tags": ["a"] };
        apply(
            &mut doc,
            doc! { "$addToSet": { "tags": { "$each": ["a", "b", "b"] } } },
        )
        .unwrap();
        assert_eq!(doc.get("tags"), Some(&bson!(["a", "b"])));
        // Idempotent when re-applied.
        let before = doc.clone();
        apply(&mut doc, doc! { "$addToSet": { "tags": "b" } }).unwrap();
        assert!(!was_modified(&before, &doc));
    }

    #[test]
    fn pop_front_and_back() {
        let mut doc = doc! { "_id": 1, "a": [1, 2, 3] };
        apply(&mut doc, doc! { "$pop": { "a": 1 } }).unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([1, 2])));
        apply(&mut doc, doc! { "$pop": { "a": -1 } }).unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([2])));
        assert!(apply(&mut doc, doc! { "$pop": { "a": 5 } }).is_err());
    }

    #[test]
    fn pull_with_condition_and_literal() {
        let mut doc = doc! { "_id": 1, "scores": [85, 92, 78, 95] };
        apply(&mut doc, doc! { "$pull": { "scores": { "$gte": 90 } } }).unwrap();
        assert_eq!(doc.get("scores"), Some(&bson!([85, 78])));

        let mut doc = doc! { "_id": 1, "fruit": [ { "name": "apple" }, { "name": "pear" } ] };
        apply(&mut doc, doc! { "$pull": { "fruit": { "name": "apple" } } }).unwrap();
        assert_eq!(doc.get("fruit"), Some(&bson!([{ "name": "pear" }])));
    }

    #[test]
    fn pull_all_is_literal_only() {
        let mut doc = doc! { "_id": 1, "a": [1, 2, 3, 2] };
        apply(&mut doc, doc! { "$pullAll": { "a": [2, 3] } }).unwrap();
        assert_eq!(doc.get("a"), Some(&bson!([1])));
    }

    #[test]
    fn bit_operations_apply_in_document_order() {
        let mut doc = doc! { "_id": 1, "flags": 13 };
        apply(&mut doc, doc! { "$bit": { "flags": { "and": 10, "or": 1 } } }).unwrap();
        assert_eq!(doc.get("flags"), Some(&bson!(9)));
        // Missing field starts from zero.
        apply(&mut doc, doc! { "$bit": { "fresh": { "or": 5 } } }).unwrap();
        assert_eq!(doc.get("fresh"), Some(&bson!(5)));
    }

    #[test]
    fn conflicting_operators_are_rejected() {
        let mut doc = doc! { "_id": 1, "a": { "b": 1 } };
        let err = apply(
            &mut doc,
            doc! { "$set": { "a.b": 2 }, "$unset": { "a": 1 } },
        )
        .unwrap_err();
        assert_eq!(err.code(), Some(code::CONFLICTING_UPDATE_OPERATORS));
    }

    #[test]
    fn positional_operator_uses_filter_match() {
        let mut doc = doc! { "_id": 1, "grades": [85, 80, 90] };
        let filter = doc! { "grades": 80 };
        let ctx = UpdateContext {
            filter: &filter,
            upserting: false,
        };
        apply_operators(&mut doc, &doc! { "$set": { "grades.$": 82 } }, &ctx).unwrap();
        assert_eq!(doc.get("grades"), Some(&bson!([85, 82, 90])));
    }

    #[test]
    fn replacement_preserves_id() {
        let mut doc = doc! { "_id": 7, "a": 1 };
        apply_replacement(&mut doc, &doc! { "b": 2 }).unwrap();
        assert_eq!(doc, doc! { "_id": 7, "b": 2 });
        assert!(apply_replacement(&mut doc, &doc! { "_id": 8, "c": 1 }).is_err());
    }

    #[test]
    fn upsert_seed_merges_equalities_then_operators() {
        let filter = doc! { "code": "abc", "qty": { "$gt": 1 } };
        let fragments = crate::matcher::Matcher::new(&filter)
            .unwrap()
            .equality_fragments();
        let seed = build_upsert(
            fragments,
            &doc! { "$set": { "qty": 10 }, "$setOnInsert": { "origin": "upsert" } },
            UpdateDocKind::Operators,
            &filter,
        )
        .unwrap();
        assert_eq!(seed.get("code"), Some(&bson!("abc")));
        assert_eq!(seed.get("qty"), Some(&bson!(10)));
        assert_eq!(seed.get("origin"), Some(&bson!("upsert")));
        assert!(matches!(seed.get("_id"), Some(Bson::ObjectId(_))));
        assert_eq!(seed.keys().next().map(String::as_str), Some("_id"));
    }
}
