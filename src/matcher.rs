//! Query predicate compilation and evaluation.
//!
//! A filter document compiles once into a tree of closed-dispatch nodes; evaluation runs
//! the tree against one document at a time. Compilation also extracts the pieces other
//! subsystems need from a filter: the `$near` component (distance-ordered execution), the
//! equality fragments (upsert seeding), and the per-field constraints (rule-based index
//! selection).

use bson::{Bson, Document};
use regex::Regex;

use crate::{
    bson_util::{self, OrderedBson},
    error::{Error, Result},
    expr,
    geo::{self, NearQuery},
    path::{self, CreateMode, PathValue},
};

/// A compiled query filter.
#[derive(Debug)]
pub(crate) struct Matcher {
    root: Node,
    near: Option<NearQuery>,
}

#[derive(Debug)]
pub(crate) enum Node {
    /// Matches every document (empty filter, empty `$and`).
    AlwaysTrue,
    /// Matches no document (empty `$or`).
    AlwaysFalse,
    And(Vec<Node>),
    Or(Vec<Node>),
    Nor(Vec<Node>),
    /// `$expr`: an aggregation expression evaluated per document for truthiness.
    Expr(Bson),
    Field(FieldNode),
}

#[derive(Debug)]
pub(crate) struct FieldNode {
    path: String,
    preds: Vec<Pred>,
}

#[derive(Debug)]
pub(crate) enum Pred {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>, Vec<Regex>),
    Nin(Vec<Bson>, Vec<Regex>),
    Exists(bool),
    Type(Vec<i32>),
    Mod(i64, i64),
    Regex(Regex),
    Size(usize),
    AllValues(Vec<Bson>),
    AllElemMatch(Vec<ElemMatch>),
    ElemMatch(ElemMatch),
    BitsAllSet(u64),
    BitsAllClear(u64),
    BitsAnySet(u64),
    BitsAnyClear(u64),
    Not(Vec<Pred>),
    GeoWithin(geo::WithinShape),
    GeoIntersects(geo::Geometry),
}

#[derive(Debug)]
pub(crate) enum ElemMatch {
    /// Operator-only argument applied directly to each element.
    Value(Vec<Pred>),
    /// Sub-filter matched against each document element.
    Query(Box<Node>),
}

/// A per-field summary the index selector consumes.
#[derive(Debug, Clone)]
pub(crate) struct FieldConstraint {
    pub(crate) path: String,
    pub(crate) kind: ConstraintKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ConstraintKind {
    Eq(Bson),
    In(Vec<Bson>),
    Range {
        min: Option<(Bson, bool)>,
        max: Option<(Bson, bool)>,
    },
}

/// How a filter may be served by indexes.
#[derive(Debug)]
pub(crate) enum AccessPlan {
    /// Full collection scan.
    Scan,
    /// One constraint set per `$or` clause (a single-element vector for plain filters);
    /// the final id set is the union over clauses.
    Clauses(Vec<Vec<FieldConstraint>>),
}

impl Matcher {
    /// Compiles a filter document. All shape validation happens here; evaluation cannot
    /// fail on operator shape.
    pub(crate) fn new(filter: &Document) -> Result<Matcher> {
        let mut near = None;
        let root = compile_document(filter, &mut near, true)?;
        Ok(Matcher { root, near })
    }

    /// Evaluates the filter against one document.
    pub(crate) fn matches(&self, doc: &Document) -> Result<bool> {
        eval_node(&self.root, doc)
    }

    /// The `$near`/`$nearSphere` component extracted at compile time, if any.
    pub(crate) fn near(&self) -> Option<&NearQuery> {
        self.near.as_ref()
    }

    /// The nested document of literal equality constraints, used to seed upserts.
    pub(crate) fn equality_fragments(&self) -> Document {
        let mut seed = Document::new();
        collect_equalities(&self.root, &mut seed);
        seed
    }

    /// The rule-based access plan for index selection.
    pub(crate) fn access_plan(&self) -> AccessPlan {
        match &self.root {
            Node::And(children) => {
                // A lone $or splits into per-clause accesses.
                if children.len() == 1 {
                    if let Node::Or(branches) = &children[0] {
                        let clauses: Vec<Vec<FieldConstraint>> =
                            branches.iter().map(constraints_of).collect();
                        if clauses.iter().all(|clause| !clause.is_empty()) {
                            return AccessPlan::Clauses(clauses);
                        }
                        return AccessPlan::Scan;
                    }
                }
                let constraints: Vec<FieldConstraint> = children.iter().flat_map(constraints_of).collect();
                if constraints.is_empty() {
                    AccessPlan::Scan
                } else {
                    AccessPlan::Clauses(vec![constraints])
                }
            }
            _ => AccessPlan::Scan,
        }
    }
}

fn constraints_of(node: &Node) -> Vec<FieldConstraint> {
    match node {
        Node::And(children) => children.iter().flat_map(constraints_of).collect(),
        Node::Field(field) => {
            let mut eq = None;
            let mut in_list = None;
            let mut min: Option<(Bson, bool)> = None;
            let mut max: Option<(Bson, bool)> = None;
            for pred in &field.preds {
                match pred {
                    Pred::Eq(value) => eq = Some(value.clone()),
                    Pred::In(values, regexes) if regexes.is_empty() => {
                        in_list = Some(values.clone())
                    }
                    Pred::Gt(value) => min = Some((value.clone(), false)),
                    Pred::Gte(value) => min = Some((value.clone(), true)),
                    Pred::Lt(value) => max = Some((value.clone(), false)),
                    Pred::Lte(value) => max = Some((value.clone(), true)),
                    _ => {}
                }
            }
            let kind = if let Some(value) = eq {
                // Whole-array equality cannot be answered from multikey entries.
                if matches!(value, Bson::Array(_)) {
                    return Vec::new();
                }
                ConstraintKind::Eq(value)
            } else if let Some(values) = in_list {
                if values.iter().any(|v| matches!(v, Bson::Array(_))) {
                    return Vec::new();
                }
                ConstraintKind::In(values)
            } else if min.is_some() || max.is_some() {
                ConstraintKind::Range { min, max }
            } else {
                return Vec::new();
            };
            vec![FieldConstraint {
                path: field.path.clone(),
                kind,
            }]
        }
        _ => Vec::new(),
    }
}

fn collect_equalities(node: &Node, seed: &mut Document) {
    match node {
        Node::And(children) => {
            for child in children {
                collect_equalities(child, seed);
            }
        }
        Node::Field(field) => {
            for pred in &field.preds {
                if let Pred::Eq(value) = pred {
                    if let Ok(Some(slot)) =
                        path::resolve_slot(seed, &field.path, CreateMode::Create)
                    {
                        slot.set(value.clone());
                    }
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

fn compile_document(
    filter: &Document,
    near: &mut Option<NearQuery>,
    allow_near: bool,
) -> Result<Node> {
    let mut nodes = Vec::new();
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let clauses = value.as_array().ok_or_else(|| {
                    Error::bad_value(format!("{} must be an array", key))
                })?;
                let mut children = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let clause_doc = clause.as_document().ok_or_else(|| {
                        Error::bad_value(format!("{} entries must be documents", key))
                    })?;
                    let allow = allow_near && key == "$and";
                    children.push(compile_document(clause_doc, near, allow)?);
                }
                nodes.push(match key.as_str() {
                    "$and" => {
                        if children.is_empty() {
                            Node::AlwaysTrue
                        } else {
                            Node::And(children)
                        }
                    }
                    "$or" => {
                        if children.is_empty() {
                            Node::AlwaysFalse
                        } else {
                            Node::Or(children)
                        }
                    }
                    _ => {
                        if children.is_empty() {
                            Node::AlwaysTrue
                        } else {
                            Node::Nor(children)
                        }
                    }
                });
            }
            "$expr" => nodes.push(Node::Expr(value.clone())),
            "$comment" => {}
            "$where" => {
                return Err(Error::bad_value(
                    "$where is not supported by this deployment",
                ))
            }
            "$text" => {
                return Err(Error::bad_value(
                    "$text is not supported by this deployment",
                ))
            }
            other if other.starts_with('$') => {
                return Err(Error::failed_to_parse(format!(
                    "unknown top level operator: {}",
                    other
                )))
            }
            field_path => {
                nodes.push(compile_field_clause(field_path, value, near, allow_near)?)
            }
        }
    }
    Ok(Node::And(nodes))
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|key| key.starts_with('$'))
}

fn compile_field_clause(
    field_path: &str,
    value: &Bson,
    near: &mut Option<NearQuery>,
    allow_near: bool,
) -> Result<Node> {
    let preds = match value {
        Bson::Document(operators) if is_operator_document(operators) => {
            if operators.contains_key("$near") || operators.contains_key("$nearSphere") {
                if !allow_near {
                    return Err(Error::bad_value(
                        "$near must be a top-level query expression",
                    ));
                }
                if near.is_some() {
                    return Err(Error::bad_value(
                        "only one $near predicate is allowed per query",
                    ));
                }
                *near = Some(NearQuery::parse(field_path, operators)?);
                compile_operators(operators, true)?
            } else {
                compile_operators(operators, false)?
            }
        }
        Bson::RegularExpression(regex) => {
            vec![Pred::Regex(build_regex(&regex.pattern, &regex.options)?)]
        }
        literal => vec![Pred::Eq(literal.clone())],
    };
    Ok(Node::Field(FieldNode {
        path: field_path.to_string(),
        preds,
    }))
}

fn compile_operators(operators: &Document, skip_near_keys: bool) -> Result<Vec<Pred>> {
    let mut preds = Vec::with_capacity(operators.len());
    for (op, arg) in operators {
        match op.as_str() {
            // Consumed by NearQuery::parse.
            "$near" | "$nearSphere" | "$minDistance" | "$maxDistance" if skip_near_keys => {}
            "$options" => {
                // Validated alongside $regex below.
                if !operators.contains_key("$regex") {
                    return Err(Error::bad_value("$options needs a $regex"));
                }
            }
            _ => preds.push(compile_operator(op, arg, operators)?),
        }
    }
    Ok(preds)
}

fn compile_operator(op: &str, arg: &Bson, operators: &Document) -> Result<Pred> {
    match op {
        "$eq" => Ok(Pred::Eq(arg.clone())),
        "$ne" => Ok(Pred::Ne(arg.clone())),
        "$gt" => Ok(Pred::Gt(arg.clone())),
        "$gte" => Ok(Pred::Gte(arg.clone())),
        "$lt" => Ok(Pred::Lt(arg.clone())),
        "$lte" => Ok(Pred::Lte(arg.clone())),
        "$in" | "$nin" => {
            let members = arg
                .as_array()
                .ok_or_else(|| Error::bad_value(format!("{} needs an array", op)))?;
            let mut values = Vec::new();
            let mut regexes = Vec::new();
            for member in members {
                match member {
                    Bson::RegularExpression(regex) => {
                        regexes.push(build_regex(&regex.pattern, &regex.options)?)
                    }
                    other => values.push(other.clone()),
                }
            }
            Ok(if op == "$in" {
                Pred::In(values, regexes)
            } else {
                Pred::Nin(values, regexes)
            })
        }
        "$exists" => Ok(Pred::Exists(truthy_arg(arg))),
        "$type" => {
            let mut codes = Vec::new();
            match arg {
                Bson::Array(specs) => {
                    for spec in specs {
                        codes.extend(bson_util::resolve_type_spec(spec)?);
                    }
                }
                single => codes.extend(bson_util::resolve_type_spec(single)?),
            }
            Ok(Pred::Type(codes))
        }
        "$mod" => {
            let parts = arg
                .as_array()
                .ok_or_else(|| Error::bad_value("malformed mod, needs to be an array"))?;
            if parts.len() != 2 {
                return Err(Error::bad_value(
                    "malformed mod, not enough elements",
                ));
            }
            let divisor = bson_util::as_f64(&parts[0])
                .ok_or_else(|| Error::bad_value("malformed mod, divisor not a number"))?
                .trunc() as i64;
            let remainder = bson_util::as_f64(&parts[1])
                .ok_or_else(|| Error::bad_value("malformed mod, remainder not a number"))?
                .trunc() as i64;
            if divisor == 0 {
                return Err(Error::bad_value("divisor cannot be 0"));
            }
            Ok(Pred::Mod(divisor, remainder))
        }
        "$regex" => {
            let options = operators.get_str("$options").unwrap_or_default();
            match arg {
                Bson::String(pattern) => Ok(Pred::Regex(build_regex(pattern, options)?)),
                Bson::RegularExpression(regex) => {
                    let merged = if options.is_empty() {
                        regex.options.clone()
                    } else {
                        options.to_string()
                    };
                    Ok(Pred::Regex(build_regex(&regex.pattern, &merged)?))
                }
                _ => Err(Error::bad_value("$regex has to be a string")),
            }
        }
        "$size" => match bson_util::get_int(arg) {
            Some(size) if size >= 0 => Ok(Pred::Size(size as usize)),
            Some(_) => Err(Error::bad_value("$size may not be negative")),
            None => Err(Error::bad_value("$size needs a number")),
        },
        "$all" => {
            let members = arg
                .as_array()
                .ok_or_else(|| Error::bad_value("$all needs an array"))?;
            let elem_match_members: Vec<&Document> = members
                .iter()
                .filter_map(|m| m.as_document())
                .filter(|d| d.contains_key("$elemMatch"))
                .collect();
            if elem_match_members.is_empty() {
                Ok(Pred::AllValues(members.clone()))
            } else if elem_match_members.len() == members.len() {
                let compiled = elem_match_members
                    .iter()
                    .map(|d| compile_elem_match(d.get("$elemMatch").unwrap()))
                    .collect::<Result<_>>()?;
                Ok(Pred::AllElemMatch(compiled))
            } else {
                Err(Error::bad_value(
                    "$all cannot mix $elemMatch with plain values",
                ))
            }
        }
        "$elemMatch" => Ok(Pred::ElemMatch(compile_elem_match(arg)?)),
        "$bitsAllSet" | "$bitsAllClear" | "$bitsAnySet" | "$bitsAnyClear" => {
            let mask = bits_mask(op, arg)?;
            Ok(match op {
                "$bitsAllSet" => Pred::BitsAllSet(mask),
                "$bitsAllClear" => Pred::BitsAllClear(mask),
                "$bitsAnySet" => Pred::BitsAnySet(mask),
                _ => Pred::BitsAnyClear(mask),
            })
        }
        "$not" => match arg {
            Bson::Document(inner) if is_operator_document(inner) => {
                let preds = compile_operators(inner, false)?;
                if preds.is_empty() {
                    return Err(Error::bad_value("$not cannot be empty"));
                }
                Ok(Pred::Not(preds))
            }
            Bson::RegularExpression(regex) => Ok(Pred::Not(vec![Pred::Regex(
                build_regex(&regex.pattern, &regex.options)?,
            )])),
            _ => Err(Error::bad_value("$not needs a regex or a document")),
        },
        "$geoWithin" => Ok(Pred::GeoWithin(geo::WithinShape::parse(arg)?)),
        "$geoIntersects" => {
            let doc = arg
                .as_document()
                .and_then(|d| d.get_document("$geometry").ok())
                .ok_or_else(|| Error::bad_value("$geoIntersects needs a $geometry"))?;
            Ok(Pred::GeoIntersects(geo::Geometry::parse(doc)?))
        }
        unknown => Err(Error::bad_value(format!(
            "unknown operator: {}",
            unknown
        ))),
    }
}

fn compile_elem_match(arg: &Bson) -> Result<ElemMatch> {
    let doc = arg
        .as_document()
        .ok_or_else(|| Error::bad_value("$elemMatch needs an Object"))?;
    if is_operator_document(doc) {
        Ok(ElemMatch::Value(compile_operators(doc, false)?))
    } else {
        let mut near = None;
        let node = compile_document(doc, &mut near, false)?;
        Ok(ElemMatch::Query(Box::new(node)))
    }
}

fn bits_mask(op: &str, arg: &Bson) -> Result<u64> {
    match arg {
        Bson::Array(positions) => {
            let mut mask = 0_u64;
            for position in positions {
                match bson_util::get_int(position) {
                    Some(bit) if (0..64).contains(&bit) => mask |= 1 << bit,
                    Some(bit) if bit >= 0 => {}
                    _ => {
                        return Err(Error::bad_value(format!(
                            "{} bit positions must be non-negative integers",
                            op
                        )))
                    }
                }
            }
            Ok(mask)
        }
        Bson::Binary(binary) => {
            let mut mask = 0_u64;
            for (i, byte) in binary.bytes.iter().take(8).enumerate() {
                mask |= (*byte as u64) << (8 * i);
            }
            Ok(mask)
        }
        other => match bson_util::get_int(other) {
            Some(mask) if mask >= 0 => Ok(mask as u64),
            Some(_) => Err(Error::bad_value(format!(
                "{} cannot take a negative mask",
                op
            ))),
            None => Err(Error::bad_value(format!(
                "{} takes a number, an array of bit positions, or binData",
                op
            ))),
        },
    }
}

pub(crate) fn build_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut builder = regex::RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            // The engine's regexes are unicode-aware already.
            'u' => {}
            other => {
                return Err(Error::bad_value(format!(
                    "invalid regex option: {}",
                    other
                )))
            }
        }
    }
    builder
        .build()
        .map_err(|e| Error::bad_value(format!("invalid regex: {}", e)))
}

fn truthy_arg(arg: &Bson) -> bool {
    match arg {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => bson_util::as_f64(other).map_or(true, |f| f != 0.0),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_node(node: &Node, doc: &Document) -> Result<bool> {
    match node {
        Node::AlwaysTrue => Ok(true),
        Node::AlwaysFalse => Ok(false),
        Node::And(children) => {
            for child in children {
                if !eval_node(child, doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Node::Or(children) => {
            for child in children {
                if eval_node(child, doc)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Node::Nor(children) => {
            for child in children {
                if eval_node(child, doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Node::Expr(expression) => {
            let value = expr::evaluate_for_match(expression, doc)?;
            Ok(expr::is_truthy(&value))
        }
        Node::Field(field) => {
            let candidates = path::collect(doc, &field.path);
            for pred in &field.preds {
                if !eval_pred(pred, &candidates)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

/// Applies `f` to each candidate (missing candidates appear as `None`) and, when the
/// candidate is an array, to each of its elements; true as soon as any application is.
fn any_candidate(
    candidates: &[PathValue],
    expand_arrays: bool,
    mut f: impl FnMut(Option<&Bson>) -> bool,
) -> bool {
    for candidate in candidates {
        match candidate.as_present() {
            None => {
                if f(None) {
                    return true;
                }
            }
            Some(value) => {
                if f(Some(value)) {
                    return true;
                }
                if expand_arrays {
                    if let Bson::Array(elements) = value {
                        if elements.iter().any(|element| f(Some(element))) {
                            return true;
                        }
                    }
                }
            }
        }
    }
    false
}

/// Whether `candidate` and `operand` live in the same comparison bracket for range
/// operators. Null compares only with null/missing; NaN pairs never compare.
fn comparable(candidate: Option<&Bson>, operand: &Bson) -> bool {
    let candidate = candidate.unwrap_or(&Bson::Null);
    if bson_util::is_nan(candidate) || bson_util::is_nan(operand) {
        return false;
    }
    bson_util::type_rank(candidate) == bson_util::type_rank(operand)
}

fn range_matches(
    candidates: &[PathValue],
    operand: &Bson,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    any_candidate(candidates, true, |candidate| {
        if !comparable(candidate, operand) {
            return false;
        }
        let value = candidate.unwrap_or(&Bson::Null);
        accept(bson_util::cmp_bson(value, operand))
    })
}

fn eq_matches(candidates: &[PathValue], operand: &Bson) -> bool {
    any_candidate(candidates, true, |candidate| match candidate {
        None => matches!(operand, Bson::Null),
        Some(value) => bson_util::values_equal(value, operand),
    })
}

fn regex_matches(candidates: &[PathValue], regex: &Regex) -> bool {
    any_candidate(candidates, true, |candidate| match candidate {
        Some(Bson::String(s)) => regex.is_match(s),
        _ => false,
    })
}

fn eval_pred(pred: &Pred, candidates: &[PathValue]) -> Result<bool> {
    Ok(match pred {
        Pred::Eq(operand) => eq_matches(candidates, operand),
        Pred::Ne(operand) => !eq_matches(candidates, operand),
        Pred::Gt(operand) => range_matches(candidates, operand, |ord| ord.is_gt()),
        Pred::Gte(operand) => range_matches(candidates, operand, |ord| ord.is_ge()),
        Pred::Lt(operand) => range_matches(candidates, operand, |ord| ord.is_lt()),
        Pred::Lte(operand) => range_matches(candidates, operand, |ord| ord.is_le()),
        Pred::In(values, regexes) => {
            values.iter().any(|value| eq_matches(candidates, value))
                || regexes.iter().any(|regex| regex_matches(candidates, regex))
        }
        Pred::Nin(values, regexes) => {
            !(values.iter().any(|value| eq_matches(candidates, value))
                || regexes.iter().any(|regex| regex_matches(candidates, regex)))
        }
        Pred::Exists(wanted) => {
            let exists = candidates.iter().any(|c| c.as_present().is_some());
            exists == *wanted
        }
        Pred::Type(codes) => any_candidate(candidates, true, |candidate| match candidate {
            Some(value) => codes.contains(&bson_util::type_code(value)),
            None => false,
        }),
        Pred::Mod(divisor, remainder) => any_candidate(candidates, true, |candidate| {
            match candidate.and_then(bson_util::as_f64) {
                Some(f) if f.is_finite() => (f.trunc() as i64) % divisor == *remainder,
                _ => false,
            }
        }),
        Pred::Regex(regex) => regex_matches(candidates, regex),
        Pred::Size(size) => candidates.iter().any(|candidate| {
            matches!(candidate.as_present(), Some(Bson::Array(elements)) if elements.len() == *size)
        }),
        Pred::AllValues(members) => {
            !members.is_empty()
                && members.iter().all(|member| eq_matches(candidates, member))
        }
        Pred::AllElemMatch(members) => {
            !members.is_empty()
                && members
                    .iter()
                    .map(|member| eval_elem_match(member, candidates))
                    .collect::<Result<Vec<bool>>>()?
                    .into_iter()
                    .all(|matched| matched)
        }
        Pred::ElemMatch(elem_match) => eval_elem_match(elem_match, candidates)?,
        Pred::BitsAllSet(mask) => bits_match(candidates, |bits| bits & mask == *mask),
        Pred::BitsAllClear(mask) => bits_match(candidates, |bits| bits & mask == 0),
        Pred::BitsAnySet(mask) => bits_match(candidates, |bits| bits & mask != 0),
        Pred::BitsAnyClear(mask) => bits_match(candidates, |bits| bits & mask != *mask),
        Pred::Not(inner) => {
            // Unlike $ne, $not never matches a missing field.
            if !candidates.iter().any(|c| c.as_present().is_some()) {
                return Ok(false);
            }
            for pred in inner {
                if !eval_pred(pred, candidates)? {
                    return Ok(true);
                }
            }
            false
        }
        Pred::GeoWithin(shape) => any_candidate(candidates, false, |candidate| {
            candidate.is_some_and(|value| {
                let geometries = geo::value_geometries(value);
                !geometries.is_empty()
                    && geometries.iter().all(|geometry| geo::within(geometry, shape))
            })
        }),
        Pred::GeoIntersects(geometry) => any_candidate(candidates, false, |candidate| {
            candidate.is_some_and(|value| {
                geo::value_geometries(value)
                    .iter()
                    .any(|stored| geo::intersects(stored, geometry))
            })
        }),
    })
}

fn bits_match(candidates: &[PathValue], test: impl Fn(u64) -> bool) -> bool {
    any_candidate(candidates, true, |candidate| {
        let Some(value) = candidate else {
            return false;
        };
        let bits = match value {
            Bson::Int32(i) => Some(*i as i64),
            Bson::Int64(i) => Some(*i),
            Bson::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        };
        bits.map(|b| test(b as u64)).unwrap_or(false)
    })
}

fn eval_elem_match(elem_match: &ElemMatch, candidates: &[PathValue]) -> Result<bool> {
    for candidate in candidates {
        let Some(Bson::Array(elements)) = candidate.as_present() else {
            continue;
        };
        for element in elements {
            let matched = match elem_match {
                ElemMatch::Value(preds) => {
                    let element_candidates = vec![PathValue::Present(element.clone())];
                    let mut all = true;
                    for pred in preds {
                        if !eval_pred(pred, &element_candidates)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                ElemMatch::Query(node) => match element {
                    Bson::Document(element_doc) => eval_node(node, element_doc)?,
                    _ => false,
                },
            };
            if matched {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// A condition over individual array elements, as `$pull` interprets its argument:
/// an operator document applies directly to the element, a plain document is a sub-filter
/// over document elements, and anything else is a literal equality.
#[derive(Debug)]
pub(crate) enum ElementCondition {
    Preds(Vec<Pred>),
    Query(Node),
    Literal(Bson),
}

impl ElementCondition {
    pub(crate) fn parse(arg: &Bson) -> Result<ElementCondition> {
        match arg {
            Bson::Document(doc) if is_operator_document(doc) => {
                Ok(ElementCondition::Preds(compile_operators(doc, false)?))
            }
            Bson::Document(doc) => {
                let mut near = None;
                Ok(ElementCondition::Query(compile_document(
                    doc, &mut near, false,
                )?))
            }
            literal => Ok(ElementCondition::Literal(literal.clone())),
        }
    }

    pub(crate) fn matches(&self, element: &Bson) -> Result<bool> {
        match self {
            ElementCondition::Literal(value) => Ok(bson_util::values_equal(element, value)),
            ElementCondition::Preds(preds) => {
                let candidates = vec![PathValue::Present(element.clone())];
                for pred in preds {
                    if !eval_pred(pred, &candidates)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ElementCondition::Query(node) => match element {
                Bson::Document(doc) => eval_node(node, doc),
                _ => Ok(false),
            },
        }
    }
}

// Used by the update engine to pick the element a positional `$` segment addresses.
pub(crate) fn first_matching_element_index(
    filter: &Document,
    array_path: &str,
    array: &[Bson],
) -> Result<Option<usize>> {
    // Find filter predicates scoped to the array path or below it.
    let prefix = format!("{}.", array_path);
    for (key, value) in filter {
        if key != array_path && !key.starts_with(&prefix) {
            continue;
        }
        let sub_path = key.strip_prefix(&prefix).unwrap_or("");
        for (index, element) in array.iter().enumerate() {
            let matched = if sub_path.is_empty() {
                let candidates = vec![PathValue::Present(element.clone())];
                match value {
                    Bson::Document(ops) if is_operator_document(ops) => {
                        let preds = compile_operators(ops, false)?;
                        let mut all = true;
                        for pred in &preds {
                            if !eval_pred(pred, &candidates)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    literal => eq_matches(&candidates, literal),
                }
            } else {
                match element {
                    Bson::Document(element_doc) => {
                        let mut near = None;
                        let sub_filter = bson::doc! { sub_path: value.clone() };
                        let node = compile_document(&sub_filter, &mut near, false)?;
                        eval_node(&node, element_doc)?
                    }
                    _ => false,
                }
            };
            if matched {
                return Ok(Some(index));
            }
        }
        return Ok(None);
    }
    Ok(None)
}

/// Deduplicates values under engine equality, preserving first-seen order. Shared by
/// `distinct` and `$addToSet`.
pub(crate) fn dedup_values(values: Vec<Bson>) -> Vec<Bson> {
    let mut seen: std::collections::BTreeSet<OrderedBson> = Default::default();
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if seen.insert(OrderedBson(value.clone())) {
            out.push(value);
        }
    }
    out
}
