//! The aggregation pipeline: stage executors, the projection engine (shared with `find`),
//! the sort executor, and the `$group` accumulators.
//!
//! Pipelines run over a materialized snapshot of the source collection. Stages that cross
//! collections (`$lookup`, `$unionWith`) take a snapshot of the foreign collection under
//! its read lock for the duration of the sub-pipeline.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use bson::{Bson, Document};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    bson_util::{self, OrderedBson},
    coll::Collection,
    db::Database,
    error::{code, Error, Result},
    expr::{self, ExprContext},
    geo,
    matcher::Matcher,
    path::{self, CreateMode},
};

/// Everything a pipeline execution threads through its stages.
pub(crate) struct ExecEnv<'a> {
    pub(crate) db: &'a Database,
    /// The source collection, when the pipeline runs over one (needed by `$geoNear`).
    pub(crate) source: Option<&'a Collection>,
    /// The generator behind `$rand` and `$sample`; seeded externally in tests.
    pub(crate) rng: RefCell<SmallRng>,
    /// Caller-supplied cancellation flag, polled between input records.
    pub(crate) cancel: Option<Arc<AtomicBool>>,
}

impl<'a> ExecEnv<'a> {
    pub(crate) fn new(
        db: &'a Database,
        source: Option<&'a Collection>,
        seed: Option<u64>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        ExecEnv {
            db,
            source,
            rng: RefCell::new(rng),
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(AtomicOrdering::Relaxed) => Err(Error::interrupted()),
            _ => Ok(()),
        }
    }
}

/// Runs `pipeline` over `docs`, returning the output documents.
pub(crate) fn run(
    env: &ExecEnv<'_>,
    mut docs: Vec<Document>,
    pipeline: &[Document],
) -> Result<Vec<Document>> {
    for (position, stage) in pipeline.iter().enumerate() {
        env.check_cancelled()?;
        let (name, spec) = single_stage(stage)?;
        if name == "$geoNear" && position != 0 {
            return Err(Error::bad_value(
                "$geoNear is only valid as the first stage in a pipeline",
            ));
        }
        docs = run_stage(env, name, spec, docs)?;
    }
    Ok(docs)
}

fn single_stage(stage: &Document) -> Result<(&str, &Bson)> {
    let mut iter = stage.iter();
    match (iter.next(), iter.next()) {
        (Some((name, spec)), None) => Ok((name.as_str(), spec)),
        _ => Err(Error::command(
            code::FAILED_TO_PARSE,
            "A pipeline stage specification object must contain exactly one field",
        )),
    }
}

fn run_stage(
    env: &ExecEnv<'_>,
    name: &str,
    spec: &Bson,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    match name {
        "$match" => stage_match(env, spec, docs),
        "$project" => stage_project(env, spec, docs),
        "$addFields" | "$set" => stage_add_fields(env, spec, docs),
        "$unset" => stage_unset(spec, docs),
        "$group" => stage_group(env, spec, docs),
        "$sort" => {
            let spec = require_doc(name, spec)?;
            let mut docs = docs;
            sort_documents(&mut docs, spec)?;
            Ok(docs)
        }
        "$limit" => {
            let n = stage_count_arg(name, spec)?;
            let mut docs = docs;
            docs.truncate(n as usize);
            Ok(docs)
        }
        "$skip" => {
            let n = stage_count_arg(name, spec)?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        "$unwind" => stage_unwind(spec, docs),
        "$lookup" => stage_lookup(env, spec, docs),
        "$replaceRoot" => {
            let spec = require_doc(name, spec)?;
            let new_root = spec
                .get("newRoot")
                .ok_or_else(|| Error::bad_value("$replaceRoot requires a 'newRoot'"))?;
            stage_replace_with(env, new_root, docs)
        }
        "$replaceWith" => stage_replace_with(env, spec, docs),
        "$count" => stage_count(spec, docs),
        "$facet" => stage_facet(env, spec, docs),
        "$bucket" => stage_bucket(env, spec, docs),
        "$bucketAuto" => stage_bucket_auto(env, spec, docs),
        "$sortByCount" => {
            let grouped = stage_group(
                env,
                &Bson::Document(bson::doc! { "_id": spec.clone(), "count": { "$sum": 1 } }),
                docs,
            )?;
            let mut grouped = grouped;
            sort_documents(&mut grouped, &bson::doc! { "count": -1 })?;
            Ok(grouped)
        }
        "$sample" => stage_sample(env, spec, docs),
        "$unionWith" => stage_union_with(env, spec, docs),
        "$geoNear" => stage_geo_near(env, spec, docs),
        "$out" | "$merge" => Err(Error::bad_value(format!(
            "{} is not supported by this deployment",
            name
        ))),
        unknown => Err(Error::command(
            code::FAILED_TO_PARSE,
            format!("Unrecognized pipeline stage name: '{}'", unknown),
        )),
    }
}

fn require_doc<'s>(name: &str, spec: &'s Bson) -> Result<&'s Document> {
    spec.as_document().ok_or_else(|| {
        Error::command(
            code::FAILED_TO_PARSE,
            format!("the {} stage specification must be an object", name),
        )
    })
}

fn stage_count_arg(name: &str, spec: &Bson) -> Result<i64> {
    match bson_util::get_int(spec) {
        Some(n) if n >= 0 => Ok(n),
        _ => Err(Error::bad_value(format!(
            "invalid argument to {} stage: expected a non-negative integer",
            name
        ))),
    }
}

fn expr_ctx<'a>(doc: &'a Document, env: &'a ExecEnv<'_>) -> ExprContext<'a> {
    ExprContext::with_rng(doc, &env.rng)
}

// ---------------------------------------------------------------------------
// $match
// ---------------------------------------------------------------------------

fn stage_match(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let filter = require_doc("$match", spec)?;
    let matcher = Matcher::new(filter)?;
    if matcher.near().is_some() {
        return Err(Error::bad_value(
            "$near is not allowed inside a $match stage; use $geoNear",
        ));
    }
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        env.check_cancelled()?;
        if matcher.matches(&doc)? {
            out.push(doc);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Projection (shared with find)
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ProjNode {
    Include,
    Exclude,
    Computed(Bson),
    Nested(BTreeMap<String, ProjNode>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProjMode {
    Inclusion,
    Exclusion,
}

/// A compiled projection document, usable for both `find` projections and `$project`.
#[derive(Debug)]
pub(crate) struct Projection {
    tree: BTreeMap<String, ProjNode>,
    mode: ProjMode,
    include_id: bool,
}

impl Projection {
    pub(crate) fn compile(spec: &Document) -> Result<Projection> {
        let mut mode = None;
        let mut include_id = true;
        let mut tree: BTreeMap<String, ProjNode> = BTreeMap::new();
        for (raw_path, value) in spec {
            let node = classify(value);
            if raw_path == "_id" {
                match node {
                    ProjNode::Exclude => {
                        include_id = false;
                        continue;
                    }
                    ProjNode::Include => continue,
                    _ => {}
                }
            }
            let this_mode = match node {
                ProjNode::Exclude => ProjMode::Exclusion,
                _ => ProjMode::Inclusion,
            };
            match mode {
                None => mode = Some(this_mode),
                Some(prev) if prev != this_mode => {
                    // Computed fields are only legal in inclusion mode.
                    return Err(Error::bad_value(format!(
                        "Cannot do {} of field {} in {} projection",
                        match this_mode {
                            ProjMode::Inclusion => "inclusion",
                            ProjMode::Exclusion => "exclusion",
                        },
                        raw_path,
                        match prev {
                            ProjMode::Inclusion => "inclusion",
                            ProjMode::Exclusion => "exclusion",
                        },
                    )));
                }
                _ => {}
            }
            insert_proj_node(&mut tree, raw_path, node)?;
        }
        Ok(Projection {
            tree,
            mode: mode.unwrap_or(ProjMode::Exclusion),
            include_id,
        })
    }

    pub(crate) fn apply(&self, doc: &Document, rng: &RefCell<SmallRng>) -> Result<Document> {
        let mut out = match self.mode {
            ProjMode::Inclusion => {
                let mut out = Document::new();
                if self.include_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id", id.clone());
                    }
                }
                project_include(doc, &self.tree, &mut out, doc, rng)?;
                out
            }
            ProjMode::Exclusion => {
                let mut out = doc.clone();
                project_exclude(&mut out, &self.tree);
                out
            }
        };
        if !self.include_id {
            out.remove("_id");
        }
        Ok(out)
    }
}

fn classify(value: &Bson) -> ProjNode {
    match value {
        Bson::Boolean(true) => ProjNode::Include,
        Bson::Boolean(false) => ProjNode::Exclude,
        other => match bson_util::as_f64(other) {
            Some(f) if f == 0.0 => ProjNode::Exclude,
            Some(_) => ProjNode::Include,
            None => ProjNode::Computed(other.clone()),
        },
    }
}

fn insert_proj_node(
    tree: &mut BTreeMap<String, ProjNode>,
    raw_path: &str,
    node: ProjNode,
) -> Result<()> {
    let mut current = tree;
    let segments: Vec<&str> = raw_path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            match current.insert((*segment).to_string(), node) {
                Some(_) => {
                    return Err(Error::bad_value(format!(
                        "Path collision at {}",
                        raw_path
                    )))
                }
                None => return Ok(()),
            }
        }
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| ProjNode::Nested(BTreeMap::new()));
        match entry {
            ProjNode::Nested(nested) => current = nested,
            _ => {
                return Err(Error::bad_value(format!(
                    "Path collision at {}",
                    raw_path
                )))
            }
        }
    }
    Ok(())
}

fn project_include(
    source: &Document,
    tree: &BTreeMap<String, ProjNode>,
    out: &mut Document,
    root: &Document,
    rng: &RefCell<SmallRng>,
) -> Result<()> {
    for (key, node) in tree {
        match node {
            ProjNode::Exclude => {}
            ProjNode::Include => {
                if let Some(value) = source.get(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
            ProjNode::Computed(expression) => {
                let value = expr::evaluate(expression, &ExprContext::with_rng(root, rng))?;
                if !matches!(value, Bson::Undefined) {
                    out.insert(key.clone(), value);
                }
            }
            ProjNode::Nested(nested) => match source.get(key) {
                Some(Bson::Document(sub)) => {
                    let mut sub_out = Document::new();
                    project_include(sub, nested, &mut sub_out, root, rng)?;
                    out.insert(key.clone(), Bson::Document(sub_out));
                }
                Some(Bson::Array(elements)) => {
                    let mut projected = Vec::new();
                    for element in elements {
                        if let Bson::Document(sub) = element {
                            let mut sub_out = Document::new();
                            project_include(sub, nested, &mut sub_out, root, rng)?;
                            projected.push(Bson::Document(sub_out));
                        }
                    }
                    out.insert(key.clone(), Bson::Array(projected));
                }
                _ => {}
            },
        }
    }
    Ok(())
}

fn project_exclude(doc: &mut Document, tree: &BTreeMap<String, ProjNode>) {
    for (key, node) in tree {
        match node {
            ProjNode::Exclude => {
                doc.remove(key);
            }
            ProjNode::Nested(nested) => match doc.get_mut(key) {
                Some(Bson::Document(sub)) => project_exclude(sub, nested),
                Some(Bson::Array(elements)) => {
                    for element in elements {
                        if let Bson::Document(sub) = element {
                            project_exclude(sub, nested);
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
}

fn stage_project(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let spec = require_doc("$project", spec)?;
    if spec.is_empty() {
        return Err(Error::bad_value("projection specification must have at least one field"));
    }
    let projection = Projection::compile(spec)?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        env.check_cancelled()?;
        out.push(projection.apply(&doc, &env.rng)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// $addFields / $unset / $replaceRoot
// ---------------------------------------------------------------------------

fn stage_add_fields(
    env: &ExecEnv<'_>,
    spec: &Bson,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    let fields = require_doc("$addFields", spec)?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        env.check_cancelled()?;
        let mut updated = doc.clone();
        for (raw_path, expression) in fields {
            let value = expr::evaluate(expression, &expr_ctx(&doc, env))?;
            match value {
                Bson::Undefined => {
                    if let Some(slot) =
                        path::resolve_slot(&mut updated, raw_path, CreateMode::NoCreate)?
                    {
                        slot.remove();
                    }
                }
                value => {
                    let slot = path::resolve_slot(&mut updated, raw_path, CreateMode::CreatePad)?
                        .ok_or_else(|| Error::internal("unresolvable $addFields path"))?;
                    slot.set(value);
                }
            }
        }
        out.push(updated);
    }
    Ok(out)
}

fn stage_unset(spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let paths: Vec<String> = match spec {
        Bson::String(single) => vec![single.clone()],
        Bson::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(String::from).ok_or_else(|| {
                    Error::bad_value("$unset specification must be a string or array of strings")
                })
            })
            .collect::<Result<_>>()?,
        _ => {
            return Err(Error::bad_value(
                "$unset specification must be a string or array of strings",
            ))
        }
    };
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        for unset_path in &paths {
            if let Some(slot) = path::resolve_slot(&mut doc, unset_path, CreateMode::NoCreate)? {
                slot.remove();
            }
        }
        out.push(doc);
    }
    Ok(out)
}

fn stage_replace_with(
    env: &ExecEnv<'_>,
    expression: &Bson,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        env.check_cancelled()?;
        let value = expr::evaluate(expression, &expr_ctx(&doc, env))?;
        match value {
            Bson::Document(new_root) => out.push(new_root),
            other => {
                return Err(Error::bad_value(format!(
                    "'newRoot' expression must evaluate to an object, but resulting value \
                     was: {}",
                    other
                )))
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Sort (shared with find)
// ---------------------------------------------------------------------------

/// The sort key of one document along one component: the array-aware least (ascending) or
/// greatest (descending) leaf value. The empty array keys as undefined, which places it
/// before null in the total order.
pub(crate) fn sort_key(doc: &Document, sort_path: &str, ascending: bool) -> Bson {
    let mut leaves: Vec<Bson> = Vec::new();
    for candidate in path::collect(doc, sort_path) {
        match candidate.as_present() {
            None => leaves.push(Bson::Null),
            Some(Bson::Array(elements)) => {
                if elements.is_empty() {
                    leaves.push(Bson::Undefined);
                } else {
                    leaves.extend(elements.iter().cloned());
                }
            }
            Some(value) => leaves.push(value.clone()),
        }
    }
    let mut best: Option<Bson> = None;
    for leaf in leaves {
        best = Some(match best {
            None => leaf,
            Some(current) => {
                let ord = bson_util::cmp_bson(&leaf, &current);
                if (ascending && ord == Ordering::Less)
                    || (!ascending && ord == Ordering::Greater)
                {
                    leaf
                } else {
                    current
                }
            }
        });
    }
    best.unwrap_or(Bson::Null)
}

/// Parses a `{path: 1 | -1, ...}` sort specification into (path, ascending) pairs.
pub(crate) fn sort_components(spec: &Document) -> Result<Vec<(String, bool)>> {
    if spec.is_empty() {
        return Err(Error::bad_value("$sort stage must have at least one sort key"));
    }
    spec.iter()
        .map(|(sort_path, direction)| match bson_util::get_int(direction) {
            Some(1) => Ok((sort_path.clone(), true)),
            Some(-1) => Ok((sort_path.clone(), false)),
            _ => Err(Error::bad_value(format!(
                "Illegal key in $sort specification: {}: {}",
                sort_path, direction
            ))),
        })
        .collect()
}

/// Sorts documents by a `{path: 1 | -1, ...}` specification. The sort is unstable:
/// documents with equal keys may appear in any order.
pub(crate) fn sort_documents(docs: &mut Vec<Document>, spec: &Document) -> Result<()> {
    let components = sort_components(spec)?;
    let mut keyed: Vec<(Vec<Bson>, Document)> = docs
        .drain(..)
        .map(|doc| {
            let keys = components
                .iter()
                .map(|(sort_path, ascending)| sort_key(&doc, sort_path, *ascending))
                .collect();
            (keys, doc)
        })
        .collect();
    keyed.sort_unstable_by(|(keys_a, _), (keys_b, _)| {
        for ((key_a, key_b), (_, ascending)) in
            keys_a.iter().zip(keys_b.iter()).zip(components.iter())
        {
            let ord = bson_util::cmp_bson(key_a, key_b);
            if ord != Ordering::Equal {
                return if *ascending { ord } else { ord.reverse() };
            }
        }
        Ordering::Equal
    });
    docs.extend(keyed.into_iter().map(|(_, doc)| doc));
    Ok(())
}

// ---------------------------------------------------------------------------
// $group and friends
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Acc {
    Sum { int: Option<i64>, float: f64 },
    Avg { sum: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Option<Bson>),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
    StdDev { samp: bool, values: Vec<f64> },
    MergeObjects(Document),
    Count(i64),
}

impl Acc {
    fn new(op: &str) -> Result<Acc> {
        Ok(match op {
            "$sum" => Acc::Sum {
                int: Some(0),
                float: 0.0,
            },
            "$avg" => Acc::Avg { sum: 0.0, count: 0 },
            "$min" => Acc::Min(None),
            "$max" => Acc::Max(None),
            "$first" => Acc::First(None),
            "$last" => Acc::Last(None),
            "$push" => Acc::Push(Vec::new()),
            "$addToSet" => Acc::AddToSet(Vec::new()),
            "$stdDevPop" => Acc::StdDev {
                samp: false,
                values: Vec::new(),
            },
            "$stdDevSamp" => Acc::StdDev {
                samp: true,
                values: Vec::new(),
            },
            "$mergeObjects" => Acc::MergeObjects(Document::new()),
            "$count" => Acc::Count(0),
            unknown => {
                return Err(Error::command(
                    code::FAILED_TO_PARSE,
                    format!("unknown group operator '{}'", unknown),
                ))
            }
        })
    }

    fn update(&mut self, value: Bson) -> Result<()> {
        match self {
            Acc::Sum { int, float } => {
                // Non-numeric inputs are ignored.
                if let Some(f) = bson_util::as_f64(&value) {
                    *float += f;
                    *int = match (*int, bson_util::get_int(&value)) {
                        (Some(acc), Some(i)) if !matches!(value, Bson::Double(_)) => {
                            acc.checked_add(i)
                        }
                        _ => None,
                    };
                }
            }
            Acc::Avg { sum, count } => {
                if let Some(f) = bson_util::as_f64(&value) {
                    *sum += f;
                    *count += 1;
                }
            }
            Acc::Min(best) => {
                if !matches!(value, Bson::Null | Bson::Undefined) {
                    let replace = match best {
                        None => true,
                        Some(current) => bson_util::cmp_bson(&value, current) == Ordering::Less,
                    };
                    if replace {
                        *best = Some(value);
                    }
                }
            }
            Acc::Max(best) => {
                if !matches!(value, Bson::Null | Bson::Undefined) {
                    let replace = match best {
                        None => true,
                        Some(current) => {
                            bson_util::cmp_bson(&value, current) == Ordering::Greater
                        }
                    };
                    if replace {
                        *best = Some(value);
                    }
                }
            }
            Acc::First(first) => {
                if first.is_none() {
                    *first = Some(normalize_null(value));
                }
            }
            Acc::Last(last) => *last = Some(normalize_null(value)),
            Acc::Push(values) => {
                if !matches!(value, Bson::Undefined) {
                    values.push(value);
                }
            }
            Acc::AddToSet(values) => {
                if !matches!(value, Bson::Undefined)
                    && !values
                        .iter()
                        .any(|existing| bson_util::structural_eq(existing, &value))
                {
                    values.push(value);
                }
            }
            Acc::StdDev { values, .. } => {
                if let Some(f) = bson_util::as_f64(&value) {
                    values.push(f);
                }
            }
            Acc::MergeObjects(merged) => match value {
                Bson::Null | Bson::Undefined => {}
                Bson::Document(doc) => {
                    for (key, field) in doc {
                        merged.insert(key, field);
                    }
                }
                other => {
                    return Err(Error::type_mismatch(format!(
                        "$mergeObjects requires object inputs, but input is of type {}",
                        bson_util::type_name(&other)
                    )))
                }
            },
            Acc::Count(count) => *count += 1,
        }
        Ok(())
    }

    fn finalize(self) -> Bson {
        match self {
            Acc::Sum { int, float } => match int {
                Some(i) => {
                    if let Ok(narrow) = i32::try_from(i) {
                        Bson::Int32(narrow)
                    } else {
                        Bson::Int64(i)
                    }
                }
                None => Bson::Double(float),
            },
            Acc::Avg { sum, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(sum / count as f64)
                }
            }
            Acc::Min(best) | Acc::Max(best) => best.unwrap_or(Bson::Null),
            Acc::First(value) | Acc::Last(value) => value.unwrap_or(Bson::Null),
            Acc::Push(values) | Acc::AddToSet(values) => Bson::Array(values),
            Acc::StdDev { samp, values } => {
                let n = values.len() as f64;
                if values.is_empty() || (samp && values.len() < 2) {
                    return Bson::Null;
                }
                let mean = values.iter().sum::<f64>() / n;
                let denominator = if samp { n - 1.0 } else { n };
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / denominator;
                Bson::Double(variance.sqrt())
            }
            Acc::MergeObjects(merged) => Bson::Document(merged),
            Acc::Count(count) => {
                if let Ok(narrow) = i32::try_from(count) {
                    Bson::Int32(narrow)
                } else {
                    Bson::Int64(count)
                }
            }
        }
    }
}

fn normalize_null(value: Bson) -> Bson {
    match value {
        Bson::Undefined => Bson::Null,
        other => other,
    }
}

fn stage_group(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let spec = require_doc("$group", spec)?;
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| Error::bad_value("a group specification must include an _id"))?;
    let mut accumulator_specs: Vec<(String, String, Bson)> = Vec::new();
    for (field, accumulator) in spec {
        if field == "_id" {
            continue;
        }
        let accumulator = accumulator.as_document().ok_or_else(|| {
            Error::command(
                code::FAILED_TO_PARSE,
                format!("The field '{}' must be an accumulator object", field),
            )
        })?;
        let (op, argument) = match (accumulator.iter().next(), accumulator.len()) {
            (Some((op, argument)), 1) => (op.clone(), argument.clone()),
            _ => {
                return Err(Error::command(
                    code::FAILED_TO_PARSE,
                    format!(
                        "The field '{}' must specify one accumulator",
                        field
                    ),
                ))
            }
        };
        // Validate the operator name eagerly.
        Acc::new(&op)?;
        accumulator_specs.push((field.clone(), op, argument));
    }

    let mut groups: BTreeMap<OrderedBson, Vec<Acc>> = BTreeMap::new();
    for doc in docs {
        env.check_cancelled()?;
        let ctx = expr_ctx(&doc, env);
        let key = OrderedBson(normalize_null(expr::evaluate(key_expr, &ctx)?));
        let fresh: Vec<Acc> = accumulator_specs
            .iter()
            .map(|(_, op, _)| Acc::new(op))
            .collect::<Result<_>>()?;
        let accs = groups.entry(key).or_insert(fresh);
        for ((_, op, argument), acc) in accumulator_specs.iter().zip(accs.iter_mut()) {
            let value = match op.as_str() {
                "$count" => Bson::Int32(1),
                _ => expr::evaluate(argument, &ctx)?,
            };
            acc.update(value)?;
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, accs) in groups {
        let mut group_doc = Document::new();
        group_doc.insert("_id", key.0);
        for ((field, _, _), acc) in accumulator_specs.iter().zip(accs) {
            group_doc.insert(field.clone(), acc.finalize());
        }
        out.push(group_doc);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// $unwind
// ---------------------------------------------------------------------------

fn stage_unwind(spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let (raw_path, include_index, preserve_empty) = match spec {
        Bson::String(field_path) => (field_path.clone(), None, false),
        Bson::Document(options) => {
            let field_path = options
                .get_str("path")
                .map_err(|_| Error::bad_value("$unwind requires a 'path' string"))?
                .to_string();
            let include_index = options
                .get_str("includeArrayIndex")
                .ok()
                .map(String::from);
            let preserve_empty = options
                .get_bool("preserveNullAndEmptyArrays")
                .unwrap_or(false);
            (field_path, include_index, preserve_empty)
        }
        _ => {
            return Err(Error::bad_value(
                "expected either a string or an object as specification for $unwind stage",
            ))
        }
    };
    let unwind_path = raw_path.strip_prefix('$').ok_or_else(|| {
        Error::command(
            code::FAILED_TO_PARSE,
            "path option to $unwind stage should be prefixed with a '$'",
        )
    })?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let value = path::collect(&doc, unwind_path)
            .into_iter()
            .find_map(|candidate| candidate.as_present().cloned());
        match value {
            Some(Bson::Array(elements)) if !elements.is_empty() => {
                for (position, element) in elements.into_iter().enumerate() {
                    let mut unwound = doc.clone();
                    let slot =
                        path::resolve_slot(&mut unwound, unwind_path, CreateMode::CreatePad)?
                            .ok_or_else(|| Error::internal("unresolvable $unwind path"))?;
                    slot.set(element);
                    if let Some(index_field) = &include_index {
                        let slot = path::resolve_slot(
                            &mut unwound,
                            index_field,
                            CreateMode::CreatePad,
                        )?
                        .ok_or_else(|| Error::internal("unresolvable includeArrayIndex"))?;
                        slot.set(Bson::Int64(position as i64));
                    }
                    out.push(unwound);
                }
            }
            // Missing, null and the empty array drop the document unless preserved.
            None | Some(Bson::Null) | Some(Bson::Array(_)) => {
                if preserve_empty {
                    let mut kept = doc.clone();
                    if let Some(slot) =
                        path::resolve_slot(&mut kept, unwind_path, CreateMode::NoCreate)?
                    {
                        if matches!(slot.get(), Some(Bson::Array(_))) {
                            slot.remove();
                        }
                    }
                    if let Some(index_field) = &include_index {
                        let slot = path::resolve_slot(
                            &mut kept,
                            index_field,
                            CreateMode::CreatePad,
                        )?
                        .ok_or_else(|| Error::internal("unresolvable includeArrayIndex"))?;
                        slot.set(Bson::Null);
                    }
                    out.push(kept);
                }
            }
            // A non-array value passes through as a single element.
            Some(_) => {
                let mut kept = doc.clone();
                if let Some(index_field) = &include_index {
                    let slot =
                        path::resolve_slot(&mut kept, index_field, CreateMode::CreatePad)?
                            .ok_or_else(|| Error::internal("unresolvable includeArrayIndex"))?;
                    slot.set(Bson::Null);
                }
                out.push(kept);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// $lookup / $unionWith
// ---------------------------------------------------------------------------

fn stage_lookup(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let spec = require_doc("$lookup", spec)?;
    let from = spec
        .get_str("from")
        .map_err(|_| Error::bad_value("$lookup requires a 'from' collection name"))?;
    let as_field = spec
        .get_str("as")
        .map_err(|_| Error::bad_value("$lookup requires an 'as' field"))?;
    let foreign_docs = env.db.snapshot(from);

    let mut out = Vec::with_capacity(docs.len());
    if let Some(pipeline_spec) = spec.get("pipeline") {
        let pipeline: Vec<Document> = pipeline_as_documents(pipeline_spec)?;
        let let_vars = spec.get_document("let").cloned().unwrap_or_default();
        for doc in docs {
            env.check_cancelled()?;
            let ctx = expr_ctx(&doc, env);
            let mut bound: Vec<(String, Bson)> = Vec::with_capacity(let_vars.len());
            for (name, expression) in &let_vars {
                bound.push((name.clone(), normalize_null(expr::evaluate(expression, &ctx)?)));
            }
            let substituted: Vec<Document> = pipeline
                .iter()
                .map(|stage| substitute_vars_doc(stage, &bound))
                .collect();
            let joined = run(env, foreign_docs.clone(), &substituted)?;
            let mut updated = doc;
            updated.insert(as_field, Bson::Array(joined.into_iter().map(Bson::Document).collect()));
            out.push(updated);
        }
        return Ok(out);
    }

    let local_field = spec
        .get_str("localField")
        .map_err(|_| Error::bad_value("$lookup requires a 'localField'"))?;
    let foreign_field = spec
        .get_str("foreignField")
        .map_err(|_| Error::bad_value("$lookup requires a 'foreignField'"))?;
    // Precompute foreign leaf values once.
    let foreign_keyed: Vec<(Vec<Bson>, &Document)> = foreign_docs
        .iter()
        .map(|foreign| (equality_leaves(foreign, foreign_field), foreign))
        .collect();
    for doc in docs {
        env.check_cancelled()?;
        let local_values = equality_leaves(&doc, local_field);
        let mut joined = Vec::new();
        for (foreign_values, foreign) in &foreign_keyed {
            let matched = local_values.iter().any(|local| {
                foreign_values
                    .iter()
                    .any(|foreign_value| bson_util::values_equal(local, foreign_value))
            });
            if matched {
                joined.push(Bson::Document((*foreign).clone()));
            }
        }
        let mut updated = doc;
        updated.insert(as_field, Bson::Array(joined));
        out.push(updated);
    }
    Ok(out)
}

/// The values a field contributes to a `$lookup` equality: the leaves after array
/// flattening, with missing represented as null.
fn equality_leaves(doc: &Document, field_path: &str) -> Vec<Bson> {
    let mut leaves = Vec::new();
    for candidate in path::collect(doc, field_path) {
        match candidate.as_present() {
            None => leaves.push(Bson::Null),
            Some(Bson::Array(elements)) if !elements.is_empty() => {
                leaves.extend(elements.iter().cloned())
            }
            Some(value) => leaves.push(value.clone()),
        }
    }
    if leaves.is_empty() {
        leaves.push(Bson::Null);
    }
    leaves
}

fn pipeline_as_documents(spec: &Bson) -> Result<Vec<Document>> {
    spec.as_array()
        .ok_or_else(|| Error::bad_value("'pipeline' must be an array of stages"))?
        .iter()
        .map(|stage| {
            stage
                .as_document()
                .cloned()
                .ok_or_else(|| Error::bad_value("pipeline stages must be documents"))
        })
        .collect()
}

/// Replaces `$$name` references for the given bound variables with `$literal` values so a
/// sub-pipeline can run without carrying a variable scope.
fn substitute_vars_doc(doc: &Document, vars: &[(String, Bson)]) -> Document {
    doc.iter()
        .map(|(key, value)| (key.clone(), substitute_vars(value, vars)))
        .collect()
}

fn substitute_vars(value: &Bson, vars: &[(String, Bson)]) -> Bson {
    match value {
        Bson::String(s) if s.starts_with("$$") => {
            let reference = &s[2..];
            let (name, rest) = match reference.split_once('.') {
                Some((name, rest)) => (name, Some(rest)),
                None => (reference, None),
            };
            match vars.iter().find(|(bound, _)| bound == name) {
                Some((_, bound_value)) => {
                    let resolved = match (rest, bound_value) {
                        (None, value) => value.clone(),
                        (Some(sub_path), Bson::Document(doc)) => {
                            path::expr_get(doc, sub_path).unwrap_or(Bson::Null)
                        }
                        _ => Bson::Null,
                    };
                    Bson::Document(bson::doc! { "$literal": resolved })
                }
                None => value.clone(),
            }
        }
        Bson::Document(doc) => Bson::Document(substitute_vars_doc(doc, vars)),
        Bson::Array(items) => Bson::Array(
            items
                .iter()
                .map(|item| substitute_vars(item, vars))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn stage_union_with(
    env: &ExecEnv<'_>,
    spec: &Bson,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    let (coll_name, pipeline) = match spec {
        Bson::String(name) => (name.clone(), Vec::new()),
        Bson::Document(options) => {
            let name = options
                .get_str("coll")
                .map_err(|_| Error::bad_value("$unionWith requires a 'coll' name"))?
                .to_string();
            let pipeline = match options.get("pipeline") {
                Some(stages) => pipeline_as_documents(stages)?,
                None => Vec::new(),
            };
            (name, pipeline)
        }
        _ => {
            return Err(Error::bad_value(
                "the $unionWith stage specification must be an object or string",
            ))
        }
    };
    let foreign_docs = env.db.snapshot(&coll_name);
    let unioned = run(env, foreign_docs, &pipeline)?;
    let mut out = docs;
    out.extend(unioned);
    Ok(out)
}

// ---------------------------------------------------------------------------
// $count / $facet / $bucket / $bucketAuto / $sample
// ---------------------------------------------------------------------------

fn stage_count(spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let field = spec
        .as_str()
        .ok_or_else(|| Error::bad_value("the count field must be a non-empty string"))?;
    if field.is_empty() || field.starts_with('$') || field.contains('.') {
        return Err(Error::bad_value(
            "the count field must be a non-empty string that does not start with '$' or \
             contain '.'",
        ));
    }
    let count = docs.len() as i64;
    let mut result = Document::new();
    if let Ok(narrow) = i32::try_from(count) {
        result.insert(field, narrow);
    } else {
        result.insert(field, count);
    }
    Ok(vec![result])
}

fn stage_facet(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let facets = require_doc("$facet", spec)?;
    if facets.is_empty() {
        return Err(Error::bad_value("$facet must have at least one sub-pipeline"));
    }
    let mut result = Document::new();
    for (name, sub_pipeline) in facets {
        let stages = pipeline_as_documents(sub_pipeline)?;
        for stage in &stages {
            if let Ok((stage_name, _)) = single_stage(stage) {
                if matches!(stage_name, "$facet" | "$out" | "$merge" | "$geoNear") {
                    return Err(Error::bad_value(format!(
                        "{} is not allowed to be used within a $facet stage",
                        stage_name
                    )));
                }
            }
        }
        let facet_docs = run(env, docs.clone(), &stages)?;
        result.insert(
            name.clone(),
            Bson::Array(facet_docs.into_iter().map(Bson::Document).collect()),
        );
    }
    Ok(vec![result])
}

fn stage_bucket(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let spec = require_doc("$bucket", spec)?;
    let group_by = spec
        .get("groupBy")
        .ok_or_else(|| Error::bad_value("$bucket requires a 'groupBy' expression"))?;
    let boundaries = spec
        .get_array("boundaries")
        .map_err(|_| Error::bad_value("$bucket requires a 'boundaries' array"))?;
    if boundaries.len() < 2 {
        return Err(Error::bad_value(
            "the $bucket 'boundaries' field must have at least 2 values",
        ));
    }
    for pair in boundaries.windows(2) {
        if bson_util::cmp_bson(&pair[0], &pair[1]) != Ordering::Less {
            return Err(Error::bad_value(
                "the 'boundaries' option to $bucket must be sorted in ascending order",
            ));
        }
    }
    let default = spec.get("default");
    let output = spec
        .get_document("output")
        .cloned()
        .unwrap_or(bson::doc! { "count": { "$sum": 1 } });

    // bucket id -> docs
    let mut buckets: BTreeMap<OrderedBson, Vec<Document>> = BTreeMap::new();
    for doc in docs {
        env.check_cancelled()?;
        let value = expr::evaluate(group_by, &expr_ctx(&doc, env))?;
        let position = boundaries
            .windows(2)
            .position(|pair| {
                bson_util::cmp_bson(&value, &pair[0]) != Ordering::Less
                    && bson_util::cmp_bson(&value, &pair[1]) == Ordering::Less
            });
        let id = match position {
            Some(index) => boundaries[index].clone(),
            None => match default {
                Some(default_id) => default_id.clone(),
                None => {
                    return Err(Error::bad_value(format!(
                        "$bucket could not find a matching branch for an input, and no \
                         default was specified: {}",
                        value
                    )))
                }
            },
        };
        buckets.entry(OrderedBson(id)).or_default().push(doc);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (id, bucket_docs) in buckets {
        out.push(run_output_accumulators(env, id.0, &output, bucket_docs)?);
    }
    Ok(out)
}

fn run_output_accumulators(
    env: &ExecEnv<'_>,
    id: Bson,
    output: &Document,
    docs: Vec<Document>,
) -> Result<Document> {
    let mut group_spec = Document::new();
    group_spec.insert("_id", Bson::Null);
    for (field, acc) in output {
        group_spec.insert(field.clone(), acc.clone());
    }
    let mut grouped = stage_group(env, &Bson::Document(group_spec), docs)?;
    let mut result = grouped
        .pop()
        .unwrap_or_else(|| bson::doc! {});
    result.remove("_id");
    let mut with_id = Document::new();
    with_id.insert("_id", id);
    with_id.extend(result);
    Ok(with_id)
}

fn stage_bucket_auto(
    env: &ExecEnv<'_>,
    spec: &Bson,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    let spec = require_doc("$bucketAuto", spec)?;
    let group_by = spec
        .get("groupBy")
        .ok_or_else(|| Error::bad_value("$bucketAuto requires a 'groupBy' expression"))?;
    let bucket_count = spec
        .get("buckets")
        .and_then(bson_util::get_int)
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            Error::bad_value("the $bucketAuto 'buckets' field must be a positive integer")
        })?;
    let output = spec
        .get_document("output")
        .cloned()
        .unwrap_or(bson::doc! { "count": { "$sum": 1 } });

    let mut keyed: Vec<(Bson, Document)> = Vec::with_capacity(docs.len());
    for doc in docs {
        env.check_cancelled()?;
        let key = normalize_null(expr::evaluate(group_by, &expr_ctx(&doc, env))?);
        keyed.push((key, doc));
    }
    keyed.sort_by(|(a, _), (b, _)| bson_util::cmp_bson(a, b));
    if keyed.is_empty() {
        return Ok(Vec::new());
    }

    let total = keyed.len();
    let approx_size = total.div_ceil(bucket_count as usize);
    let mut buckets: Vec<(Bson, Bson, Vec<Document>)> = Vec::new();
    let mut position = 0;
    while position < total {
        let mut end = (position + approx_size).min(total);
        // Documents with equal keys stay in the same bucket.
        while end < total && bson_util::cmp_bson(&keyed[end - 1].0, &keyed[end].0).is_eq() {
            end += 1;
        }
        let min = keyed[position].0.clone();
        let max = if end < total {
            keyed[end].0.clone()
        } else {
            keyed[total - 1].0.clone()
        };
        let bucket_docs: Vec<Document> =
            keyed[position..end].iter().map(|(_, doc)| doc.clone()).collect();
        buckets.push((min, max, bucket_docs));
        position = end;
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (min, max, bucket_docs) in buckets {
        let id = bson::doc! { "min": min, "max": max };
        out.push(run_output_accumulators(env, Bson::Document(id), &output, bucket_docs)?);
    }
    Ok(out)
}

fn stage_sample(env: &ExecEnv<'_>, spec: &Bson, docs: Vec<Document>) -> Result<Vec<Document>> {
    let spec = require_doc("$sample", spec)?;
    let size = spec
        .get("size")
        .and_then(bson_util::get_int)
        .filter(|n| *n >= 0)
        .ok_or_else(|| Error::bad_value("size argument to $sample must be a non-negative number"))?
        as usize;
    if size == 0 {
        return Ok(Vec::new());
    }
    // Reservoir sampling over the input stream.
    let mut reservoir: Vec<Document> = Vec::with_capacity(size);
    let mut rng = env.rng.borrow_mut();
    for (seen, doc) in docs.into_iter().enumerate() {
        if reservoir.len() < size {
            reservoir.push(doc);
        } else {
            let slot = rng.random_range(0..=seen);
            if slot < size {
                reservoir[slot] = doc;
            }
        }
    }
    Ok(reservoir)
}

// ---------------------------------------------------------------------------
// $geoNear
// ---------------------------------------------------------------------------

fn stage_geo_near(
    env: &ExecEnv<'_>,
    spec: &Bson,
    docs: Vec<Document>,
) -> Result<Vec<Document>> {
    let spec = require_doc("$geoNear", spec)?;
    let source = env.source.ok_or_else(|| {
        Error::command(
            code::NO_QUERY_EXECUTION_PLANS,
            "$geoNear requires a geospatial index on the source collection",
        )
    })?;
    let key_hint = spec.get_str("key").ok();
    let (geo_field, kind): (String, crate::index::IndexKind) = source.geo_index_for(key_hint)?;
    let spherical = spec.get_bool("spherical").unwrap_or(false)
        || kind == crate::index::IndexKind::Geo2dSphere;

    let near_value = spec
        .get("near")
        .ok_or_else(|| Error::bad_value("$geoNear requires a 'near' option"))?;
    let origin = match near_value {
        Bson::Document(geometry) if geometry.contains_key("type") => {
            match geo::Geometry::parse(geometry)? {
                geo::Geometry::Point(point) => point,
                _ => return Err(Error::bad_value("$geoNear 'near' must be a Point")),
            }
        }
        other => geo::parse_point_like(other)
            .ok_or_else(|| Error::bad_value("$geoNear 'near' must be a point"))?,
    };
    let distance_field = spec
        .get_str("distanceField")
        .map_err(|_| Error::bad_value("$geoNear requires a 'distanceField'"))?;
    let multiplier = spec
        .get("distanceMultiplier")
        .and_then(bson_util::as_f64)
        .unwrap_or(1.0);
    let min_distance = spec.get("minDistance").and_then(bson_util::as_f64);
    let max_distance = spec.get("maxDistance").and_then(bson_util::as_f64);
    let include_locs = spec.get_str("includeLocs").ok();
    let query_matcher = match spec.get_document("query") {
        Ok(filter) => Some(Matcher::new(filter)?),
        Err(_) => None,
    };

    let near = geo::NearQuery {
        path: geo_field.to_string(),
        point: origin,
        spherical,
        min_distance,
        max_distance,
    };

    let mut measured: Vec<(f64, Document)> = Vec::new();
    for doc in docs {
        env.check_cancelled()?;
        if let Some(matcher) = &query_matcher {
            if !matcher.matches(&doc)? {
                continue;
            }
        }
        let Some(value) = path::collect(&doc, &geo_field)
            .into_iter()
            .find_map(|candidate| candidate.as_present().cloned())
        else {
            continue;
        };
        let Some(distance) = near.distance_to(&value) else {
            continue;
        };
        if !near.in_bounds(distance) {
            continue;
        }
        let mut updated = doc;
        let scaled = distance * multiplier;
        let slot = path::resolve_slot(&mut updated, distance_field, CreateMode::CreatePad)?
            .ok_or_else(|| Error::internal("unresolvable distanceField"))?;
        slot.set(Bson::Double(scaled));
        if let Some(locs_field) = include_locs {
            let slot = path::resolve_slot(&mut updated, locs_field, CreateMode::CreatePad)?
                .ok_or_else(|| Error::internal("unresolvable includeLocs field"))?;
            slot.set(value.clone());
        }
        measured.push((distance, updated));
    }
    measured.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Ok(measured.into_iter().map(|(_, doc)| doc).collect())
}
