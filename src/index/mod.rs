//! Secondary indexes: the public `IndexModel` specification plus the in-memory keyed
//! engine behind it.
//!
//! Non-geo indexes are ordered maps from key tuples to document-id sets; a multikey path
//! (one that resolves to an array) produces one entry per element. Geo indexes register
//! the indexed path so `$near`/`$geoNear` can verify a usable index exists; their
//! evaluation is a linear scan over candidates.

pub mod options;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson_util::{self, OrderedKey},
    error::{code, Error, Result},
    matcher::{ConstraintKind, FieldConstraint},
    path,
};
use self::options::IndexOptions;

/// Specifies the fields and options for an index.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IndexModel {
    /// Specifies the index's fields. For each field, specify a key-value pair in which
    /// the key is the name of the field to index and the value is the index type:
    /// `1`/`-1` for an ordered index, `"2d"` or `"2dsphere"` for a geospatial one.
    #[serde(rename = "key")]
    pub keys: Document,

    /// The options for the index.
    #[serde(flatten)]
    pub options: Option<IndexOptions>,
}

impl IndexModel {
    /// If the client did not specify a name, generate and set it. Otherwise, do nothing.
    pub(crate) fn update_name(&mut self) {
        if self
            .options
            .as_ref()
            .and_then(|o| o.name.as_ref())
            .is_none()
        {
            let key_names: Vec<String> = self
                .keys
                .iter()
                .map(|(k, v)| format!("{}_{}", k, direction_label(v)))
                .collect();
            self.options.get_or_insert_with(IndexOptions::default).name =
                Some(key_names.join("_"));
        }
    }

    pub(crate) fn get_name(&self) -> Option<String> {
        self.options.as_ref().and_then(|o| o.name.as_ref()).cloned()
    }

    pub(crate) fn is_unique(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.unique)
            .unwrap_or(false)
    }

    pub(crate) fn is_sparse(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.sparse)
            .unwrap_or(false)
    }
}

fn direction_label(value: &Bson) -> String {
    match value {
        Bson::String(kind) => kind.clone(),
        other => match bson_util::get_int(other) {
            Some(i) => i.to_string(),
            None => other.to_string(),
        },
    }
}

/// The kind of one index component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexKind {
    Ascending,
    Descending,
    Geo2d,
    Geo2dSphere,
}

impl IndexKind {
    fn parse(value: &Bson) -> Result<IndexKind> {
        match value {
            Bson::String(kind) => match kind.as_str() {
                "2d" => Ok(IndexKind::Geo2d),
                "2dsphere" => Ok(IndexKind::Geo2dSphere),
                other => Err(Error::command(
                    code::CANNOT_CREATE_INDEX,
                    format!("Unknown index plugin '{}'", other),
                )),
            },
            other => match bson_util::get_int(other) {
                Some(1) => Ok(IndexKind::Ascending),
                Some(-1) => Ok(IndexKind::Descending),
                _ => Err(Error::command(
                    code::CANNOT_CREATE_INDEX,
                    format!(
                        "Values in the index key pattern must be 1, -1, '2d' or \
                         '2dsphere'; found {}",
                        other
                    ),
                )),
            },
        }
    }

    fn is_geo(&self) -> bool {
        matches!(self, IndexKind::Geo2d | IndexKind::Geo2dSphere)
    }
}

/// One secondary index: the model it was created from plus its keyed entries.
#[derive(Debug)]
pub(crate) struct Index {
    model: IndexModel,
    components: Vec<(String, IndexKind)>,
    unique: bool,
    sparse: bool,
    entries: BTreeMap<OrderedKey, BTreeSet<u64>>,
}

impl Index {
    pub(crate) fn new(mut model: IndexModel) -> Result<Index> {
        model.update_name();
        if model.keys.is_empty() {
            return Err(Error::command(
                code::CANNOT_CREATE_INDEX,
                "Index keys cannot be empty",
            ));
        }
        let components = model
            .keys
            .iter()
            .map(|(path, value)| Ok((path.clone(), IndexKind::parse(value)?)))
            .collect::<Result<Vec<_>>>()?;
        let unique = model.is_unique();
        let sparse = model.is_sparse();
        Ok(Index {
            model,
            components,
            unique,
            sparse,
            entries: BTreeMap::new(),
        })
    }

    /// The implicit unique index every collection carries on `_id`.
    pub(crate) fn id_index() -> Index {
        let model = IndexModel::builder()
            .keys(bson::doc! { "_id": 1 })
            .options(Some(
                IndexOptions::builder()
                    .name(Some("_id_".to_string()))
                    .unique(Some(true))
                    .build(),
            ))
            .build();
        Index::new(model).expect("_id index spec is static")
    }

    pub(crate) fn name(&self) -> &str {
        self.model
            .options
            .as_ref()
            .and_then(|o| o.name.as_deref())
            .unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> &Document {
        &self.model.keys
    }

    pub(crate) fn is_unique(&self) -> bool {
        self.unique
    }

    /// The indexed path when this is a single-component geo index.
    pub(crate) fn geo_path(&self) -> Option<(&str, IndexKind)> {
        self.components
            .iter()
            .find(|(_, kind)| kind.is_geo())
            .map(|(path, kind)| (path.as_str(), *kind))
    }

    /// The index specification document as reported by `listIndexes`.
    pub(crate) fn spec(&self) -> Document {
        let mut spec = bson::doc! {
            "v": 2_i32,
            "key": self.model.keys.clone(),
            "name": self.name(),
        };
        if self.unique {
            spec.insert("unique", true);
        }
        if self.sparse {
            spec.insert("sparse", true);
        }
        if let Some(version) = self
            .model
            .options
            .as_ref()
            .and_then(|o| o.sphere_2d_index_version)
        {
            spec.insert("2dsphereIndexVersion", version);
        }
        spec
    }

    /// Whether `other` re-specifies this index. Same name and same keys is idempotent;
    /// same name with different keys is a conflict.
    pub(crate) fn same_name(&self, other: &IndexModel) -> bool {
        other.get_name().as_deref() == Some(self.name())
    }

    pub(crate) fn same_keys(&self, other: &IndexModel) -> bool {
        bson_util::documents_equal(&self.model.keys, &other.keys)
    }

    /// The key tuples `doc` projects into this index: the Cartesian expansion over the
    /// per-component candidate values. At most one component may be an array (multikey);
    /// two parallel arrays cannot be indexed.
    pub(crate) fn keys_for(&self, doc: &Document) -> Result<Vec<OrderedKey>> {
        if self.geo_path().is_some() {
            return Ok(Vec::new());
        }
        let mut per_component: Vec<Vec<Bson>> = Vec::with_capacity(self.components.len());
        let mut all_missing = true;
        let mut multikey_path: Option<&str> = None;
        for (component_path, _) in &self.components {
            let candidates = path::collect(doc, component_path);
            let mut values = Vec::new();
            let mut missing = true;
            let mut multi = candidates.len() > 1;
            for candidate in &candidates {
                match candidate.as_present() {
                    None => values.push(Bson::Null),
                    Some(Bson::Array(elements)) => {
                        missing = false;
                        multi = true;
                        if elements.is_empty() {
                            values.push(Bson::Undefined);
                        } else {
                            values.extend(elements.iter().cloned());
                        }
                    }
                    Some(value) => {
                        missing = false;
                        values.push(value.clone());
                    }
                }
            }
            if multi {
                match multikey_path {
                    None => multikey_path = Some(component_path),
                    Some(first) => {
                        return Err(Error::command(
                            code::CANNOT_CREATE_INDEX,
                            format!(
                                "cannot index parallel arrays [{}] [{}]",
                                component_path, first
                            ),
                        ))
                    }
                }
            }
            if !missing {
                all_missing = false;
            }
            if values.is_empty() {
                values.push(Bson::Null);
            }
            per_component.push(values);
        }
        if self.sparse && all_missing {
            return Ok(Vec::new());
        }
        let mut keys: Vec<Vec<Bson>> = vec![Vec::new()];
        for values in per_component {
            let mut next = Vec::with_capacity(keys.len() * values.len());
            for key in &keys {
                for value in &values {
                    let mut expanded = key.clone();
                    expanded.push(value.clone());
                    next.push(expanded);
                }
            }
            keys = next;
        }
        Ok(keys.into_iter().map(OrderedKey).collect())
    }

    /// Verifies that inserting `doc` (for document `id`) would not violate uniqueness.
    pub(crate) fn check_unique(
        &self,
        namespace: &str,
        id: u64,
        doc: &Document,
    ) -> Result<()> {
        if !self.unique {
            return Ok(());
        }
        for key in self.keys_for(doc)? {
            if let Some(holders) = self.entries.get(&key) {
                if holders.iter().any(|holder| *holder != id) {
                    return Err(self.duplicate_key_error(namespace, &key));
                }
            }
        }
        Ok(())
    }

    fn duplicate_key_error(&self, namespace: &str, key: &OrderedKey) -> Error {
        let mut dup = Document::new();
        for ((component_path, _), value) in self.components.iter().zip(key.0.iter()) {
            dup.insert(component_path.clone(), value.clone());
        }
        Error::duplicate_key(namespace, self.name(), &dup)
    }

    pub(crate) fn insert_doc(&mut self, namespace: &str, id: u64, doc: &Document) -> Result<()> {
        let keys = self.keys_for(doc)?;
        if self.unique {
            for key in &keys {
                if let Some(holders) = self.entries.get(key) {
                    if holders.iter().any(|holder| *holder != id) {
                        return Err(self.duplicate_key_error(namespace, key));
                    }
                }
            }
        }
        for key in keys {
            self.entries.entry(key).or_default().insert(id);
        }
        Ok(())
    }

    pub(crate) fn remove_doc(&mut self, id: u64, doc: &Document) {
        if let Ok(keys) = self.keys_for(doc) {
            for key in keys {
                if let Some(holders) = self.entries.get_mut(&key) {
                    holders.remove(&id);
                    if holders.is_empty() {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }

    /// Adds entries for `doc` without unique verification. Only valid after the batch
    /// has been checked with [`Index::simulate_updates`].
    pub(crate) fn add_unchecked(&mut self, id: u64, doc: &Document) {
        if let Ok(keys) = self.keys_for(doc) {
            for key in keys {
                self.entries.entry(key).or_default().insert(id);
            }
        }
    }

    /// Verifies that applying every planned `(id, old, new)` rewrite at once keeps this
    /// index free of duplicate keys, without mutating it. Checking the batch as a whole
    /// lets key tuples swap between documents within one command.
    pub(crate) fn simulate_updates(
        &self,
        namespace: &str,
        planned: &[(u64, Document, Document)],
    ) -> Result<()> {
        if !self.unique {
            // Still surface parallel-array errors before anything commits.
            for (_, _, new) in planned {
                self.keys_for(new)?;
            }
            return Ok(());
        }
        let mut sim = self.entries.clone();
        for (id, old, _) in planned {
            for key in self.keys_for(old)? {
                if let Some(holders) = sim.get_mut(&key) {
                    holders.remove(id);
                    if holders.is_empty() {
                        sim.remove(&key);
                    }
                }
            }
        }
        for (id, _, new) in planned {
            for key in self.keys_for(new)? {
                let holders = sim.entry(key.clone()).or_default();
                if holders.iter().any(|holder| holder != id) {
                    return Err(self.duplicate_key_error(namespace, &key));
                }
                holders.insert(*id);
            }
        }
        Ok(())
    }

    /// Applies the minimal entry diff for an update from `old` to `new`.
    pub(crate) fn update_doc(
        &mut self,
        namespace: &str,
        id: u64,
        old: &Document,
        new: &Document,
    ) -> Result<()> {
        let old_keys = self.keys_for(old)?;
        let new_keys = self.keys_for(new)?;
        let unchanged: Vec<bool> = new_keys
            .iter()
            .map(|key| old_keys.iter().any(|old_key| old_key == key))
            .collect();
        if self.unique {
            for (key, unchanged) in new_keys.iter().zip(unchanged.iter()) {
                if *unchanged {
                    continue;
                }
                if let Some(holders) = self.entries.get(key) {
                    if holders.iter().any(|holder| *holder != id) {
                        return Err(self.duplicate_key_error(namespace, key));
                    }
                }
            }
        }
        for old_key in &old_keys {
            if !new_keys.iter().any(|key| key == old_key) {
                if let Some(holders) = self.entries.get_mut(old_key) {
                    holders.remove(&id);
                    if holders.is_empty() {
                        self.entries.remove(old_key);
                    }
                }
            }
        }
        for key in new_keys {
            self.entries.entry(key).or_default().insert(id);
        }
        Ok(())
    }

    /// Produces the candidate id set for `constraints`, or `None` when this index cannot
    /// serve them. Candidates are a superset; residual predicates always re-filter.
    pub(crate) fn candidates(&self, constraints: &[FieldConstraint]) -> Option<BTreeSet<u64>> {
        if self.geo_path().is_some() {
            return None;
        }
        let lookup = |component_path: &str| {
            constraints
                .iter()
                .find(|constraint| constraint.path == component_path)
                .map(|constraint| &constraint.kind)
        };
        let mut prefixes: Vec<Vec<Bson>> = vec![Vec::new()];
        let mut range: Option<(Option<(Bson, bool)>, Option<(Bson, bool)>)> = None;
        let mut consumed = 0;
        for (component_path, _) in &self.components {
            match lookup(component_path) {
                Some(ConstraintKind::Eq(value)) => {
                    for prefix in &mut prefixes {
                        prefix.push(value.clone());
                    }
                    consumed += 1;
                }
                Some(ConstraintKind::In(values)) => {
                    if values.is_empty() {
                        return Some(BTreeSet::new());
                    }
                    let mut next = Vec::with_capacity(prefixes.len() * values.len());
                    for prefix in &prefixes {
                        for value in values {
                            let mut expanded = prefix.clone();
                            expanded.push(value.clone());
                            next.push(expanded);
                        }
                    }
                    prefixes = next;
                    consumed += 1;
                }
                Some(ConstraintKind::Range { min, max }) => {
                    range = Some((min.clone(), max.clone()));
                    consumed += 1;
                    break;
                }
                None => break,
            }
        }
        if consumed == 0 {
            return None;
        }
        let width = self.components.len();
        let mut ids = BTreeSet::new();
        for prefix in prefixes {
            let (lower, upper) = self.scan_bounds(&prefix, &range, width);
            // A contradictory range ($gt: 5, $lt: 3) scans nothing.
            let (lower_key, lower_excluded) = match &lower {
                Bound::Included(key) => (key, false),
                Bound::Excluded(key) => (key, true),
                Bound::Unbounded => unreachable!(),
            };
            let (upper_key, upper_excluded) = match &upper {
                Bound::Included(key) => (key, false),
                Bound::Excluded(key) => (key, true),
                Bound::Unbounded => unreachable!(),
            };
            match lower_key.cmp(upper_key) {
                std::cmp::Ordering::Greater => continue,
                std::cmp::Ordering::Equal if lower_excluded || upper_excluded => continue,
                _ => {}
            }
            for (_, holders) in self.entries.range((lower.clone(), upper.clone())) {
                ids.extend(holders.iter().copied());
            }
        }
        Some(ids)
    }

    #[allow(clippy::type_complexity)]
    fn scan_bounds(
        &self,
        prefix: &[Bson],
        range: &Option<(Option<(Bson, bool)>, Option<(Bson, bool)>)>,
        width: usize,
    ) -> (Bound<OrderedKey>, Bound<OrderedKey>) {
        let pad = |mut key: Vec<Bson>, fill: Bson| {
            while key.len() < width {
                key.push(fill.clone());
            }
            OrderedKey(key)
        };
        let (min, max) = match range {
            Some((min, max)) => (min.clone(), max.clone()),
            None => (None, None),
        };
        let lower = match min {
            Some((value, inclusive)) => {
                let mut key = prefix.to_vec();
                key.push(value);
                if inclusive {
                    Bound::Included(pad(key, Bson::MinKey))
                } else {
                    Bound::Excluded(pad(key, Bson::MaxKey))
                }
            }
            None => Bound::Included(pad(prefix.to_vec(), Bson::MinKey)),
        };
        let upper = match max {
            Some((value, inclusive)) => {
                let mut key = prefix.to_vec();
                key.push(value);
                if inclusive {
                    Bound::Included(pad(key, Bson::MaxKey))
                } else {
                    Bound::Excluded(pad(key, Bson::MinKey))
                }
            }
            None => Bound::Included(pad(prefix.to_vec(), Bson::MaxKey)),
        };
        (lower, upper)
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::matcher::Matcher;

    fn constraints(filter: Document) -> Vec<FieldConstraint> {
        match Matcher::new(&filter).unwrap().access_plan() {
            crate::matcher::AccessPlan::Clauses(mut clauses) => clauses.remove(0),
            crate::matcher::AccessPlan::Scan => Vec::new(),
        }
    }

    #[test]
    fn default_names_from_key_directions() {
        let mut model = IndexModel::builder()
            .keys(doc! { "lastName": 1, "firstName": 1 })
            .build();
        model.update_name();
        assert_eq!(model.get_name().unwrap(), "lastName_1_firstName_1");

        let mut geo = IndexModel::builder().keys(doc! { "loc": "2dsphere" }).build();
        geo.update_name();
        assert_eq!(geo.get_name().unwrap(), "loc_2dsphere");

        let mut mixed = IndexModel::builder().keys(doc! { "a": 1, "b": -1 }).build();
        mixed.update_name();
        assert_eq!(mixed.get_name().unwrap(), "a_1_b_-1");
    }

    #[test]
    fn multikey_expansion_and_parallel_array_rejection() {
        let index = Index::new(IndexModel::builder().keys(doc! { "tags": 1 }).build()).unwrap();
        let keys = index.keys_for(&doc! { "tags": ["x", "y"] }).unwrap();
        assert_eq!(keys.len(), 2);

        let compound =
            Index::new(IndexModel::builder().keys(doc! { "a": 1, "b": 1 }).build()).unwrap();
        let ok = compound
            .keys_for(&doc! { "a": [1, 2], "b": 3 })
            .unwrap();
        assert_eq!(ok.len(), 2);
        assert!(compound
            .keys_for(&doc! { "a": [1, 2], "b": [3, 4] })
            .is_err());
    }

    #[test]
    fn missing_fields_key_as_null_and_sparse_skips() {
        let dense = Index::new(IndexModel::builder().keys(doc! { "x": 1 }).build()).unwrap();
        let keys = dense.keys_for(&doc! { "y": 1 }).unwrap();
        assert_eq!(keys[0].0, vec![Bson::Null]);

        let sparse = Index::new(
            IndexModel::builder()
                .keys(doc! { "x": 1 })
                .options(Some(IndexOptions::builder().sparse(Some(true)).build()))
                .build(),
        )
        .unwrap();
        assert!(sparse.keys_for(&doc! { "y": 1 }).unwrap().is_empty());
        assert_eq!(sparse.keys_for(&doc! { "x": 5 }).unwrap().len(), 1);
    }

    #[test]
    fn unique_enforcement_excludes_self() {
        let mut index = Index::new(
            IndexModel::builder()
                .keys(doc! { "email": 1 })
                .options(Some(IndexOptions::builder().unique(Some(true)).build()))
                .build(),
        )
        .unwrap();
        index
            .insert_doc("db.users", 1, &doc! { "email": "a@x.io" })
            .unwrap();
        // Re-inserting the same doc id is not a conflict.
        index
            .insert_doc("db.users", 1, &doc! { "email": "a@x.io" })
            .unwrap();
        let err = index
            .insert_doc("db.users", 2, &doc! { "email": "a@x.io" })
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(err.message().unwrap().contains("email_1"));
    }

    #[test]
    fn update_applies_minimal_diff() {
        let mut index = Index::new(IndexModel::builder().keys(doc! { "n": 1 }).build()).unwrap();
        index.insert_doc("db.c", 1, &doc! { "n": 1 }).unwrap();
        index
            .update_doc("db.c", 1, &doc! { "n": 1 }, &doc! { "n": 2 })
            .unwrap();
        let found = index.candidates(&constraints(doc! { "n": 2 })).unwrap();
        assert!(found.contains(&1));
        let gone = index.candidates(&constraints(doc! { "n": 1 })).unwrap();
        assert!(gone.is_empty());
    }

    #[test]
    fn candidate_sets_for_eq_in_and_range() {
        let mut index =
            Index::new(IndexModel::builder().keys(doc! { "a": 1, "b": 1 }).build()).unwrap();
        for (id, a, b) in [(1, 1, 10), (2, 1, 20), (3, 2, 30), (4, 3, 40)] {
            index
                .insert_doc("db.c", id, &doc! { "a": a, "b": b })
                .unwrap();
        }
        let eq = index.candidates(&constraints(doc! { "a": 1 })).unwrap();
        assert_eq!(eq.into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let eq_range = index
            .candidates(&constraints(doc! { "a": 1, "b": { "$gt": 10 } }))
            .unwrap();
        assert_eq!(eq_range.into_iter().collect::<Vec<_>>(), vec![2]);

        let in_prefix = index
            .candidates(&constraints(doc! { "a": { "$in": [2, 3] } }))
            .unwrap();
        assert_eq!(in_prefix.into_iter().collect::<Vec<_>>(), vec![3, 4]);

        let range_first = index
            .candidates(&constraints(doc! { "a": { "$gte": 2 } }))
            .unwrap();
        assert_eq!(range_first.into_iter().collect::<Vec<_>>(), vec![3, 4]);

        // Constraint on a non-prefix component cannot use the index.
        assert!(index.candidates(&constraints(doc! { "b": 10 })).is_none());
    }

    #[test]
    fn empty_array_keys_as_undefined() {
        let index = Index::new(IndexModel::builder().keys(doc! { "a": 1 }).build()).unwrap();
        let keys = index.keys_for(&doc! { "a": [] }).unwrap();
        assert_eq!(keys[0].0, vec![Bson::Undefined]);
    }

    #[test]
    fn geo_indexes_register_but_do_not_key() {
        let index =
            Index::new(IndexModel::builder().keys(doc! { "loc": "2dsphere" }).build()).unwrap();
        assert!(matches!(
            index.geo_path(),
            Some(("loc", IndexKind::Geo2dSphere))
        ));
        assert!(index.keys_for(&doc! { "loc": [1, 2] }).unwrap().is_empty());
        assert!(index.candidates(&[]).is_none());
    }

    #[test]
    fn spec_reports_options() {
        let index = Index::new(
            IndexModel::builder()
                .keys(doc! { "email": 1 })
                .options(Some(IndexOptions::builder().unique(Some(true)).build()))
                .build(),
        )
        .unwrap();
        let spec = index.spec();
        assert_eq!(spec.get_str("name").unwrap(), "email_1");
        assert_eq!(spec.get_bool("unique").unwrap(), true);
        assert_eq!(spec.get_document("key").unwrap(), &doc! { "email": 1 });
    }

    #[test]
    fn id_index_is_unique_and_reserved() {
        let index = Index::id_index();
        assert_eq!(index.name(), "_id_");
        assert!(index.is_unique());
    }
}
