//! `Collection` is the central handle for collection-level operations: CRUD, cursors,
//! aggregation, and index DDL.
//!
//! Each collection owns its documents and indexes behind a single writer-exclusive lock;
//! readers and writers on distinct collections never contend. Documents live in an
//! insertion-ordered map from an internal monotone id, which is also what indexes and
//! cursor snapshots refer to.

pub mod options;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bson::{Bson, Document};
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    aggregate::{self, ExecEnv, Projection},
    bson_util::{self, UpdateDocKind},
    cursor::Cursor,
    db::Database,
    error::{
        code, convert_bulk_errors, BulkWriteError, BulkWriteFailure, Error, ErrorKind, Result,
    },
    geo::NearQuery,
    index::{Index, IndexKind, IndexModel},
    matcher::{self, AccessPlan, Matcher},
    path,
    results::{
        CreateIndexResult, CreateIndexesResult, DeleteResult, InsertManyResult, InsertOneResult,
        UpdateResult,
    },
    update::{self, UpdateContext},
};
use self::options::*;

/// The per-collection storage: documents in insertion order plus the index set.
pub(crate) struct Store {
    pub(crate) docs: BTreeMap<u64, Document>,
    next_id: u64,
    pub(crate) indexes: Vec<Index>,
}

impl Store {
    fn new() -> Store {
        Store {
            docs: BTreeMap::new(),
            next_id: 1,
            indexes: vec![Index::id_index()],
        }
    }

    fn insert_document(&mut self, namespace: &str, doc: Document) -> Result<u64> {
        let id = self.next_id;
        // Validate every index key first so a failure leaves no partial entries.
        for index in &self.indexes {
            index.keys_for(&doc)?;
            index.check_unique(namespace, id, &doc)?;
        }
        for index in &mut self.indexes {
            index.insert_doc(namespace, id, &doc)?;
        }
        self.docs.insert(id, doc);
        self.next_id += 1;
        Ok(id)
    }

    fn remove_document(&mut self, id: u64) -> Option<Document> {
        let doc = self.docs.remove(&id)?;
        for index in &mut self.indexes {
            index.remove_doc(id, &doc);
        }
        Some(doc)
    }

    /// The ids and current documents matching `matcher`, in natural (insertion) order.
    /// Uses the rule-based access plan for candidate generation, then re-filters.
    fn matched_pairs(&self, matcher: &Matcher) -> Result<Vec<(u64, Document)>> {
        let candidates: Option<BTreeSet<u64>> = match matcher.access_plan() {
            AccessPlan::Scan => None,
            AccessPlan::Clauses(clauses) => {
                let mut union = BTreeSet::new();
                let mut all_served = true;
                for clause in &clauses {
                    let served = self
                        .indexes
                        .iter()
                        .find_map(|index| index.candidates(clause));
                    match served {
                        Some(ids) => union.extend(ids),
                        None => {
                            all_served = false;
                            break;
                        }
                    }
                }
                if all_served {
                    Some(union)
                } else {
                    None
                }
            }
        };
        let mut pairs = Vec::new();
        match candidates {
            Some(ids) => {
                for id in ids {
                    if let Some(doc) = self.docs.get(&id) {
                        if matcher.matches(doc)? {
                            pairs.push((id, doc.clone()));
                        }
                    }
                }
            }
            None => {
                for (id, doc) in &self.docs {
                    if matcher.matches(doc)? {
                        pairs.push((*id, doc.clone()));
                    }
                }
            }
        }
        Ok(pairs)
    }

    fn geo_index_on(&self, geo_path: &str) -> Option<IndexKind> {
        self.indexes
            .iter()
            .filter_map(|index| index.geo_path())
            .find(|(indexed_path, _)| *indexed_path == geo_path)
            .map(|(_, kind)| kind)
    }
}

/// The shared state behind a [`Collection`] handle.
pub(crate) struct CollectionInner {
    pub(crate) name: String,
    pub(crate) store: RwLock<Store>,
}

impl CollectionInner {
    pub(crate) fn new(name: String) -> CollectionInner {
        CollectionInner {
            name,
            store: RwLock::new(Store::new()),
        }
    }

    /// Empties the collection, resetting storage and indexes. Live handles observe the
    /// drop.
    pub(crate) fn clear(&self) {
        *self.store.write() = Store::new();
    }

    /// Whether the collection has ever materialized: holds documents or user indexes.
    pub(crate) fn is_materialized(&self) -> bool {
        let store = self.store.read();
        !store.docs.is_empty() || store.indexes.len() > 1
    }
}

/// A handle to a collection in a [`Database`].
///
/// `Collection` uses an `Arc` internally, so it can be cloned and shared across threads
/// cheaply; all clones observe the same documents and indexes.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    pub(crate) inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace())
            .finish()
    }
}

impl Collection {
    pub(crate) fn new(db: Database, inner: Arc<CollectionInner>) -> Collection {
        Collection { db, inner }
    }

    /// The name of this collection.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The namespace of this collection: `<database>.<collection>`.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db.name(), self.inner.name)
    }

    /// The database this collection belongs to.
    pub fn database(&self) -> &Database {
        &self.db
    }

    // -- reads -------------------------------------------------------------

    /// Finds the documents matching `filter`.
    pub fn find(&self, filter: Document) -> Result<Cursor> {
        self.find_with_options(filter, FindOptions::default())
    }

    /// Finds the documents matching `filter` with the provided options.
    pub fn find_with_options(&self, filter: Document, options: FindOptions) -> Result<Cursor> {
        let matcher = Matcher::new(&filter)?;
        let store = self.inner.store.read();
        let mut pairs = match matcher.near() {
            Some(near) => self.near_pairs(&store, &matcher, near)?,
            None => store.matched_pairs(&matcher)?,
        };
        if let Some(sort) = &options.sort {
            sort_pairs(&mut pairs, sort)?;
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.unwrap_or(0);
        let cap = if limit == 0 {
            usize::MAX
        } else {
            limit.unsigned_abs() as usize
        };
        let ids: Vec<u64> = pairs
            .into_iter()
            .skip(skip)
            .take(cap)
            .map(|(id, _)| id)
            .collect();
        let projection = options
            .projection
            .as_ref()
            .map(Projection::compile)
            .transpose()?;
        drop(store);
        Ok(Cursor::snapshot(
            self.inner.clone(),
            ids,
            projection,
            options.cancellation,
        ))
    }

    /// Finds one document matching `filter`.
    pub fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        self.find_one_with_options(filter, FindOneOptions::default())
    }

    /// Finds one document matching `filter` with the provided options.
    pub fn find_one_with_options(
        &self,
        filter: Document,
        options: FindOneOptions,
    ) -> Result<Option<Document>> {
        let mut cursor = self.find_with_options(filter, options.into())?;
        cursor.next().transpose()
    }

    /// Counts the documents matching `filter`.
    pub fn count_documents(&self, filter: Document) -> Result<u64> {
        self.count_documents_with_options(filter, CountOptions::default())
    }

    /// Counts the documents matching `filter` with skip/limit applied.
    pub fn count_documents_with_options(
        &self,
        filter: Document,
        options: CountOptions,
    ) -> Result<u64> {
        let matcher = Matcher::new(&filter)?;
        let store = self.inner.store.read();
        let matched = store.matched_pairs(&matcher)?.len() as u64;
        let after_skip = matched.saturating_sub(options.skip.unwrap_or(0));
        Ok(match options.limit {
            Some(limit) => after_skip.min(limit),
            None => after_skip,
        })
    }

    /// An estimate of the number of documents in the collection. For this in-memory
    /// engine the estimate is exact.
    pub fn estimated_document_count(&self) -> Result<u64> {
        Ok(self.inner.store.read().docs.len() as u64)
    }

    /// The distinct values of `field_name` among the documents matching `filter`. Array
    /// values contribute their elements.
    pub fn distinct(&self, field_name: &str, filter: Document) -> Result<Vec<Bson>> {
        let matcher = Matcher::new(&filter)?;
        let store = self.inner.store.read();
        let mut values = Vec::new();
        for (_, doc) in store.matched_pairs(&matcher)? {
            for candidate in path::collect(&doc, field_name) {
                match candidate.as_present() {
                    None => {}
                    Some(Bson::Array(elements)) => values.extend(elements.iter().cloned()),
                    Some(value) => values.push(value.clone()),
                }
            }
        }
        Ok(matcher::dedup_values(values))
    }

    /// Runs an aggregation pipeline over this collection.
    pub fn aggregate(&self, pipeline: Vec<Document>) -> Result<Cursor> {
        self.aggregate_with_options(pipeline, AggregateOptions::default())
    }

    /// Runs an aggregation pipeline with the provided options.
    pub fn aggregate_with_options(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<Cursor> {
        let docs = self.snapshot_docs();
        let env = ExecEnv::new(
            &self.db,
            Some(self),
            options.seed,
            options.cancellation.clone(),
        );
        let out = aggregate::run(&env, docs, &pipeline)?;
        Ok(Cursor::materialized(out).with_cancellation(options.cancellation))
    }

    /// Clones the current document set in natural order.
    pub(crate) fn snapshot_docs(&self) -> Vec<Document> {
        self.inner.store.read_recursive().docs.values().cloned().collect()
    }

    // -- writes ------------------------------------------------------------

    /// Inserts a document. If the document is missing an `_id`, one is generated.
    pub fn insert_one(&self, doc: Document) -> Result<InsertOneResult> {
        self.insert_many(vec![doc], InsertManyOptions::default())
            .map(InsertOneResult::from_insert_many_result)
            .map_err(convert_bulk_errors)
    }

    /// Inserts the documents in order (or best-effort with `ordered: false`), reporting
    /// per-operation errors through a bulk write failure.
    pub fn insert_many(
        &self,
        docs: Vec<Document>,
        options: InsertManyOptions,
    ) -> Result<InsertManyResult> {
        let ordered = options.ordered.unwrap_or(true);
        let namespace = self.namespace();
        let mut store = self.inner.store.write();
        let mut inserted_ids: HashMap<usize, Bson> = HashMap::new();
        let mut failure = BulkWriteFailure::new();
        for (position, mut doc) in docs.into_iter().enumerate() {
            let id_value = bson_util::ensure_id(&mut doc);
            bson_util::id_first(&mut doc);
            let outcome = if matches!(id_value, Bson::Array(_)) {
                Err(Error::bad_value("The '_id' value cannot be of type array"))
            } else {
                store.insert_document(&namespace, doc)
            };
            match outcome {
                Ok(_) => {
                    inserted_ids.insert(position, id_value);
                }
                Err(error) => {
                    failure
                        .write_errors
                        .push(BulkWriteError::from_write_error(position, error));
                    if ordered {
                        break;
                    }
                }
            }
        }
        debug!(
            namespace = %namespace,
            inserted = inserted_ids.len(),
            errors = failure.write_errors.len(),
            "insert"
        );
        if failure.write_errors.is_empty() {
            Ok(InsertManyResult { inserted_ids })
        } else {
            failure.inserted_ids = inserted_ids;
            Err(ErrorKind::BulkWrite(failure).into())
        }
    }

    /// Updates the first document matching `query`.
    pub fn update_one(
        &self,
        query: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let execution = self.run_update(
            &query,
            &update,
            false,
            options.upsert.unwrap_or(false),
            None,
            false,
        )?;
        Ok(execution.into_update_result())
    }

    /// Updates every document matching `query`.
    pub fn update_many(
        &self,
        query: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let execution = self.run_update(
            &query,
            &update,
            true,
            options.upsert.unwrap_or(false),
            None,
            false,
        )?;
        Ok(execution.into_update_result())
    }

    /// Replaces the first document matching `query` with `replacement`.
    pub fn replace_one(
        &self,
        query: Document,
        replacement: Document,
        options: ReplaceOptions,
    ) -> Result<UpdateResult> {
        if bson_util::classify_update(&replacement)? != UpdateDocKind::Replacement {
            return Err(Error::invalid_argument(
                "replacement document must not contain update modifiers",
            ));
        }
        let execution = self.run_update(
            &query,
            &replacement,
            false,
            options.upsert.unwrap_or(false),
            None,
            true,
        )?;
        Ok(execution.into_update_result())
    }

    /// Deletes the first document matching `query`.
    pub fn delete_one(&self, query: Document) -> Result<DeleteResult> {
        self.run_delete(&query, false)
    }

    /// Deletes every document matching `query`.
    pub fn delete_many(&self, query: Document) -> Result<DeleteResult> {
        self.run_delete(&query, true)
    }

    /// Atomically finds the first document matching `filter` (under `sort`), applies
    /// `update`, and returns the pre- or post-image.
    pub fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        if bson_util::classify_update(&update)? != UpdateDocKind::Operators {
            return Err(Error::invalid_argument(
                "update document must only contain update modifiers",
            ));
        }
        let execution = self.run_update(
            &filter,
            &update,
            false,
            options.upsert.unwrap_or(false),
            options.sort.as_ref(),
            false,
        )?;
        let image = match options.return_document.unwrap_or_default() {
            ReturnDocument::Before => execution.pre_image,
            ReturnDocument::After => execution.post_image,
        };
        apply_optional_projection(image, options.projection.as_ref())
    }

    /// Atomically finds the first document matching `filter` (under `sort`), replaces
    /// it, and returns the pre- or post-image.
    pub fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndReplaceOptions,
    ) -> Result<Option<Document>> {
        if bson_util::classify_update(&replacement)? != UpdateDocKind::Replacement {
            return Err(Error::invalid_argument(
                "replacement document must not contain update modifiers",
            ));
        }
        let execution = self.run_update(
            &filter,
            &replacement,
            false,
            options.upsert.unwrap_or(false),
            options.sort.as_ref(),
            true,
        )?;
        let image = match options.return_document.unwrap_or_default() {
            ReturnDocument::Before => execution.pre_image,
            ReturnDocument::After => execution.post_image,
        };
        apply_optional_projection(image, options.projection.as_ref())
    }

    /// Atomically finds the first document matching `filter` (under `sort`), deletes it,
    /// and returns it.
    pub fn find_one_and_delete(
        &self,
        filter: Document,
        options: FindOneAndDeleteOptions,
    ) -> Result<Option<Document>> {
        let matcher = Matcher::new(&filter)?;
        let mut store = self.inner.store.write();
        let mut pairs = store.matched_pairs(&matcher)?;
        if let Some(sort) = &options.sort {
            sort_pairs(&mut pairs, sort)?;
        }
        let Some((id, doc)) = pairs.into_iter().next() else {
            return Ok(None);
        };
        store.remove_document(id);
        drop(store);
        apply_optional_projection(Some(doc), options.projection.as_ref())
    }

    // -- index DDL ----------------------------------------------------------

    /// Creates an index.
    pub fn create_index(&self, model: IndexModel) -> Result<CreateIndexResult> {
        self.create_indexes(vec![model])
            .map(CreateIndexesResult::into_create_index_result)
    }

    /// Creates the given indexes, building each from the current document set.
    /// Re-creating an identical specification is a no-op; reusing a name for a different
    /// key raises IndexKeySpecsConflict.
    pub fn create_indexes(&self, models: Vec<IndexModel>) -> Result<CreateIndexesResult> {
        let namespace = self.namespace();
        let mut store = self.inner.store.write();
        let mut index_names = Vec::with_capacity(models.len());
        for mut model in models {
            model.update_name();
            let name = model.get_name().unwrap_or_default();
            if let Some(existing) = store.indexes.iter().find(|index| index.same_name(&model)) {
                if existing.same_keys(&model) {
                    index_names.push(name);
                    continue;
                }
                return Err(Error::command(
                    code::INDEX_KEY_SPECS_CONFLICT,
                    format!(
                        "An existing index has the same name as the requested index: {}",
                        name
                    ),
                ));
            }
            let mut index = Index::new(model)?;
            for (id, doc) in &store.docs {
                index.insert_doc(&namespace, *id, doc)?;
            }
            debug!(namespace = %namespace, index = %name, "createIndexes");
            store.indexes.push(index);
            index_names.push(name);
        }
        Ok(CreateIndexesResult { index_names })
    }

    /// The index specifications, `_id_` first, as reported by `listIndexes`.
    pub fn list_index_specs(&self) -> Vec<Document> {
        self.inner
            .store
            .read()
            .indexes
            .iter()
            .map(Index::spec)
            .collect()
    }

    /// Returns a cursor over the index specifications.
    pub fn list_indexes(&self) -> Result<Cursor> {
        Ok(Cursor::materialized(self.list_index_specs()))
    }

    /// Drops the index with the given name. The `_id_` index cannot be dropped.
    pub fn drop_index(&self, name: impl AsRef<str>) -> Result<()> {
        let name = name.as_ref();
        if name == "*" {
            return self.drop_indexes();
        }
        if name == "_id_" {
            return Err(Error::command(
                code::INVALID_OPTIONS,
                "cannot drop _id index",
            ));
        }
        let mut store = self.inner.store.write();
        let position = store
            .indexes
            .iter()
            .position(|index| index.name() == name)
            .ok_or_else(|| {
                Error::command(
                    code::INDEX_NOT_FOUND,
                    format!("index not found with name [{}]", name),
                )
            })?;
        store.indexes.remove(position);
        debug!(namespace = %self.namespace(), index = %name, "dropIndexes");
        Ok(())
    }

    /// Drops the index with the given key specification.
    pub fn drop_index_by_key(&self, keys: &Document) -> Result<()> {
        let name = {
            let store = self.inner.store.read();
            store
                .indexes
                .iter()
                .find(|index| bson_util::documents_equal(index.keys(), keys))
                .map(|index| index.name().to_string())
        };
        match name {
            Some(name) => self.drop_index(name),
            None => Err(Error::command(
                code::INDEX_NOT_FOUND,
                format!("can't find index with key: {}", keys),
            )),
        }
    }

    /// Drops every index except `_id_`.
    pub fn drop_indexes(&self) -> Result<()> {
        let mut store = self.inner.store.write();
        store.indexes.retain(|index| index.name() == "_id_");
        Ok(())
    }

    /// Drops this collection, deleting its documents and indexes.
    pub fn drop(&self) -> Result<()> {
        self.db.drop_collection(&self.inner.name);
        Ok(())
    }

    /// Resolves the geo index `$geoNear` should use: the one on `key` when given, the
    /// single geo index otherwise.
    pub(crate) fn geo_index_for(&self, key: Option<&str>) -> Result<(String, IndexKind)> {
        let store = self.inner.store.read_recursive();
        let geo_indexes: Vec<(String, IndexKind)> = store
            .indexes
            .iter()
            .filter_map(|index| index.geo_path())
            .map(|(indexed_path, kind)| (indexed_path.to_string(), kind))
            .collect();
        match key {
            Some(key) => geo_indexes
                .into_iter()
                .find(|(indexed_path, _)| indexed_path == key)
                .ok_or_else(|| {
                    Error::command(
                        code::NO_QUERY_EXECUTION_PLANS,
                        format!("unable to find index for $geoNear query on field '{}'", key),
                    )
                }),
            None => match geo_indexes.len() {
                0 => Err(Error::command(
                    code::NO_QUERY_EXECUTION_PLANS,
                    "unable to find index for $geoNear query",
                )),
                1 => Ok(geo_indexes.into_iter().next().unwrap()),
                _ => Err(Error::bad_value(
                    "There is more than one geospatial index; unsure which to use. Use the \
                     'key' option to specify which index to use",
                )),
            },
        }
    }

    // -- internals ----------------------------------------------------------

    fn near_pairs(
        &self,
        store: &Store,
        matcher: &Matcher,
        near: &NearQuery,
    ) -> Result<Vec<(u64, Document)>> {
        if store.geo_index_on(&near.path).is_none() {
            return Err(Error::command(
                code::NO_QUERY_EXECUTION_PLANS,
                format!(
                    "error processing query: unable to find index for $near query on \
                     field '{}'",
                    near.path
                ),
            ));
        }
        let mut measured: Vec<(f64, u64, Document)> = Vec::new();
        for (id, doc) in &store.docs {
            if !matcher.matches(doc)? {
                continue;
            }
            let Some(value) = path::collect(doc, &near.path)
                .into_iter()
                .find_map(|candidate| candidate.as_present().cloned())
            else {
                continue;
            };
            let Some(distance) = near.distance_to(&value) else {
                continue;
            };
            if near.in_bounds(distance) {
                measured.push((distance, *id, doc.clone()));
            }
        }
        measured.sort_by(|(a, _, _), (b, _, _)| {
            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(measured
            .into_iter()
            .map(|(_, id, doc)| (id, doc))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_update(
        &self,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
        sort: Option<&Document>,
        replacement: bool,
    ) -> Result<UpdateExecution> {
        let kind = if replacement {
            UpdateDocKind::Replacement
        } else {
            match bson_util::classify_update(update)? {
                UpdateDocKind::Operators => UpdateDocKind::Operators,
                UpdateDocKind::Replacement if !multi => UpdateDocKind::Replacement,
                UpdateDocKind::Replacement => {
                    return Err(Error::failed_to_parse(
                        "multi update is not supported for replacement-style update",
                    ))
                }
            }
        };
        let matcher = Matcher::new(filter)?;
        let namespace = self.namespace();
        let mut store = self.inner.store.write();
        let mut pairs = store.matched_pairs(&matcher)?;
        if let Some(sort) = sort {
            sort_pairs(&mut pairs, sort)?;
        }
        if !multi {
            pairs.truncate(1);
        }

        if pairs.is_empty() {
            if !upsert {
                return Ok(UpdateExecution::default());
            }
            let seed = update::build_upsert(matcher.equality_fragments(), update, kind, filter)?;
            let upserted_id = seed.get("_id").cloned().unwrap_or(Bson::Null);
            store.insert_document(&namespace, seed.clone())?;
            debug!(namespace = %namespace, "upsert");
            return Ok(UpdateExecution {
                matched: 0,
                modified: 0,
                upserted_id: Some(upserted_id),
                pre_image: None,
                post_image: Some(seed),
            });
        }

        // Phase one: compute every post-image without touching storage.
        let ctx = UpdateContext {
            filter,
            upserting: false,
        };
        let mut planned: Vec<(u64, Document, Document)> = Vec::with_capacity(pairs.len());
        for (id, old) in pairs {
            let mut new = old.clone();
            match kind {
                UpdateDocKind::Operators => update::apply_operators(&mut new, update, &ctx)?,
                UpdateDocKind::Replacement => update::apply_replacement(&mut new, update)?,
            }
            if !bson_util::values_equal(
                old.get("_id").unwrap_or(&Bson::Null),
                new.get("_id").unwrap_or(&Bson::Null),
            ) {
                return Err(Error::command(
                    code::IMMUTABLE_FIELD,
                    "Performing an update on the path '_id' would modify the immutable \
                     field '_id'",
                ));
            }
            planned.push((id, old, new));
        }

        // Phase two: verify unique constraints across the whole batch.
        for index in &store.indexes {
            index.simulate_updates(&namespace, &planned)?;
        }

        // Phase three: commit documents and index diffs.
        for index in &mut store.indexes {
            for (id, old, _) in &planned {
                index.remove_doc(*id, old);
            }
            for (id, _, new) in &planned {
                index.add_unchecked(*id, new);
            }
        }
        let matched = planned.len() as u64;
        let mut modified = 0;
        let mut pre_image = None;
        let mut post_image = None;
        for (id, old, new) in planned {
            if update::was_modified(&old, &new) {
                modified += 1;
            }
            if pre_image.is_none() {
                pre_image = Some(old);
                post_image = Some(new.clone());
            }
            store.docs.insert(id, new);
        }
        debug!(namespace = %namespace, matched, modified, "update");
        Ok(UpdateExecution {
            matched,
            modified,
            upserted_id: None,
            pre_image,
            post_image,
        })
    }

    fn run_delete(&self, filter: &Document, multi: bool) -> Result<DeleteResult> {
        let matcher = Matcher::new(filter)?;
        let mut store = self.inner.store.write();
        let mut pairs = store.matched_pairs(&matcher)?;
        if !multi {
            pairs.truncate(1);
        }
        let mut deleted_count = 0;
        for (id, _) in pairs {
            if store.remove_document(id).is_some() {
                deleted_count += 1;
            }
        }
        debug!(namespace = %self.namespace(), deleted = deleted_count, "delete");
        Ok(DeleteResult { deleted_count })
    }
}

#[derive(Default)]
struct UpdateExecution {
    matched: u64,
    modified: u64,
    upserted_id: Option<Bson>,
    pre_image: Option<Document>,
    post_image: Option<Document>,
}

impl UpdateExecution {
    fn into_update_result(self) -> UpdateResult {
        UpdateResult {
            matched_count: self.matched,
            modified_count: self.modified,
            upserted_id: self.upserted_id,
        }
    }
}

/// Sorts (id, document) pairs by a sort specification, reusing the aggregation sort-key
/// semantics.
fn sort_pairs(pairs: &mut Vec<(u64, Document)>, spec: &Document) -> Result<()> {
    let components = aggregate::sort_components(spec)?;
    pairs.sort_unstable_by(|(_, doc_a), (_, doc_b)| {
        for (sort_path, ascending) in &components {
            let key_a = aggregate::sort_key(doc_a, sort_path, *ascending);
            let key_b = aggregate::sort_key(doc_b, sort_path, *ascending);
            let ord = bson_util::cmp_bson(&key_a, &key_b);
            if ord != std::cmp::Ordering::Equal {
                return if *ascending { ord } else { ord.reverse() };
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(())
}

fn apply_optional_projection(
    image: Option<Document>,
    projection: Option<&Document>,
) -> Result<Option<Document>> {
    match (image, projection) {
        (Some(doc), Some(spec)) => {
            let projection = Projection::compile(spec)?;
            let rng = std::cell::RefCell::new(
                <rand::rngs::SmallRng as rand::SeedableRng>::from_os_rng(),
            );
            Ok(Some(projection.apply(&doc, &rng)?))
        }
        (image, _) => Ok(image),
    }
}
