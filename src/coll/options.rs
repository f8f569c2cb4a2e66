//! Options for collection-level operations, shaped like the driver-facing API.

use std::sync::{atomic::AtomicBool, Arc};

use bson::Document;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::serde_util;

/// Which version of the document to return from a `findOneAnd*` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ReturnDocument {
    /// Return the document after modification.
    After,
    /// Return the document before modification.
    Before,
}

impl Default for ReturnDocument {
    fn default() -> Self {
        ReturnDocument::Before
    }
}

/// Specifies the options to a [`Collection::find`](crate::Collection::find) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOptions {
    /// The number of documents the cursor should return per batch.
    #[serde(serialize_with = "serialize_opt_u32", default)]
    pub batch_size: Option<u32>,

    /// Tags the query with an arbitrary string to help trace the operation through the
    /// database profiler.
    pub comment: Option<String>,

    /// The maximum number of documents to return. A limit of 0 means no limit; a negative
    /// limit returns at most `|limit|` documents.
    pub limit: Option<i64>,

    /// Limits the fields of the documents being returned.
    pub projection: Option<Document>,

    /// The number of documents to skip before returning.
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,

    /// A caller-owned flag which, once set, aborts iteration between documents.
    #[serde(skip)]
    pub cancellation: Option<Arc<AtomicBool>>,
}

/// Specifies the options to a [`Collection::find_one`](crate::Collection::find_one)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOneOptions {
    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The number of documents to skip before returning.
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,
}

impl From<FindOneOptions> for FindOptions {
    fn from(options: FindOneOptions) -> Self {
        FindOptions::builder()
            .projection(options.projection)
            .skip(options.skip)
            .sort(options.sort)
            .limit(Some(1))
            .build()
    }
}

/// Specifies the options to a
/// [`Collection::insert_many`](crate::Collection::insert_many) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Whether the operations should be performed in order, stopping at the first
    /// failure. The default is true.
    pub ordered: Option<bool>,
}

/// Specifies the options to an update operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct UpdateOptions {
    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,
}

/// Specifies the options to a
/// [`Collection::replace_one`](crate::Collection::replace_one) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReplaceOptions {
    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,
}

/// Specifies the options to a
/// [`Collection::find_one_and_update`](crate::Collection::find_one_and_update) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOneAndUpdateOptions {
    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// Whether to return the document before or after modification. Defaults to before.
    pub return_document: Option<ReturnDocument>,

    /// If multiple documents match, selects the first according to this order.
    pub sort: Option<Document>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,
}

/// Specifies the options to a
/// [`Collection::find_one_and_replace`](crate::Collection::find_one_and_replace)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOneAndReplaceOptions {
    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// Whether to return the document before or after modification. Defaults to before.
    pub return_document: Option<ReturnDocument>,

    /// If multiple documents match, selects the first according to this order.
    pub sort: Option<Document>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,
}

/// Specifies the options to a
/// [`Collection::find_one_and_delete`](crate::Collection::find_one_and_delete) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOneAndDeleteOptions {
    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// If multiple documents match, selects the first according to this order.
    pub sort: Option<Document>,
}

/// Specifies the options to a
/// [`Collection::count_documents`](crate::Collection::count_documents) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CountOptions {
    /// The maximum number of documents to count.
    #[serde(serialize_with = "serialize_opt_u64", default)]
    pub limit: Option<u64>,

    /// The number of documents to skip before counting.
    #[serde(serialize_with = "serialize_opt_u64", default)]
    pub skip: Option<u64>,
}

/// Specifies the options to a [`Collection::aggregate`](crate::Collection::aggregate)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// The number of documents the cursor should return per batch.
    #[serde(serialize_with = "serialize_opt_u32", default)]
    pub batch_size: Option<u32>,

    /// Tags the operation with an arbitrary string to help trace it through the database
    /// profiler.
    pub comment: Option<String>,

    /// Seeds the generator behind `$rand` and `$sample`, making the pipeline
    /// deterministic. When unset, the generator is seeded from the operating system.
    #[serde(skip)]
    pub seed: Option<u64>,

    /// A caller-owned flag which, once set, aborts execution between input records.
    #[serde(skip)]
    pub cancellation: Option<Arc<AtomicBool>>,
}

fn serialize_opt_u32<S: serde::Serializer>(
    val: &Option<u32>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(val) => serde_util::serialize_u32_as_i32(val, serializer),
        None => serializer.serialize_none(),
    }
}

fn serialize_opt_u64<S: serde::Serializer>(
    val: &Option<u64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(val) => serde_util::serialize_u64_as_i64(val, serializer),
        None => serializer.serialize_none(),
    }
}
