//! Options for index creation.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

/// The options for an index.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IndexOptions {
    /// Specifies a name outside the default generated name.
    ///
    /// If none is provided, the default name is generated from the key-direction pairs,
    /// e.g. `{a: 1, b: -1}` becomes `a_1_b_-1` and `{loc: "2dsphere"}` becomes
    /// `loc_2dsphere`.
    #[builder(default)]
    pub name: Option<String>,

    /// Creates a unique index so that the collection will not accept insertion or update
    /// of documents where the index key value matches an existing value in the index.
    ///
    /// The default value is false.
    #[builder(default)]
    pub unique: Option<bool>,

    /// If true, the index only references documents with the specified field.
    ///
    /// These indexes use less space but behave differently in some situations
    /// (particularly sorts). The default value is false.
    #[builder(default)]
    pub sparse: Option<bool>,

    /// The 2dsphere index version number. Versions 2 and 3 are accepted and behave
    /// identically here.
    #[builder(default)]
    #[serde(rename = "2dsphereIndexVersion")]
    pub sphere_2d_index_version: Option<i32>,
}
