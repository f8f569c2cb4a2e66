#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![allow(
    clippy::unreadable_literal,
    clippy::cognitive_complexity,
    clippy::float_cmp,
    clippy::match_like_matches_macro,
    clippy::derive_partial_eq_without_eq
)]

pub use ::bson;

mod aggregate;
mod bson_util;
mod coll;
mod command;
mod cursor;
mod db;
pub mod error;
mod expr;
mod geo;
mod index;
mod matcher;
mod path;
pub mod results;
mod serde_util;
mod update;

pub use crate::{
    coll::{options, Collection},
    cursor::Cursor,
    db::Database,
    index::{options as index_options, IndexModel},
};
pub use crate::index::options::IndexOptions;
