//! Dotted-path traversal over documents and arrays.
//!
//! Queries and updates consume the same path grammar but need different resolutions: the
//! matcher wants every candidate value a path reaches (flattening through arrays), while
//! the update engine wants exactly one writable slot, creating intermediates on demand.

use bson::{Bson, Document};

use crate::error::{code, Error, Result};

/// One resolved terminal position of a path within a document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PathValue {
    /// The path reaches this value.
    Present(Bson),
    /// The path dead-ends before its final segment, or the final field is absent. Distinct
    /// from null: `{$exists: true}` rejects it, equality with null accepts it.
    Missing,
}

impl PathValue {
    pub(crate) fn as_present(&self) -> Option<&Bson> {
        match self {
            PathValue::Present(v) => Some(v),
            PathValue::Missing => None,
        }
    }
}

/// Collects every terminal candidate the dotted `path` reaches inside `doc`.
///
/// Traversal rules: a document segment is a field lookup; an integer segment on an array
/// indexes into it; a field segment on an array applies the remaining path to each element,
/// flattening the results into the candidate multiset. Non-document elements reached by a
/// field segment contribute `Missing`.
pub(crate) fn collect(doc: &Document, path: &str) -> Vec<PathValue> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_in_doc(doc, &segments, &mut out);
    out
}

fn collect_in_doc(doc: &Document, segments: &[&str], out: &mut Vec<PathValue>) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    match doc.get(*head) {
        None => out.push(PathValue::Missing),
        Some(value) if rest.is_empty() => out.push(PathValue::Present(value.clone())),
        Some(value) => collect_in_value(value, rest, out),
    }
}

fn collect_in_value(value: &Bson, segments: &[&str], out: &mut Vec<PathValue>) {
    match value {
        Bson::Document(doc) => collect_in_doc(doc, segments, out),
        Bson::Array(arr) => {
            let (head, rest) = match segments.split_first() {
                Some(split) => split,
                None => return,
            };
            if let Ok(index) = head.parse::<usize>() {
                match arr.get(index) {
                    None => out.push(PathValue::Missing),
                    Some(element) if rest.is_empty() => {
                        out.push(PathValue::Present(element.clone()))
                    }
                    Some(element) => collect_in_value(element, rest, out),
                }
                return;
            }
            // Field segment across array elements: flatten per element.
            if arr.is_empty() {
                out.push(PathValue::Missing);
                return;
            }
            for element in arr {
                match element {
                    Bson::Document(doc) => collect_in_doc(doc, segments, out),
                    _ => out.push(PathValue::Missing),
                }
            }
        }
        _ => out.push(PathValue::Missing),
    }
}

/// Resolves a field reference the way aggregation expressions do: integer segments are
/// plain field names, and traversing an array maps the remaining path over its document
/// elements, collecting the non-missing results into an array. Returns `None` for missing.
pub(crate) fn expr_get(doc: &Document, path: &str) -> Option<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    expr_get_in_doc(doc, &segments)
}

fn expr_get_in_doc(doc: &Document, segments: &[&str]) -> Option<Bson> {
    let (head, rest) = segments.split_first()?;
    let value = doc.get(*head)?;
    if rest.is_empty() {
        return Some(value.clone());
    }
    expr_descend(value, rest)
}

fn expr_descend(value: &Bson, segments: &[&str]) -> Option<Bson> {
    match value {
        Bson::Document(doc) => expr_get_in_doc(doc, segments),
        Bson::Array(arr) => {
            let collected: Vec<Bson> = arr
                .iter()
                .filter_map(|element| match element {
                    Bson::Document(doc) => expr_get_in_doc(doc, segments),
                    _ => None,
                })
                .collect();
            Some(Bson::Array(collected))
        }
        _ => None,
    }
}

/// How the write-path resolver treats missing intermediates and out-of-range indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateMode {
    /// Never create anything; a missing step resolves to no slot.
    NoCreate,
    /// Create missing intermediate documents; out-of-range array positions are an error.
    Create,
    /// Create missing intermediates and null-pad arrays up to the addressed position.
    CreatePad,
}

/// The parent container and position of a writable slot.
#[derive(Debug)]
pub(crate) enum Slot<'a> {
    /// A named field of a document (possibly absent).
    Field(&'a mut Document, String),
    /// An element of an array; the index is in bounds unless the slot was resolved with
    /// [`CreateMode::NoCreate`].
    Element(&'a mut Vec<Bson>, usize),
}

impl<'a> Slot<'a> {
    pub(crate) fn get(&self) -> Option<&Bson> {
        match self {
            Slot::Field(doc, key) => doc.get(key),
            Slot::Element(arr, index) => arr.get(*index),
        }
    }

    pub(crate) fn get_mut(&mut self) -> Option<&mut Bson> {
        match self {
            Slot::Field(doc, key) => doc.get_mut(key),
            Slot::Element(arr, index) => arr.get_mut(*index),
        }
    }

    /// Whether this slot addresses an array element rather than a document field.
    pub(crate) fn is_element(&self) -> bool {
        matches!(self, Slot::Element(..))
    }

    pub(crate) fn set(self, value: Bson) {
        match self {
            Slot::Field(doc, key) => {
                doc.insert(key, value);
            }
            Slot::Element(arr, index) => {
                if index >= arr.len() {
                    arr.resize(index + 1, Bson::Null);
                }
                arr[index] = value;
            }
        }
    }

    /// Removes the slot's value. A document field is deleted; an array element is replaced
    /// with null so sibling positions keep their indexes.
    pub(crate) fn remove(self) -> Option<Bson> {
        match self {
            Slot::Field(doc, key) => doc.remove(&key),
            Slot::Element(arr, index) => arr
                .get_mut(index)
                .map(|element| std::mem::replace(element, Bson::Null)),
        }
    }
}

/// Resolves the dotted `path` to a single writable slot inside `doc`.
///
/// Returns `Ok(None)` when the path dead-ends and `mode` forbids creating the missing
/// pieces. Attempting to descend through a non-container value, or to create a field
/// inside one, raises PathNotViable (28).
pub(crate) fn resolve_slot<'a>(
    doc: &'a mut Document,
    path: &str,
    mode: CreateMode,
) -> Result<Option<Slot<'a>>> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_in_doc(doc, path, &segments, mode)
}

fn not_viable(path: &str, segment: &str) -> Error {
    Error::command(
        code::PATH_NOT_VIABLE,
        format!(
            "Cannot create field '{}' in path '{}'",
            segment, path
        ),
    )
}

fn resolve_in_doc<'a>(
    doc: &'a mut Document,
    full_path: &str,
    segments: &[&str],
    mode: CreateMode,
) -> Result<Option<Slot<'a>>> {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Ok(None),
    };
    if rest.is_empty() {
        return Ok(Some(Slot::Field(doc, (*head).to_string())));
    }
    if !doc.contains_key(*head) {
        match mode {
            CreateMode::NoCreate => return Ok(None),
            _ => {
                doc.insert((*head).to_string(), Document::new());
            }
        }
    }
    match doc.get_mut(*head).unwrap() {
        Bson::Document(sub) => resolve_in_doc(sub, full_path, rest, mode),
        Bson::Array(arr) => resolve_in_array(arr, full_path, rest, mode),
        _ if mode == CreateMode::NoCreate => Ok(None),
        _ => Err(not_viable(full_path, rest[0])),
    }
}

fn resolve_in_array<'a>(
    arr: &'a mut Vec<Bson>,
    full_path: &str,
    segments: &[&str],
    mode: CreateMode,
) -> Result<Option<Slot<'a>>> {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Ok(None),
    };
    let index: usize = match head.parse() {
        Ok(index) => index,
        Err(_) if mode == CreateMode::NoCreate => return Ok(None),
        Err(_) => return Err(not_viable(full_path, head)),
    };
    if rest.is_empty() {
        if index >= arr.len() {
            match mode {
                CreateMode::NoCreate => return Ok(Some(Slot::Element(arr, index))),
                CreateMode::Create => return Err(not_viable(full_path, head)),
                CreateMode::CreatePad => arr.resize(index + 1, Bson::Null),
            }
        }
        return Ok(Some(Slot::Element(arr, index)));
    }
    if index >= arr.len() {
        match mode {
            CreateMode::NoCreate => return Ok(None),
            CreateMode::Create => return Err(not_viable(full_path, head)),
            CreateMode::CreatePad => {
                arr.resize(index + 1, Bson::Null);
                arr[index] = Bson::Document(Document::new());
            }
        }
    }
    match &mut arr[index] {
        Bson::Document(sub) => resolve_in_doc(sub, full_path, rest, mode),
        Bson::Array(sub) => resolve_in_array(sub, full_path, rest, mode),
        element @ Bson::Null if mode == CreateMode::CreatePad => {
            *element = Bson::Document(Document::new());
            match element {
                Bson::Document(sub) => resolve_in_doc(sub, full_path, rest, mode),
                _ => unreachable!(),
            }
        }
        _ if mode == CreateMode::NoCreate => Ok(None),
        _ => Err(not_viable(full_path, rest[0])),
    }
}

#[cfg(test)]
mod test {
    use bson::{bson, doc};

    use super::*;

    #[test]
    fn collect_flattens_through_arrays() {
        let doc = doc! { "a": [ { "b": 1 }, { "b": 2 }, { "c": 3 } ] };
        let values = collect(&doc, "a.b");
        assert_eq!(
            values,
            vec![
                PathValue::Present(bson!(1)),
                PathValue::Present(bson!(2)),
                PathValue::Missing,
            ]
        );
    }

    #[test]
    fn collect_indexes_arrays_by_integer_segment() {
        let doc = doc! { "a": [10, 20, 30] };
        assert_eq!(collect(&doc, "a.1"), vec![PathValue::Present(bson!(20))]);
        assert_eq!(collect(&doc, "a.9"), vec![PathValue::Missing]);
    }

    #[test]
    fn collect_missing_intermediate() {
        let doc = doc! { "a": { "b": 1 } };
        assert_eq!(collect(&doc, "a.x.y"), vec![PathValue::Missing]);
        assert_eq!(collect(&doc, "z"), vec![PathValue::Missing]);
    }

    #[test]
    fn expr_get_maps_over_array_elements() {
        let doc = doc! { "items": [ { "qty": 1 }, { "qty": 2 }, { "other": 3 } ] };
        assert_eq!(expr_get(&doc, "items.qty"), Some(bson!([1, 2])));
        assert_eq!(expr_get(&doc, "missing"), None);
    }

    #[test]
    fn resolve_slot_creates_intermediate_documents() {
        let mut doc = doc! {};
        let slot = resolve_slot(&mut doc, "a.b.c", CreateMode::Create)
            .unwrap()
            .unwrap();
        slot.set(bson!(5));
        assert_eq!(doc, doc! { "a": { "b": { "c": 5 } } });
    }

    #[test]
    fn resolve_slot_array_padding() {
        let mut doc = doc! { "a": [1] };
        let slot = resolve_slot(&mut doc, "a.3", CreateMode::CreatePad)
            .unwrap()
            .unwrap();
        slot.set(bson!(9));
        assert_eq!(doc, doc! { "a": [1, Bson::Null, Bson::Null, 9] });

        let mut doc = doc! { "a": [1] };
        assert!(resolve_slot(&mut doc, "a.3", CreateMode::Create).is_err());
    }

    #[test]
    fn resolve_slot_through_scalar_fails() {
        let mut doc = doc! { "a": 5 };
        assert!(resolve_slot(&mut doc, "a.b", CreateMode::Create).is_err());
        assert!(resolve_slot(&mut doc, "a.b", CreateMode::NoCreate)
            .unwrap()
            .is_none());
    }

    #[test]
    fn remove_nulls_out_array_elements() {
        let mut doc = doc! { "a": [1, 2, 3] };
        let slot = resolve_slot(&mut doc, "a.1", CreateMode::NoCreate)
            .unwrap()
            .unwrap();
        assert_eq!(slot.remove(), Some(bson!(2)));
        assert_eq!(doc, doc! { "a": [1, Bson::Null, 3] });
    }
}
