//! `Database` is the top-level handle: a named registry of collections plus the cursor
//! registry behind `getMore`.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use bson::Document;
use parking_lot::{Mutex, RwLock};

use crate::{
    coll::{Collection, CollectionInner},
    cursor::Cursor,
    error::{code, Error, Result},
};

struct DatabaseInner {
    name: String,
    collections: RwLock<HashMap<String, Arc<CollectionInner>>>,
    cursors: Mutex<HashMap<i64, Cursor>>,
    next_cursor_id: AtomicI64,
}

/// An in-process database: a named set of collections.
///
/// `Database` uses an `Arc` internally, so it can be cloned and shared across threads
/// cheaply; all clones observe the same collections.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name()).finish()
    }
}

impl Database {
    /// Creates an empty database with the given name.
    pub fn new(name: impl Into<String>) -> Database {
        Database {
            inner: Arc::new(DatabaseInner {
                name: name.into(),
                collections: RwLock::new(HashMap::new()),
                cursors: Mutex::new(HashMap::new()),
                next_cursor_id: AtomicI64::new(1),
            }),
        }
    }

    /// The name of this database.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets a handle to the collection with the given name. Collections spring into
    /// existence on first use; an empty collection with no user indexes is not reported
    /// by [`Database::list_collection_names`].
    pub fn collection(&self, name: &str) -> Collection {
        let existing = self.inner.collections.read().get(name).cloned();
        let inner = match existing {
            Some(inner) => inner,
            None => {
                let mut collections = self.inner.collections.write();
                collections
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(CollectionInner::new(name.to_string())))
                    .clone()
            }
        };
        Collection::new(self.clone(), inner)
    }

    /// The names of the collections holding documents or user-created indexes, sorted.
    pub fn list_collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .collections
            .read()
            .iter()
            .filter(|(_, inner)| inner.is_materialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drops the named collection, deleting its documents and indexes. Dropping a
    /// collection that does not exist is a no-op.
    pub fn drop_collection(&self, name: &str) {
        let removed = self.inner.collections.write().remove(name);
        if let Some(inner) = removed {
            inner.clear();
        }
    }

    /// A snapshot of the named collection's documents in natural order, for
    /// cross-collection aggregation stages. Missing collections snapshot as empty.
    pub(crate) fn snapshot(&self, name: &str) -> Vec<Document> {
        let inner = self.inner.collections.read().get(name).cloned();
        match inner {
            Some(inner) => inner
                .store
                .read_recursive()
                .docs
                .values()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Registers a live cursor for `getMore`, returning its id.
    pub(crate) fn register_cursor(&self, cursor: Cursor) -> i64 {
        let id = self.inner.next_cursor_id.fetch_add(1, Ordering::Relaxed);
        self.inner.cursors.lock().insert(id, cursor);
        id
    }

    /// Pulls the next batch from a registered cursor. Returns the batch and the cursor
    /// id to report: the same id while results remain, 0 once exhausted.
    pub(crate) fn cursor_batch(
        &self,
        cursor_id: i64,
        batch_size: Option<usize>,
    ) -> Result<(Vec<Document>, i64)> {
        let mut cursors = self.inner.cursors.lock();
        let Some(cursor) = cursors.get_mut(&cursor_id) else {
            return Err(Error::command(
                code::CURSOR_NOT_FOUND,
                format!("cursor id {} not found", cursor_id),
            ));
        };
        let limit = batch_size.unwrap_or(usize::MAX);
        let mut batch = Vec::new();
        let mut failure = None;
        while batch.len() < limit {
            match cursor.next() {
                Some(Ok(doc)) => batch.push(doc),
                Some(Err(error)) => {
                    // Errors exhaust the cursor.
                    failure = Some(error);
                    break;
                }
                None => break,
            }
        }
        let exhausted = cursor.is_exhausted();
        if let Some(error) = failure {
            cursors.remove(&cursor_id);
            return Err(error);
        }
        if exhausted {
            cursors.remove(&cursor_id);
            Ok((batch, 0))
        } else {
            Ok((batch, cursor_id))
        }
    }

    /// Drops a registered cursor, releasing its snapshot.
    pub(crate) fn kill_cursor(&self, cursor_id: i64) -> bool {
        self.inner.cursors.lock().remove(&cursor_id).is_some()
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn collections_are_shared_between_handles() {
        let db = Database::new("app");
        db.collection("orders").insert_one(doc! { "x": 1 }).unwrap();
        let again = db.collection("orders");
        assert_eq!(again.estimated_document_count().unwrap(), 1);
    }

    #[test]
    fn list_collection_names_hides_unmaterialized() {
        let db = Database::new("app");
        let _ = db.collection("ghost");
        db.collection("real").insert_one(doc! { "x": 1 }).unwrap();
        assert_eq!(db.list_collection_names(), vec!["real".to_string()]);
    }

    #[test]
    fn drop_collection_clears_live_handles() {
        let db = Database::new("app");
        let coll = db.collection("c");
        coll.insert_one(doc! { "x": 1 }).unwrap();
        db.drop_collection("c");
        assert_eq!(coll.estimated_document_count().unwrap(), 0);
        assert!(db.list_collection_names().is_empty());
    }
}
