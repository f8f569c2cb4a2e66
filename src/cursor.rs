//! A `Cursor` streams the results of a query or aggregation.
//!
//! Cursors hold no structural references into their collection: a query cursor snapshots
//! the matching document ids (and the iteration order) at creation time, then fetches
//! each document's current state as it is iterated. Documents inserted after the
//! snapshot are invisible; documents deleted after the snapshot are skipped; updates to
//! snapshotted documents are observed as post-images.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bson::Document;
use rand::{rngs::SmallRng, SeedableRng};

use crate::{
    aggregate::Projection,
    coll::CollectionInner,
    error::{Error, Result},
};

enum CursorState {
    /// A frozen id vector over a live collection.
    Snapshot {
        coll: Arc<CollectionInner>,
        ids: VecDeque<u64>,
        projection: Option<Projection>,
        rng: RefCell<SmallRng>,
    },
    /// Fully materialized results (aggregation output, `listIndexes`).
    Materialized { buffer: VecDeque<Document> },
}

/// A cursor over the results of an operation, yielding `Result<Document>` items.
///
/// A cursor iterates like any other `Iterator`:
///
/// ```
/// # use mangrove::{Database, error::Result};
/// # use bson::doc;
/// # fn run() -> Result<()> {
/// let db = Database::new("app");
/// let coll = db.collection("items");
/// coll.insert_one(doc! { "x": 1 })?;
/// for doc in coll.find(doc! {})? {
///     println!("{}", doc?);
/// }
/// # Ok(())
/// # }
/// # run().unwrap();
/// ```
pub struct Cursor {
    state: CursorState,
    cancellation: Option<Arc<AtomicBool>>,
    failed: bool,
}

impl Cursor {
    pub(crate) fn snapshot(
        coll: Arc<CollectionInner>,
        ids: Vec<u64>,
        projection: Option<Projection>,
        cancellation: Option<Arc<AtomicBool>>,
    ) -> Cursor {
        Cursor {
            state: CursorState::Snapshot {
                coll,
                ids: ids.into(),
                projection,
                rng: RefCell::new(SmallRng::from_os_rng()),
            },
            cancellation,
            failed: false,
        }
    }

    pub(crate) fn materialized(docs: Vec<Document>) -> Cursor {
        Cursor {
            state: CursorState::Materialized {
                buffer: docs.into(),
            },
            cancellation: None,
            failed: false,
        }
    }

    pub(crate) fn with_cancellation(mut self, flag: Option<Arc<AtomicBool>>) -> Cursor {
        self.cancellation = flag;
        self
    }

    /// Whether the cursor has no more results to yield.
    pub fn is_exhausted(&self) -> bool {
        if self.failed {
            return true;
        }
        match &self.state {
            CursorState::Snapshot { ids, .. } => ids.is_empty(),
            CursorState::Materialized { buffer } => buffer.is_empty(),
        }
    }

    /// Collects every remaining document, failing on the first error.
    pub fn collect_documents(self) -> Result<Vec<Document>> {
        self.collect()
    }

    fn next_document(&mut self) -> Option<Result<Document>> {
        if self.failed {
            return None;
        }
        if let Some(flag) = &self.cancellation {
            if flag.load(Ordering::Relaxed) {
                self.failed = true;
                return Some(Err(Error::interrupted()));
            }
        }
        loop {
            match &mut self.state {
                CursorState::Materialized { buffer } => return buffer.pop_front().map(Ok),
                CursorState::Snapshot {
                    coll,
                    ids,
                    projection,
                    rng,
                } => {
                    let id = ids.pop_front()?;
                    // Fetch the post-image; ids deleted since the snapshot are skipped.
                    let Some(doc) = coll.store.read().docs.get(&id).cloned() else {
                        continue;
                    };
                    return match projection {
                        Some(projection) => match projection.apply(&doc, rng) {
                            Ok(projected) => Some(Ok(projected)),
                            Err(error) => {
                                self.failed = true;
                                Some(Err(error))
                            }
                        },
                        None => Some(Ok(doc)),
                    };
                }
            }
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document()
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            CursorState::Snapshot { ids, .. } => f
                .debug_struct("Cursor")
                .field("kind", &"snapshot")
                .field("remaining", &ids.len())
                .finish(),
            CursorState::Materialized { buffer } => f
                .debug_struct("Cursor")
                .field("kind", &"materialized")
                .field("remaining", &buffer.len())
                .finish(),
        }
    }
}
