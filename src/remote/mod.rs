//! The remote document store this engine synchronizes against.
//!
//! The store is shared by many independent clients. It offers:
//! - Point reads and filtered, ordered queries
//! - Live queries that push a full result snapshot on every change
//! - Idempotent creates with client-chosen ids, deletes and field updates
//! - Version-conditional writes and an atomic increment with a floor
//!
//! [`MemoryStore`] is an in-process implementation with fault injection.

mod memory;
mod query;

pub use memory::{MemoryStore, Operation};
pub use query::{Direction, Filter, FilterOp, OrderBy, QueryDescriptor, QueryKey};

use crate::error::Result;
use crate::types::{Document, DocumentId, Fields};

/// Identifier of a remote watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// A standing live query. The receiver yields the full matching result set
/// each time it changes, starting with the current one.
pub struct Watch {
    pub id: WatchId,
    pub receiver: crossbeam_channel::Receiver<Vec<Document>>,
}

/// Capabilities consumed from the remote store.
pub trait RemoteStore: Send + Sync {
    fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>>;

    fn query(&self, query: &QueryDescriptor) -> Result<Vec<Document>>;

    /// Create a document under a caller-chosen id.
    ///
    /// Re-issuing the same create is a no-op returning the stored document;
    /// a different document under that id is a `Conflict`.
    fn create(&self, collection: &str, id: &DocumentId, fields: Fields) -> Result<Document>;

    /// Delete a document. Returns whether it existed.
    fn delete(&self, collection: &str, id: &DocumentId) -> Result<bool>;

    /// Overwrite the given fields, leaving the others untouched.
    fn update_fields(&self, collection: &str, id: &DocumentId, fields: Fields) -> Result<Document>;

    /// Like `update_fields`, but only if the document is still at
    /// `expected_version`. Returns false when another writer got there first.
    fn update_if_version(
        &self,
        collection: &str,
        id: &DocumentId,
        expected_version: u64,
        fields: Fields,
    ) -> Result<bool>;

    /// Atomically add `delta` to an integer field (missing counts as 0),
    /// clamping the result at `floor`. Returns the new value.
    fn increment(
        &self,
        collection: &str,
        id: &DocumentId,
        field: &str,
        delta: i64,
        floor: Option<i64>,
    ) -> Result<i64>;

    fn watch(&self, query: &QueryDescriptor) -> Result<Watch>;

    fn unwatch(&self, id: WatchId);

    /// Create a document under a freshly generated id.
    fn add(&self, collection: &str, fields: Fields) -> Result<Document> {
        self.create(collection, &DocumentId::generate(), fields)
    }
}
