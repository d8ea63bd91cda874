//! In-process document store with live queries and fault injection.

use crate::error::{Result, SyncError};
use crate::types::{Document, DocumentId, Entity, Fields};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use tracing::debug;

use super::{QueryDescriptor, RemoteStore, Watch, WatchId};

/// Store operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Query,
    Create,
    Delete,
    Update,
    Increment,
    Watch,
}

struct Watcher {
    query: QueryDescriptor,
    sender: Sender<Vec<Document>>,
    /// Result set pushed last; unchanged results are not pushed again.
    last: Vec<Document>,
}

/// Reads of `collection` park on `barrier` after loading the document.
struct ReadGate {
    collection: String,
    barrier: Arc<Barrier>,
}

#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    failures: Mutex<HashMap<Operation, u32>>,
    lost_acks: Mutex<HashMap<Operation, u32>>,
    read_gate: Mutex<Option<ReadGate>>,
}

impl Faults {
    fn check(&self, op: Operation) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork("store unreachable".into()));
        }
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::TransientNetwork(format!(
                    "injected {:?} failure",
                    op
                )));
            }
        }
        Ok(())
    }

    /// Called after a write has been applied.
    fn ack(&self, op: Operation) -> Result<()> {
        let mut lost = self.lost_acks.lock();
        match lost.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(SyncError::TransientNetwork(format!(
                    "{:?} applied but acknowledgement lost",
                    op
                )))
            }
            _ => Ok(()),
        }
    }

    fn gate_for(&self, collection: &str) -> Option<Arc<Barrier>> {
        self.read_gate
            .lock()
            .as_ref()
            .filter(|g| g.collection == collection)
            .map(|g| Arc::clone(&g.barrier))
    }
}

type CollectionData = BTreeMap<DocumentId, Document>;

/// An in-memory multi-writer document store.
///
/// Writes are serialized and every write pushes fresh snapshots to the
/// watchers of the touched collection before the next write starts, so
/// updates to one document reach watchers in the order the store applied
/// them.
pub struct MemoryStore {
    data: RwLock<HashMap<String, CollectionData>>,
    watchers: Mutex<HashMap<WatchId, Watcher>>,
    next_watch_id: AtomicU64,
    write_lock: Mutex<()>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_watch_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
            faults: Faults::default(),
        }
    }

    /// Seed a typed entity under its own id.
    pub fn insert<T: Entity>(&self, entity: &T) -> Result<Document> {
        self.create(T::COLLECTION, entity.id(), entity.to_fields()?)
    }

    /// Number of documents currently in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.data.read().get(collection).map_or(0, |c| c.len())
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.watchers.lock().len()
    }

    // --- Fault Injection ---

    /// While offline every operation fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `times` calls of `op` with a transient error.
    pub fn fail_next(&self, op: Operation, times: u32) {
        *self.faults.failures.lock().entry(op).or_insert(0) += times;
    }

    /// Apply the next `times` writes of `op`, then report a transient error
    /// as if the response had been lost.
    pub fn lose_next_acks(&self, op: Operation, times: u32) {
        *self.faults.lost_acks.lock().entry(op).or_insert(0) += times;
    }

    /// Make every read of `collection` wait on `barrier` after it has loaded
    /// the document, forcing concurrent readers to observe the same value.
    pub fn gate_reads(&self, collection: &str, barrier: Arc<Barrier>) {
        *self.faults.read_gate.lock() = Some(ReadGate {
            collection: collection.to_string(),
            barrier,
        });
    }

    pub fn clear_read_gate(&self) {
        *self.faults.read_gate.lock() = None;
    }

    // --- Internals ---

    /// Apply a write under the store's write lock and notify watchers if the
    /// closure reports a change.
    fn commit<T, F>(&self, op: Operation, collection: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut CollectionData) -> Result<(T, bool)>,
    {
        let _lock = self.write_lock.lock();

        let (out, changed) = {
            let mut data = self.data.write();
            let docs = data.entry(collection.to_string()).or_default();
            apply(docs)?
        };

        if changed {
            self.notify(collection);
        }
        self.faults.ack(op)?;
        Ok(out)
    }

    /// Push a fresh snapshot to each watcher of `collection` whose result
    /// set changed.
    /// Caller must hold the write lock.
    fn notify(&self, collection: &str) {
        let data = self.data.read();
        let empty = CollectionData::new();
        let docs = data.get(collection).unwrap_or(&empty);

        let mut watchers = self.watchers.lock();
        watchers.retain(|id, watcher| {
            if watcher.query.collection != collection {
                return true;
            }
            let snapshot = watcher.query.apply(docs.values());
            if snapshot == watcher.last {
                return true;
            }
            watcher.last = snapshot.clone();
            let alive = watcher.sender.send(snapshot).is_ok();
            if !alive {
                debug!(watch = id.0, "watch receiver gone, removing");
            }
            alive
        });
    }

    fn update_doc(
        docs: &mut CollectionData,
        collection: &str,
        id: &DocumentId,
        expected_version: Option<u64>,
        fields: Fields,
    ) -> Result<Option<Document>> {
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found(collection, id))?;
        if let Some(expected) = expected_version {
            if doc.version != expected {
                return Ok(None);
            }
        }
        for (k, v) in fields {
            doc.fields.insert(k, v);
        }
        doc.version += 1;
        Ok(Some(doc.clone()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MemoryStore {
    fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        self.faults.check(Operation::Get)?;
        let doc = self
            .data
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned();

        if let Some(barrier) = self.faults.gate_for(collection) {
            barrier.wait();
        }
        Ok(doc)
    }

    fn query(&self, query: &QueryDescriptor) -> Result<Vec<Document>> {
        self.faults.check(Operation::Query)?;
        let data = self.data.read();
        Ok(match data.get(&query.collection) {
            Some(docs) => query.apply(docs.values()),
            None => Vec::new(),
        })
    }

    fn create(&self, collection: &str, id: &DocumentId, fields: Fields) -> Result<Document> {
        self.faults.check(Operation::Create)?;
        self.commit(Operation::Create, collection, |docs| {
            if let Some(existing) = docs.get(id) {
                if existing.fields == fields {
                    return Ok((existing.clone(), false));
                }
                return Err(SyncError::Conflict {
                    collection: collection.to_string(),
                    id: id.clone(),
                });
            }
            let doc = Document {
                id: id.clone(),
                collection: collection.to_string(),
                version: 1,
                fields,
            };
            docs.insert(id.clone(), doc.clone());
            Ok((doc, true))
        })
    }

    fn delete(&self, collection: &str, id: &DocumentId) -> Result<bool> {
        self.faults.check(Operation::Delete)?;
        self.commit(Operation::Delete, collection, |docs| {
            let existed = docs.remove(id).is_some();
            Ok((existed, existed))
        })
    }

    fn update_fields(&self, collection: &str, id: &DocumentId, fields: Fields) -> Result<Document> {
        self.faults.check(Operation::Update)?;
        self.commit(Operation::Update, collection, |docs| {
            let doc = Self::update_doc(docs, collection, id, None, fields)?
                .ok_or_else(|| SyncError::not_found(collection, id))?;
            Ok((doc, true))
        })
    }

    fn update_if_version(
        &self,
        collection: &str,
        id: &DocumentId,
        expected_version: u64,
        fields: Fields,
    ) -> Result<bool> {
        self.faults.check(Operation::Update)?;
        self.commit(Operation::Update, collection, |docs| {
            let applied = Self::update_doc(docs, collection, id, Some(expected_version), fields)?
                .is_some();
            Ok((applied, applied))
        })
    }

    fn increment(
        &self,
        collection: &str,
        id: &DocumentId,
        field: &str,
        delta: i64,
        floor: Option<i64>,
    ) -> Result<i64> {
        self.faults.check(Operation::Increment)?;
        self.commit(Operation::Increment, collection, |docs| {
            let doc = docs
                .get_mut(id)
                .ok_or_else(|| SyncError::not_found(collection, id))?;
            let current = match doc.fields.get(field) {
                None | Some(serde_json::Value::Null) => 0,
                Some(v) => v.as_i64().ok_or_else(|| {
                    SyncError::Validation(format!("{}.{} is not an integer", collection, field))
                })?,
            };
            let mut next = current.saturating_add(delta);
            if let Some(floor) = floor {
                next = next.max(floor);
            }
            doc.fields.insert(field.to_string(), next.into());
            doc.version += 1;
            Ok((next, true))
        })
    }

    fn watch(&self, query: &QueryDescriptor) -> Result<Watch> {
        self.faults.check(Operation::Watch)?;
        let _lock = self.write_lock.lock();

        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = unbounded();

        let initial = match self.data.read().get(&query.collection) {
            Some(docs) => query.apply(docs.values()),
            None => Vec::new(),
        };
        // The receiver is still in scope, so this cannot fail.
        let _ = sender.send(initial.clone());

        self.watchers.lock().insert(
            id,
            Watcher {
                query: query.clone(),
                sender,
                last: initial,
            },
        );
        debug!(watch = id.0, query = %query.key(), "watch opened");

        Ok(Watch { id, receiver })
    }

    fn unwatch(&self, id: WatchId) {
        if self.watchers.lock().remove(&id).is_some() {
            debug!(watch = id.0, "watch closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Post, Timestamp};
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn fields(v: serde_json::Value) -> Fields {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn seed_post(store: &MemoryStore, id: &str) {
        store
            .insert(&Post {
                id: DocumentId::new(id),
                author_id: DocumentId::new("author"),
                content: "hello".into(),
                created_at: Timestamp::now(),
                comment_count: 0,
                image_url: None,
            })
            .unwrap();
    }

    #[test]
    fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        let id = DocumentId::new("c1");
        let first = store.create("comments", &id, fields(json!({"a": 1}))).unwrap();
        let again = store.create("comments", &id, fields(json!({"a": 1}))).unwrap();
        assert_eq!(first, again);
        assert_eq!(store.count("comments"), 1);

        let clash = store.create("comments", &id, fields(json!({"a": 2})));
        assert!(matches!(clash, Err(SyncError::Conflict { .. })));
    }

    #[test]
    fn test_increment_clamps_at_floor() {
        let store = MemoryStore::new();
        seed_post(&store, "p1");
        let id = DocumentId::new("p1");

        assert_eq!(store.increment("posts", &id, "commentCount", 2, Some(0)).unwrap(), 2);
        assert_eq!(store.increment("posts", &id, "commentCount", -5, Some(0)).unwrap(), 0);
        assert_eq!(store.increment("posts", &id, "likes", -1, None).unwrap(), -1);
    }

    #[test]
    fn test_increment_missing_document() {
        let store = MemoryStore::new();
        let result = store.increment("posts", &DocumentId::new("nope"), "commentCount", 1, Some(0));
        assert!(matches!(result, Err(SyncError::NotFound { .. })));
    }

    #[test]
    fn test_update_if_version() {
        let store = MemoryStore::new();
        seed_post(&store, "p1");
        let id = DocumentId::new("p1");
        let doc = store.get("posts", &id).unwrap().unwrap();

        assert!(store
            .update_if_version("posts", &id, doc.version, fields(json!({"commentCount": 1})))
            .unwrap());
        // Stale version loses.
        assert!(!store
            .update_if_version("posts", &id, doc.version, fields(json!({"commentCount": 7})))
            .unwrap());
        let now = store.get("posts", &id).unwrap().unwrap();
        assert_eq!(now.get("commentCount"), Some(&json!(1)));
    }

    #[test]
    fn test_watch_delivers_initial_and_updates() {
        let store = MemoryStore::new();
        let q = QueryDescriptor::collection("comments").where_eq("postId", "p1");
        let watch = store.watch(&q).unwrap();

        let initial = watch.receiver.recv_timeout(Duration::from_millis(100)).unwrap();
        assert!(initial.is_empty());

        store.add("comments", fields(json!({"postId": "p1"}))).unwrap();
        store.add("comments", fields(json!({"postId": "p2"}))).unwrap();

        let first = watch.receiver.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.len(), 1);
        // The p2 write leaves this result set unchanged.
        assert!(watch.receiver.try_recv().is_err());

        store.unwatch(watch.id);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn test_offline_and_injected_failures() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.get("posts", &DocumentId::new("p1")).unwrap_err();
        assert!(err.is_transient());
        store.set_offline(false);

        store.fail_next(Operation::Get, 1);
        assert!(store.get("posts", &DocumentId::new("p1")).is_err());
        assert!(store.get("posts", &DocumentId::new("p1")).is_ok());
    }

    #[test]
    fn test_unrelated_writes_push_nothing() {
        let store = MemoryStore::new();
        let q = QueryDescriptor::collection("comments").where_eq("postId", "p1");
        let watch = store.watch(&q).unwrap();
        watch.receiver.recv_timeout(Duration::from_millis(100)).unwrap();

        for _ in 0..20 {
            store.add("comments", fields(json!({"postId": "p2"}))).unwrap();
        }
        assert!(watch.receiver.is_empty());

        store.add("comments", fields(json!({"postId": "p1"}))).unwrap();
        assert_eq!(watch.receiver.len(), 1);
    }

    #[test]
    fn test_lost_ack_still_applies_write() {
        let store = MemoryStore::new();
        let id = DocumentId::new("c1");
        store.create("comments", &id, fields(json!({"a": 1}))).unwrap();

        store.lose_next_acks(Operation::Delete, 1);
        let err = store.delete("comments", &id).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.count("comments"), 0);
        // A retry cannot tell it was the one that removed the document.
        assert!(!store.delete("comments", &id).unwrap());
    }

    #[test]
    fn test_read_gate_holds_readers_together() {
        let store = Arc::new(MemoryStore::new());
        seed_post(&store, "p1");
        store.gate_reads("posts", Arc::new(Barrier::new(2)));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get("posts", &DocumentId::new("p1")).unwrap())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_some());
        }
    }
}
