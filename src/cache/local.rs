//! Last-known query snapshots and entities.

use crate::error::Result;
use crate::remote::{QueryKey, RemoteStore};
use crate::types::{Document, DocumentId, Entity, Timestamp};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;

use super::InFlight;

/// `(collection, id)`.
pub type EntityKey = (String, DocumentId);

/// Default upper bound on reference lookup workers.
pub const DEFAULT_MAX_FANOUT: usize = 16;

/// A query result as last installed.
#[derive(Clone, Debug)]
pub struct CachedSnapshot {
    pub documents: Arc<Vec<Document>>,
    /// Monotonic install counter across the whole cache.
    pub sequence: u64,
    pub installed: Timestamp,
}

/// Local cache of snapshots and entities.
///
/// Query results are replaced wholesale on each delivery. Entities seen in
/// snapshots or resolved as references are kept in a bounded LRU keyed by
/// collection and id.
pub struct LocalCache {
    store: Arc<dyn RemoteStore>,
    snapshots: RwLock<HashMap<QueryKey, CachedSnapshot>>,
    entities: Mutex<LruCache<EntityKey, Document>>,
    lookups: InFlight<EntityKey, Option<Document>>,
    next_sequence: AtomicU64,
    max_fanout: usize,
}

impl LocalCache {
    pub fn new(store: Arc<dyn RemoteStore>, entity_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(entity_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            snapshots: RwLock::new(HashMap::new()),
            entities: Mutex::new(LruCache::new(capacity)),
            lookups: InFlight::new(),
            next_sequence: AtomicU64::new(1),
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }

    /// Cap the number of concurrent lookup workers used by `resolve`.
    pub fn with_max_fanout(mut self, max_fanout: usize) -> Self {
        self.max_fanout = max_fanout.max(1);
        self
    }

    // --- Snapshots ---

    /// Replace the cached result list for `key`.
    pub fn install_snapshot(&self, key: &QueryKey, documents: Vec<Document>) -> CachedSnapshot {
        {
            let mut entities = self.entities.lock();
            for doc in &documents {
                Self::upsert(&mut entities, doc);
            }
        }

        let snapshot = CachedSnapshot {
            documents: Arc::new(documents),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            installed: Timestamp::now(),
        };
        self.snapshots.write().insert(key.clone(), snapshot.clone());
        debug!(
            query = %key,
            len = snapshot.documents.len(),
            seq = snapshot.sequence,
            "snapshot installed"
        );
        snapshot
    }

    pub fn snapshot(&self, key: &QueryKey) -> Option<CachedSnapshot> {
        self.snapshots.read().get(key).cloned()
    }

    pub fn evict_snapshot(&self, key: &QueryKey) {
        self.snapshots.write().remove(key);
    }

    // --- Entities ---

    pub fn entity(&self, collection: &str, id: &DocumentId) -> Option<Document> {
        self.entities
            .lock()
            .get(&(collection.to_string(), id.clone()))
            .cloned()
    }

    /// Record a document we just wrote or read.
    pub fn put_entity(&self, doc: &Document) {
        Self::upsert(&mut self.entities.lock(), doc);
    }

    pub fn forget_entity(&self, collection: &str, id: &DocumentId) {
        self.entities.lock().pop(&(collection.to_string(), id.clone()));
    }

    /// Fetch every distinct referenced id and install the results, returning
    /// only once all of them have resolved. The ids are split across at most
    /// `max_fanout` scoped workers.
    ///
    /// Ids that do not exist are left out of the result. If any fetch fails,
    /// nothing is installed and the first error is returned.
    pub fn resolve<I>(&self, collection: &str, ids: I) -> Result<HashMap<DocumentId, Document>>
    where
        I: IntoIterator<Item = DocumentId>,
    {
        let distinct: Vec<DocumentId> = ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if distinct.is_empty() {
            return Ok(HashMap::new());
        }

        let workers = distinct.len().min(self.max_fanout);
        let ids_per_worker = distinct.len().div_ceil(workers);

        let fetched: Vec<Result<Option<Document>>> = thread::scope(|scope| {
            let handles: Vec<_> = distinct
                .chunks(ids_per_worker)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|id| {
                                let key = (collection.to_string(), id.clone());
                                self.lookups.run(key, || self.store.get(collection, id))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(results) => results,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut found = Vec::with_capacity(fetched.len());
        for result in fetched {
            if let Some(doc) = result? {
                found.push(doc);
            }
        }

        let mut entities = self.entities.lock();
        let mut out = HashMap::with_capacity(found.len());
        for doc in found {
            Self::upsert(&mut entities, &doc);
            out.insert(doc.id.clone(), doc);
        }
        debug!(collection, requested = distinct.len(), found = out.len(), "references resolved");
        Ok(out)
    }

    /// `resolve` decoded into entities.
    pub fn resolve_as<T, I>(&self, ids: I) -> Result<HashMap<DocumentId, T>>
    where
        T: Entity,
        I: IntoIterator<Item = DocumentId>,
    {
        self.resolve(T::COLLECTION, ids)?
            .into_iter()
            .map(|(id, doc)| Ok((id, doc.decode()?)))
            .collect()
    }

    /// Remote fetches issued by `resolve` (after in-flight deduplication).
    pub fn lookup_count(&self) -> u64 {
        self.lookups.fetch_count()
    }

    pub fn clear(&self) {
        self.snapshots.write().clear();
        self.entities.lock().clear();
    }

    /// Keep the newer of the cached and incoming document.
    fn upsert(entities: &mut LruCache<EntityKey, Document>, doc: &Document) {
        let key = (doc.collection.clone(), doc.id.clone());
        let stale = entities
            .peek(&key)
            .is_some_and(|cached| cached.version > doc.version);
        if !stale {
            entities.put(key, doc.clone());
        }
    }
}
