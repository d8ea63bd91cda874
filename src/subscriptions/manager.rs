//! Subscription manager: one live pipeline per distinct query.

use crate::cache::LocalCache;
use crate::error::Result;
use crate::remote::{QueryDescriptor, QueryKey, RemoteStore, WatchId};
use crate::types::Document;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};

use super::types::{
    DropReason, Snapshot, SnapshotEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};

/// A remote watch shared by every subscriber of one query.
struct Pipeline {
    watch_id: WatchId,
    subscribers: HashMap<SubscriptionId, Sender<SnapshotEvent>>,
}

pub(super) struct Shared {
    store: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    config: SubscriptionConfig,
    pipelines: Mutex<HashMap<QueryKey, Pipeline>>,
    next_id: AtomicU64,
}

impl Shared {
    /// Install a pushed snapshot and fan it out. Returns false once the
    /// pipeline fed by `watch_id` is gone, which stops its pump.
    ///
    /// Each subscriber channel holds `buffer_size` snapshots plus one slot
    /// kept free for the final `Dropped` event.
    fn deliver(&self, key: &QueryKey, watch_id: WatchId, documents: Vec<Document>) -> bool {
        let mut pipelines = self.pipelines.lock();
        let Some(pipeline) = pipelines.get_mut(key).filter(|p| p.watch_id == watch_id) else {
            return false;
        };

        let unchanged = self
            .cache
            .snapshot(key)
            .is_some_and(|latest| *latest.documents == documents);
        if unchanged {
            return true;
        }

        let cached = self.cache.install_snapshot(key, documents);
        let event = SnapshotEvent::Snapshot(Snapshot {
            query: key.clone(),
            documents: cached.documents,
            sequence: cached.sequence,
        });

        let buffer_size = self.config.buffer_size.max(1);
        let mut overflowed = Vec::new();
        let mut disconnected = Vec::new();
        for (id, sender) in pipeline.subscribers.iter() {
            if sender.len() >= buffer_size {
                overflowed.push(*id);
                continue;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => overflowed.push(*id),
                Err(TrySendError::Disconnected(_)) => disconnected.push(*id),
            }
        }

        for id in overflowed {
            if let Some(sender) = pipeline.subscribers.remove(&id) {
                warn!(subscription = id.0, query = %key, "subscriber too slow, dropping");
                let _ = sender.try_send(SnapshotEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                });
            }
        }
        for id in disconnected {
            pipeline.subscribers.remove(&id);
        }

        if pipeline.subscribers.is_empty() {
            self.close_pipeline(&mut pipelines, key);
            return false;
        }
        true
    }

    /// Add a subscriber to a running pipeline, handing it the latest snapshot.
    fn join(
        &self,
        pipeline: &mut Pipeline,
        key: &QueryKey,
        id: SubscriptionId,
        sender: Sender<SnapshotEvent>,
    ) {
        if let Some(latest) = self.cache.snapshot(key) {
            let _ = sender.try_send(SnapshotEvent::Snapshot(Snapshot {
                query: key.clone(),
                documents: latest.documents,
                sequence: latest.sequence,
            }));
        }
        pipeline.subscribers.insert(id, sender);
        debug!(subscription = id.0, query = %key, "joined pipeline");
    }

    pub(super) fn cancel(&self, id: SubscriptionId, key: &QueryKey) {
        let mut pipelines = self.pipelines.lock();
        let Some(pipeline) = pipelines.get_mut(key) else {
            return;
        };

        if let Some(sender) = pipeline.subscribers.remove(&id) {
            // Best effort
            let _ = sender.try_send(SnapshotEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
            debug!(subscription = id.0, query = %key, "subscription cancelled");
        }

        if pipeline.subscribers.is_empty() {
            self.close_pipeline(&mut pipelines, key);
        }
    }

    fn close_pipeline(&self, pipelines: &mut HashMap<QueryKey, Pipeline>, key: &QueryKey) {
        if let Some(pipeline) = pipelines.remove(key) {
            self.store.unwatch(pipeline.watch_id);
            self.cache.evict_snapshot(key);
            info!(query = %key, "pipeline closed");
        }
    }

    fn close_all(&self) {
        let mut pipelines = self.pipelines.lock();
        for (key, pipeline) in pipelines.drain() {
            self.store.unwatch(pipeline.watch_id);
            self.cache.evict_snapshot(&key);
            for sender in pipeline.subscribers.values() {
                let _ = sender.try_send(SnapshotEvent::Dropped {
                    reason: DropReason::Closed,
                });
            }
        }
    }
}

/// Opens and closes live queries against the remote store.
///
/// Subscribers to equal queries share one remote watch and one pump thread;
/// the watch is released when the last of them cancels.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                cache,
                config,
                pipelines: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to a live query.
    ///
    /// Joining an existing pipeline immediately yields its latest snapshot;
    /// a new pipeline yields the store's initial snapshot once it arrives.
    /// The remote watch is opened without holding the pipeline registry.
    pub fn subscribe(&self, query: &QueryDescriptor) -> Result<SubscriptionHandle> {
        let key = query.key();
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.shared.config.buffer_size.max(1) + 1);
        let handle = |receiver| SubscriptionHandle {
            id,
            query: key.clone(),
            receiver,
            shared: Arc::downgrade(&self.shared),
        };

        if let Some(pipeline) = self.shared.pipelines.lock().get_mut(&key) {
            self.shared.join(pipeline, &key, id, sender);
            return Ok(handle(receiver));
        }

        let watch = self.shared.store.watch(query)?;

        let mut pipelines = self.shared.pipelines.lock();
        if let Some(pipeline) = pipelines.get_mut(&key) {
            // Opened by a concurrent subscriber while we were watching.
            self.shared.store.unwatch(watch.id);
            self.shared.join(pipeline, &key, id, sender);
            return Ok(handle(receiver));
        }

        let mut subscribers = HashMap::new();
        subscribers.insert(id, sender);
        pipelines.insert(
            key.clone(),
            Pipeline {
                watch_id: watch.id,
                subscribers,
            },
        );
        spawn_pump(Arc::downgrade(&self.shared), key.clone(), watch.id, watch.receiver);
        info!(subscription = id.0, query = %key, "pipeline opened");
        drop(pipelines);

        Ok(handle(receiver))
    }

    /// Active subscriptions across all pipelines.
    pub fn subscription_count(&self) -> usize {
        self.shared
            .pipelines
            .lock()
            .values()
            .map(|p| p.subscribers.len())
            .sum()
    }

    /// Distinct live queries.
    pub fn pipeline_count(&self) -> usize {
        self.shared.pipelines.lock().len()
    }

    /// Close every pipeline; subscribers see `Dropped { Closed }`.
    pub fn close_all(&self) {
        self.shared.close_all();
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

/// Forward pushed snapshots into the pipeline until the watch ends or the
/// pipeline is closed.
fn spawn_pump(
    shared: Weak<Shared>,
    key: QueryKey,
    watch_id: WatchId,
    receiver: Receiver<Vec<Document>>,
) {
    thread::spawn(move || {
        for documents in receiver.iter() {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if !shared.deliver(&key, watch_id, documents) {
                break;
            }
        }
        debug!(watch = watch_id.0, query = %key, "pump stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
    use crate::types::{DocumentId, Fields};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(500);

    fn setup(buffer_size: usize) -> (Arc<MemoryStore>, SubscriptionManager) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LocalCache::new(store.clone(), 64));
        let manager = SubscriptionManager::new(
            store.clone(),
            cache,
            SubscriptionConfig { buffer_size },
        );
        (store, manager)
    }

    fn comment(post: &str) -> Fields {
        match json!({"postId": post, "content": "x"}) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    fn comments_on(post: &str) -> QueryDescriptor {
        QueryDescriptor::collection("comments").where_eq("postId", post)
    }

    /// Wait for a snapshot of the given size, skipping older ones.
    fn wait_for_len(handle: &SubscriptionHandle, len: usize) -> Snapshot {
        loop {
            let snapshot = handle
                .next_snapshot(WAIT)
                .unwrap()
                .expect("timed out waiting for snapshot");
            if snapshot.len() == len {
                return snapshot;
            }
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let (store, manager) = setup(16);

        let handle = manager.subscribe(&comments_on("p1")).unwrap();
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(store.watch_count(), 1);

        handle.cancel();
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(manager.pipeline_count(), 0);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn test_identical_queries_share_pipeline() {
        let (store, manager) = setup(16);

        let a = manager.subscribe(&comments_on("p1")).unwrap();
        wait_for_len(&a, 0);
        let b = manager.subscribe(&comments_on("p1")).unwrap();
        let c = manager.subscribe(&comments_on("p2")).unwrap();

        assert_eq!(manager.pipeline_count(), 2);
        assert_eq!(store.watch_count(), 2);
        // Late joiner gets the current snapshot right away.
        assert!(b.next_snapshot(WAIT).unwrap().is_some());

        drop(c);
        drop(a);
        drop(b);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn test_cancel_one_keeps_other_delivering() {
        let (store, manager) = setup(16);
        let a = manager.subscribe(&comments_on("p1")).unwrap();
        let b = manager.subscribe(&comments_on("p1")).unwrap();
        wait_for_len(&a, 0);

        a.cancel();
        store.add("comments", comment("p1")).unwrap();

        let snapshot = wait_for_len(&b, 1);
        assert_eq!(snapshot.documents[0].get("postId"), Some(&json!("p1")));
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(store.watch_count(), 1);
    }

    #[test]
    fn test_snapshot_replaces_not_diffs() {
        let (store, manager) = setup(16);
        let handle = manager.subscribe(&comments_on("p1")).unwrap();

        let first = store.add("comments", comment("p1")).unwrap();
        store.add("comments", comment("p1")).unwrap();
        wait_for_len(&handle, 2);

        store.delete("comments", &first.id).unwrap();
        let snapshot = wait_for_len(&handle, 1);
        assert!(snapshot.documents.iter().all(|d| d.id != first.id));
    }

    #[test]
    fn test_drop_slow_subscriber() {
        // Small buffer
        let (store, manager) = setup(2);
        let slow = manager.subscribe(&comments_on("p1")).unwrap();

        // Flood with snapshots nobody reads
        for _ in 0..10 {
            store.add("comments", comment("p1")).unwrap();
        }

        // Subscriber should be dropped, taking the pipeline with it
        for _ in 0..100 {
            if manager.subscription_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(store.watch_count(), 0);

        // The buffered snapshots are followed by the drop notice.
        let events: Vec<_> = slow.receiver.try_iter().collect();
        assert_eq!(events.len(), 3);
        match events.last() {
            Some(SnapshotEvent::Dropped { reason }) => {
                assert_eq!(*reason, DropReason::BufferOverflow)
            }
            other => panic!("Expected Dropped event, got {:?}", other),
        }
    }

    #[test]
    fn test_idle_subscriber_survives_unrelated_writes() {
        let (store, manager) = setup(4);
        let handle = manager.subscribe(&comments_on("p1")).unwrap();
        wait_for_len(&handle, 0);

        for _ in 0..20 {
            store.add("comments", comment("p2")).unwrap();
        }
        store.add("comments", comment("p1")).unwrap();

        wait_for_len(&handle, 1);
        assert_eq!(manager.subscription_count(), 1);
        assert!(handle.receiver.is_empty());
    }

    #[test]
    fn test_concurrent_subscribes_open_one_watch() {
        let (store, manager) = setup(16);
        let start = std::sync::Barrier::new(8);

        let handles: Vec<_> = thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let (manager, start) = (&manager, &start);
                    s.spawn(move || {
                        start.wait();
                        manager.subscribe(&comments_on("p1")).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(manager.pipeline_count(), 1);
        assert_eq!(manager.subscription_count(), 8);
        assert_eq!(store.watch_count(), 1);

        drop(handles);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn test_close_all_notifies() {
        let (store, manager) = setup(16);
        let handle = manager.subscribe(&comments_on("p1")).unwrap();
        wait_for_len(&handle, 0);

        manager.close_all();
        assert_eq!(store.watch_count(), 0);
        match handle.recv_timeout(WAIT).unwrap() {
            SnapshotEvent::Dropped { reason } => assert_eq!(reason, DropReason::Closed),
            other => panic!("Expected Dropped event, got {:?}", other),
        }
    }

    #[test]
    fn test_other_documents_unaffected() {
        let (store, manager) = setup(16);
        let handle = manager.subscribe(&comments_on("p1")).unwrap();
        store
            .create("comments", &DocumentId::new("c9"), comment("p2"))
            .unwrap();
        store.add("comments", comment("p1")).unwrap();
        let snapshot = wait_for_len(&handle, 1);
        assert_ne!(snapshot.documents[0].id, DocumentId::new("c9"));
    }
}
