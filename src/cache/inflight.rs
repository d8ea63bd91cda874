//! Collapses concurrent identical lookups into one fetch.

use crate::error::{Result, SyncError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Slot<V> {
    result: Mutex<Option<Result<V>>>,
    ready: Condvar,
}

/// Hands the leader's outcome to waiters and clears the pending entry, even
/// when the fetch unwinds before producing one.
struct Publish<'a, K: Eq + Hash, V> {
    pending: &'a Mutex<HashMap<K, Arc<Slot<V>>>>,
    key: &'a K,
    slot: &'a Slot<V>,
}

impl<K: Eq + Hash, V> Drop for Publish<'_, K, V> {
    fn drop(&mut self) {
        {
            let mut result = self.slot.result.lock();
            if result.is_none() {
                *result = Some(Err(SyncError::LookupAbandoned(
                    "fetch panicked before completing".into(),
                )));
            }
        }
        self.pending.lock().remove(self.key);
        self.slot.ready.notify_all();
    }
}

/// Single-flight table: while a fetch for a key is running, callers asking
/// for the same key wait for it and share its result instead of issuing
/// their own.
pub struct InFlight<K, V> {
    pending: Mutex<HashMap<K, Arc<Slot<V>>>>,
    fetches: AtomicU64,
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Run `fetch` for `key` unless a fetch for it is already in flight, in
    /// which case wait for that one.
    pub fn run<F>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let (slot, leader) = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot {
                        result: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    pending.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if leader {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let publish = Publish {
                pending: &self.pending,
                key: &key,
                slot: &slot,
            };
            let result = fetch();
            *slot.result.lock() = Some(result.clone());
            drop(publish);
            return result;
        }

        let mut guard = slot.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            slot.ready.wait(&mut guard);
        }
    }

    /// Fetches actually issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
