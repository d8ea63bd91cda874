//! Subscription types for live query delivery.

use crate::error::{Result, SyncError};
use crate::remote::QueryKey;
use crate::types::{Document, Entity};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::manager::Shared;

/// Configuration for subscriptions.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered snapshots per subscriber before it is dropped.
    /// Default: 256
    pub buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The full result set of a query at one point in time.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub query: QueryKey,
    pub documents: Arc<Vec<Document>>,
    /// Install sequence from the local cache; later snapshots compare greater.
    pub sequence: u64,
}

impl Snapshot {
    /// Decode every document as `T`.
    pub fn decode<T: Entity>(&self) -> Result<Vec<T>> {
        self.documents.iter().map(Document::decode).collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Events delivered to a subscriber.
#[derive(Clone, Debug)]
pub enum SnapshotEvent {
    /// A fresh result set replacing the previous one.
    Snapshot(Snapshot),

    /// Delivery to this subscriber has ended.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly cancelled.
    Unsubscribed,
    /// The manager shut every pipeline down.
    Closed,
}

/// An active subscription owned by the caller.
///
/// Dropping the handle cancels it. Cancelling one handle never affects
/// other handles on the same query.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub query: QueryKey,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<SnapshotEvent>,
    pub(super) shared: Weak<Shared>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<SnapshotEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<SnapshotEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<SnapshotEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Wait up to `timeout` for the next snapshot.
    ///
    /// Returns `Ok(None)` on timeout and `SubscriptionDropped` once delivery
    /// has ended.
    pub fn next_snapshot(&self, timeout: Duration) -> Result<Option<Snapshot>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(SnapshotEvent::Snapshot(snapshot)) => Ok(Some(snapshot)),
            Ok(SnapshotEvent::Dropped { .. }) => Err(SyncError::SubscriptionDropped),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(SyncError::SubscriptionDropped)
            }
        }
    }

    /// Drain everything buffered and keep only the newest snapshot.
    pub fn latest(&self) -> Option<Snapshot> {
        self.receiver
            .try_iter()
            .filter_map(|event| match event {
                SnapshotEvent::Snapshot(s) => Some(s),
                SnapshotEvent::Dropped { .. } => None,
            })
            .last()
    }

    /// Stop delivery to this handle.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel(self.id, &self.query);
        }
    }
}
