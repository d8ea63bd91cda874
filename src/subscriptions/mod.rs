//! Live query subscriptions.
//!
//! Every distinct [`QueryDescriptor`](crate::remote::QueryDescriptor) is
//! served by exactly one pipeline: a remote watch plus a pump thread that
//! installs each pushed snapshot in the [`LocalCache`](crate::cache::LocalCache)
//! and fans it out to the pipeline's subscribers.
//!
//! Delivery is snapshot-based. Each event carries the full matching result
//! set; intermediate states may be skipped and consumers must not expect
//! diffs.
//!
//! # Example
//!
//! ```ignore
//! let query = QueryDescriptor::collection("comments").where_eq("postId", "p1");
//! let handle = manager.subscribe(&query)?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(SnapshotEvent::Snapshot(snapshot)) => render(snapshot.decode::<Comment>()?),
//!         Ok(SnapshotEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! // Dropping `handle` releases the subscription.
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, Snapshot, SnapshotEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
