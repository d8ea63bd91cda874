//! # docsync
//!
//! Client-side synchronization for a document-oriented remote store:
//! live queries, a local cache, and multi-step mutations that keep
//! denormalized counters correct under concurrent writers.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: Live queries delivered as full snapshots, one shared pipeline per query
//! - **Cache**: Last snapshot per query plus entities resolved by concurrent fan-out
//! - **Mutations**: Validated, permission-checked writes with counter follow-ups
//! - **Counters**: Atomic, compare-and-swap or racy read-modify-write updates, with reconciliation
//! - **Notifications**: Unread indicator recomputed from each ticket snapshot
//!
//! ## Example
//!
//! ```ignore
//! use docsync::{EngineConfig, MemoryBlobStore, MemoryStore, StaticIdentity, SyncEngine};
//!
//! let engine = SyncEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryBlobStore::new()),
//!     Arc::new(StaticIdentity::signed_in(user)),
//! );
//!
//! // Watch a post's comments with commenter profiles attached
//! let thread = engine.watch_comments(&post_id)?;
//!
//! // Add a comment; the post's commentCount follows
//! engine.create_comment(&post_id, "Nice read!")?;
//! let view = thread.next_view(Duration::from_secs(1))?;
//! ```

pub mod blobs;
pub mod cache;
pub mod counters;
pub mod engine;
pub mod error;
pub mod identity;
pub mod mutations;
pub mod notifications;
pub mod remote;
pub mod subscriptions;
pub mod types;
pub mod views;

// Re-exports
pub use blobs::{BlobUploader, MemoryBlobStore};
pub use cache::{InFlight, LocalCache};
pub use counters::{AggregateCounter, CounterStrategy, Reconciliation, COMMENT_COUNT_FIELD};
pub use engine::{EngineConfig, SyncEngine};
pub use error::{Result, SyncError};
pub use identity::{IdentityProvider, StaticIdentity};
pub use mutations::{ImageUpload, MutationCoordinator, NewPost, RetryPolicy};
pub use notifications::{active_tickets_query, has_unread, NotificationState, NotificationTracker};
pub use remote::{
    Direction, MemoryStore, Operation, QueryDescriptor, QueryKey, RemoteStore, Watch, WatchId,
};
pub use subscriptions::{
    DropReason, Snapshot, SnapshotEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
pub use types::*;
pub use views::{comments_query, CollectionView, CommentThread, CommentView, ThreadView};
