//! Denormalized counter maintenance.

use crate::error::{Result, SyncError};
use crate::remote::{QueryDescriptor, RemoteStore};
use crate::types::{Comment, DocumentId, Entity, Fields, Post};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Field on `posts` caching the number of live comments.
pub const COMMENT_COUNT_FIELD: &str = "commentCount";

/// How counter updates reach the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterStrategy {
    /// Storage-level atomic increment with a zero floor.
    Atomic,

    /// Read the document version, write conditionally, retry on conflict.
    CompareAndSwap { max_attempts: u32 },

    /// Read the value, then write value ± 1.
    ///
    /// Concurrent writers can read the same value and overwrite each other,
    /// losing updates. Only kept to demonstrate the race.
    ReadModifyWrite,
}

impl Default for CounterStrategy {
    fn default() -> Self {
        CounterStrategy::Atomic
    }
}

/// Result of reconciling one counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    pub post: DocumentId,
    pub stored: u64,
    pub actual: u64,
}

impl Reconciliation {
    pub fn drifted(&self) -> bool {
        self.stored != self.actual
    }
}

/// Keeps `Post.commentCount` in step with the comment collection.
pub struct AggregateCounter {
    store: Arc<dyn RemoteStore>,
    strategy: CounterStrategy,
}

impl AggregateCounter {
    pub fn new(store: Arc<dyn RemoteStore>, strategy: CounterStrategy) -> Self {
        Self { store, strategy }
    }

    pub fn strategy(&self) -> CounterStrategy {
        self.strategy
    }

    pub fn increment(&self, post: &DocumentId) -> Result<u64> {
        self.apply(post, 1)
    }

    /// Decrement, clamped at zero.
    pub fn decrement(&self, post: &DocumentId) -> Result<u64> {
        self.apply(post, -1)
    }

    /// Current stored value (missing counts as zero).
    pub fn current(&self, post: &DocumentId) -> Result<u64> {
        let doc = self
            .store
            .get(Post::COLLECTION, post)?
            .ok_or_else(|| SyncError::not_found(Post::COLLECTION, post))?;
        Ok(read_count(doc.get(COMMENT_COUNT_FIELD)))
    }

    fn apply(&self, post: &DocumentId, delta: i64) -> Result<u64> {
        let value = match self.strategy {
            CounterStrategy::Atomic => self.store.increment(
                Post::COLLECTION,
                post,
                COMMENT_COUNT_FIELD,
                delta,
                Some(0),
            )?,
            CounterStrategy::CompareAndSwap { max_attempts } => {
                self.compare_and_swap(post, delta, max_attempts)?
            }
            CounterStrategy::ReadModifyWrite => self.read_modify_write(post, delta)?,
        };
        debug!(post = %post, delta, value, "counter updated");
        Ok(value.max(0) as u64)
    }

    fn compare_and_swap(&self, post: &DocumentId, delta: i64, max_attempts: u32) -> Result<i64> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            let doc = self
                .store
                .get(Post::COLLECTION, post)?
                .ok_or_else(|| SyncError::not_found(Post::COLLECTION, post))?;
            let next = (read_count(doc.get(COMMENT_COUNT_FIELD)) as i64 + delta).max(0);

            if self
                .store
                .update_if_version(Post::COLLECTION, post, doc.version, count_fields(next))?
            {
                return Ok(next);
            }
            debug!(post = %post, attempt, "counter write lost a race, retrying");
        }

        warn!(post = %post, attempts, "counter contention exhausted");
        Err(SyncError::ContentionExhausted {
            id: post.clone(),
            field: COMMENT_COUNT_FIELD.to_string(),
            attempts,
        })
    }

    fn read_modify_write(&self, post: &DocumentId, delta: i64) -> Result<i64> {
        let doc = self
            .store
            .get(Post::COLLECTION, post)?
            .ok_or_else(|| SyncError::not_found(Post::COLLECTION, post))?;
        let next = (read_count(doc.get(COMMENT_COUNT_FIELD)) as i64 + delta).max(0);
        self.store
            .update_fields(Post::COLLECTION, post, count_fields(next))?;
        Ok(next)
    }

    /// Recount the comments of `post` and overwrite the stored counter.
    ///
    /// Repairs drift left by interrupted two-step mutations or by racing
    /// writers. Comments created while the recount runs may be missed until
    /// the next sweep.
    pub fn reconcile(&self, post: &DocumentId) -> Result<Reconciliation> {
        let stored = self.current(post)?;
        let query = QueryDescriptor::collection(Comment::COLLECTION)
            .where_eq("postId", post.as_str());
        let actual = self.store.query(&query)?.len() as u64;

        if stored != actual {
            self.store
                .update_fields(Post::COLLECTION, post, count_fields(actual as i64))?;
            info!(post = %post, stored, actual, "counter reconciled");
        }

        Ok(Reconciliation {
            post: post.clone(),
            stored,
            actual,
        })
    }

    /// Reconcile every post. Returns only the counters that had drifted.
    pub fn reconcile_all(&self) -> Result<Vec<Reconciliation>> {
        let posts = self
            .store
            .query(&QueryDescriptor::collection(Post::COLLECTION))?;
        let mut drifted = Vec::new();
        for post in posts {
            let result = self.reconcile(&post.id)?;
            if result.drifted() {
                drifted.push(result);
            }
        }
        Ok(drifted)
    }
}

fn read_count(value: Option<&serde_json::Value>) -> u64 {
    value
        .and_then(|v| v.as_i64())
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

fn count_fields(value: i64) -> Fields {
    let mut fields = Fields::new();
    fields.insert(COMMENT_COUNT_FIELD.to_string(), value.into());
    fields
}
