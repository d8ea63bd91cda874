//! Denormalized aggregate counters.
//!
//! `Post.commentCount` caches the number of comments on a post. Updates go
//! through one of the [`CounterStrategy`] variants; `reconcile` recounts the
//! true cardinality and repairs any drift.

mod aggregate;

pub use aggregate::{AggregateCounter, CounterStrategy, Reconciliation, COMMENT_COUNT_FIELD};
