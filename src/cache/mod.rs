//! Local cache of remote state.
//!
//! Holds the last snapshot delivered for every live query plus a bounded set
//! of entities keyed by collection and id. References found in a snapshot
//! (commenter profiles, collection media) are resolved by a concurrent
//! fan-out whose identical in-flight lookups are collapsed into one fetch.

mod inflight;
mod local;

pub use inflight::InFlight;
pub use local::{CachedSnapshot, EntityKey, LocalCache, DEFAULT_MAX_FANOUT};
