//! Derived notification state.
//!
//! `has_unread` is never stored; it is recomputed from the latest snapshot
//! of the user's open and in-progress support tickets.

mod tracker;

pub use tracker::{
    active_tickets_query, has_unread, NotificationState, NotificationTracker,
};
