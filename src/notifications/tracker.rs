//! Unread-ticket indicator derived from the live ticket snapshot.

use crate::error::Result;
use crate::remote::QueryDescriptor;
use crate::subscriptions::{Snapshot, SubscriptionHandle};
use crate::types::{DocumentId, Entity, SupportTicket, TicketStatus};
use std::time::Duration;

/// Query for the tickets a user is still waiting on.
pub fn active_tickets_query(user: &DocumentId) -> QueryDescriptor {
    QueryDescriptor::collection(SupportTicket::COLLECTION)
        .where_eq("userId", user.as_str())
        .where_in(
            "status",
            [TicketStatus::Open.as_str(), TicketStatus::InProgress.as_str()],
        )
}

/// True iff some open or in-progress ticket has not been read.
pub fn has_unread(tickets: &[SupportTicket]) -> bool {
    tickets.iter().any(|t| t.status.is_active() && !t.read)
}

/// Derived notification state for one snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationState {
    pub tickets: Vec<SupportTicket>,
    pub has_unread: bool,
    /// Sequence of the snapshot this was derived from.
    pub sequence: u64,
}

impl NotificationState {
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let tickets: Vec<SupportTicket> = snapshot.decode()?;
        Ok(Self {
            has_unread: has_unread(&tickets),
            tickets,
            sequence: snapshot.sequence,
        })
    }

    pub fn unread_count(&self) -> usize {
        self.tickets.iter().filter(|t| !t.read).count()
    }
}

/// Recomputes [`NotificationState`] on every ticket snapshot.
///
/// Nothing is carried between snapshots: each state is a pure function of
/// the snapshot it came from.
pub struct NotificationTracker {
    handle: SubscriptionHandle,
}

impl NotificationTracker {
    pub fn new(handle: SubscriptionHandle) -> Self {
        Self { handle }
    }

    /// Wait up to `timeout` for the next snapshot and derive its state.
    pub fn next_state(&self, timeout: Duration) -> Result<Option<NotificationState>> {
        match self.handle.next_snapshot(timeout)? {
            Some(snapshot) => NotificationState::from_snapshot(&snapshot).map(Some),
            None => Ok(None),
        }
    }

    /// State of the newest buffered snapshot, skipping older ones.
    pub fn latest_state(&self) -> Result<Option<NotificationState>> {
        self.handle
            .latest()
            .map(|s| NotificationState::from_snapshot(&s))
            .transpose()
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}
