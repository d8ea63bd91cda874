//! Error types for the sync engine.

use crate::types::DocumentId;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Clone, Debug, Error)]
pub enum SyncError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: DocumentId },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No authenticated user")]
    Unauthenticated,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Conflicting write to {collection}/{id}")]
    Conflict { collection: String, id: DocumentId },

    #[error("Counter {field} on {id} still contended after {attempts} attempts")]
    ContentionExhausted {
        id: DocumentId,
        field: String,
        attempts: u32,
    },

    #[error("Comment {comment} was written but its post counter was not updated: {source}")]
    CounterDrift {
        comment: DocumentId,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Subscription dropped")]
    SubscriptionDropped,

    #[error("Shared lookup abandoned: {0}")]
    LookupAbandoned(String),
}

impl SyncError {
    pub(crate) fn not_found(collection: &str, id: &DocumentId) -> Self {
        SyncError::NotFound {
            collection: collection.to_string(),
            id: id.clone(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::LookupAbandoned(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
