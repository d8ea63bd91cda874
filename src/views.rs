//! Read models joining snapshots with their referenced entities.

use crate::cache::LocalCache;
use crate::error::Result;
use crate::remote::{Direction, QueryDescriptor};
use crate::subscriptions::{Snapshot, SubscriptionHandle};
use crate::types::{Collection, Comment, DocumentId, Entity, Media, UserProfile};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Comments of a post, newest first.
pub fn comments_query(post: &DocumentId) -> QueryDescriptor {
    QueryDescriptor::collection(Comment::COLLECTION)
        .where_eq("postId", post.as_str())
        .order_by("createdAt", Direction::Desc)
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommentView {
    pub comment: Comment,
    /// `None` when the commenter has no profile.
    pub author: Option<UserProfile>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadView {
    pub comments: Vec<CommentView>,
    pub sequence: u64,
}

impl ThreadView {
    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

/// A live comment thread with commenter profiles attached.
pub struct CommentThread {
    handle: SubscriptionHandle,
    cache: Arc<LocalCache>,
}

impl CommentThread {
    pub fn new(handle: SubscriptionHandle, cache: Arc<LocalCache>) -> Self {
        Self { handle, cache }
    }

    /// Wait for the next snapshot and join it with profiles.
    ///
    /// The view is only returned once every distinct commenter has been
    /// looked up.
    pub fn next_view(&self, timeout: Duration) -> Result<Option<ThreadView>> {
        match self.handle.next_snapshot(timeout)? {
            Some(snapshot) => self.build(&snapshot).map(Some),
            None => Ok(None),
        }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    fn build(&self, snapshot: &Snapshot) -> Result<ThreadView> {
        let comments: Vec<Comment> = snapshot.decode()?;
        let profiles: HashMap<DocumentId, UserProfile> = self
            .cache
            .resolve_as(comments.iter().map(|c| c.user_id.clone()))?;

        let comments = comments
            .into_iter()
            .map(|comment| {
                let author = profiles.get(&comment.user_id).cloned();
                CommentView { comment, author }
            })
            .collect();

        Ok(ThreadView {
            comments,
            sequence: snapshot.sequence,
        })
    }
}

/// A collection with its media resolved, in collection order.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionView {
    pub collection: Collection,
    /// Media that no longer exist are left out.
    pub media: Vec<Media>,
}

impl CollectionView {
    pub(crate) fn resolve(cache: &LocalCache, collection: Collection) -> Result<Self> {
        let found: HashMap<DocumentId, Media> =
            cache.resolve_as(collection.items.iter().cloned())?;
        let media = collection
            .items
            .iter()
            .filter_map(|id| found.get(id).cloned())
            .collect();
        Ok(Self { collection, media })
    }
}
