//! User-initiated writes and their follow-up steps.

use crate::blobs::BlobUploader;
use crate::cache::LocalCache;
use crate::counters::AggregateCounter;
use crate::error::{Result, SyncError};
use crate::identity::IdentityProvider;
use crate::remote::RemoteStore;
use crate::types::{
    Comment, CurrentUser, Document, DocumentId, Entity, Fields, Post, SupportTicket, Timestamp,
    UserProfile,
};
use std::sync::Arc;
use tracing::{info, warn};

use super::RetryPolicy;

/// Media attached to a new post.
#[derive(Clone, Debug)]
pub struct ImageUpload {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct NewPost {
    pub content: String,
    pub image: Option<ImageUpload>,
}

/// Sequences multi-step mutations against the store.
///
/// Validation, authentication, permission and existence checks all happen
/// before the first write. Reads, creates (ids are chosen client-side),
/// deletes and uploads are retried on transient errors; counter updates
/// are not, since repeating them would double count.
pub struct MutationCoordinator {
    store: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    counter: Arc<AggregateCounter>,
    blobs: Arc<dyn BlobUploader>,
    identity: Arc<dyn IdentityProvider>,
    retry: RetryPolicy,
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        counter: Arc<AggregateCounter>,
        blobs: Arc<dyn BlobUploader>,
        identity: Arc<dyn IdentityProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            counter,
            blobs,
            identity,
            retry,
        }
    }

    /// Add a comment to a post and bump its counter.
    ///
    /// The comment write and the counter update are separate writes. If the
    /// counter update fails the comment stays and `CounterDrift` is returned;
    /// `AggregateCounter::reconcile` repairs the count.
    pub fn create_comment(&self, post_id: &DocumentId, content: &str) -> Result<Comment> {
        let content = non_empty(content, "comment")?;
        let actor = self.actor()?;
        self.require::<Post>(post_id)?;

        let comment = Comment {
            id: DocumentId::generate(),
            post_id: post_id.clone(),
            user_id: actor.id,
            content: content.to_string(),
            created_at: Timestamp::now(),
        };
        self.write_new(&comment)?;

        let counted = self.counter.increment(post_id);
        self.cache.forget_entity(Post::COLLECTION, post_id);
        if let Err(e) = counted {
            warn!(comment = %comment.id, post = %post_id, error = %e, "comment counter not incremented");
            return Err(SyncError::CounterDrift {
                comment: comment.id,
                source: Box::new(e),
            });
        }

        info!(comment = %comment.id, post = %post_id, "comment created");
        Ok(comment)
    }

    /// Delete a comment (privileged actors only) and decrement its post's
    /// counter, clamped at zero.
    ///
    /// If someone else deleted the comment first, their call owns the
    /// decrement and this one only confirms the comment is gone. When a
    /// retried delete finds nothing, an earlier attempt may have removed it
    /// without the reply arriving; that case is reported as `CounterDrift`.
    pub fn delete_comment(&self, comment_id: &DocumentId) -> Result<()> {
        let actor = self.actor()?;
        let profile = self
            .fetch::<UserProfile>(&actor.id)?
            .ok_or_else(|| SyncError::PermissionDenied(format!("{} has no profile", actor.id)))?;
        if !profile.role.is_privileged() {
            return Err(SyncError::PermissionDenied(format!(
                "{} may not delete comments",
                actor.id
            )));
        }

        let comment = self.require::<Comment>(comment_id)?;
        self.require::<Post>(&comment.post_id)?;

        let mut interrupted = false;
        let existed = self.retry.run("delete comment", || {
            let result = self.store.delete(Comment::COLLECTION, comment_id);
            if matches!(&result, Err(e) if e.is_transient()) {
                interrupted = true;
            }
            result
        })?;
        self.cache.forget_entity(Comment::COLLECTION, comment_id);
        if !existed && interrupted {
            warn!(comment = %comment_id, post = %comment.post_id, "delete outcome unknown, counter not decremented");
            return Err(SyncError::CounterDrift {
                comment: comment_id.clone(),
                source: Box::new(SyncError::TransientNetwork(
                    "delete was retried and found nothing to remove".into(),
                )),
            });
        }
        if !existed {
            info!(comment = %comment_id, "comment already deleted");
            return Ok(());
        }

        let counted = self.counter.decrement(&comment.post_id);
        self.cache.forget_entity(Post::COLLECTION, &comment.post_id);
        if let Err(e) = counted {
            warn!(comment = %comment_id, post = %comment.post_id, error = %e, "comment counter not decremented");
            return Err(SyncError::CounterDrift {
                comment: comment_id.clone(),
                source: Box::new(e),
            });
        }

        info!(comment = %comment_id, post = %comment.post_id, by = %actor.id, "comment deleted");
        Ok(())
    }

    /// Create a post, uploading its image first if there is one.
    ///
    /// The post is only written once the upload has produced a URL; a failed
    /// upload leaves no post behind.
    pub fn create_post(&self, new: NewPost) -> Result<Post> {
        let content = non_empty(&new.content, "post")?.to_string();
        let actor = self.actor()?;
        self.require::<UserProfile>(&actor.id)?;

        let image_url = match &new.image {
            Some(image) => Some(self.retry.run("upload image", || {
                self.blobs
                    .upload(&image.name, &image.bytes, &image.content_type)
            })?),
            None => None,
        };

        let post = Post {
            id: DocumentId::generate(),
            author_id: actor.id,
            content,
            created_at: Timestamp::now(),
            comment_count: 0,
            image_url,
        };
        self.write_new(&post)?;

        info!(post = %post.id, with_image = post.image_url.is_some(), "post created");
        Ok(post)
    }

    /// Mark one of the current user's tickets as read. Never resets it.
    pub fn acknowledge_ticket(&self, ticket_id: &DocumentId) -> Result<SupportTicket> {
        let actor = self.actor()?;
        let ticket = self.require::<SupportTicket>(ticket_id)?;
        if ticket.user_id != actor.id {
            return Err(SyncError::PermissionDenied(format!(
                "ticket {} belongs to another user",
                ticket_id
            )));
        }
        if ticket.read {
            return Ok(ticket);
        }

        let mut fields = Fields::new();
        fields.insert("read".to_string(), true.into());
        let doc = self.retry.run("acknowledge ticket", || {
            self.store
                .update_fields(SupportTicket::COLLECTION, ticket_id, fields.clone())
        })?;
        self.cache.put_entity(&doc);
        doc.decode()
    }

    // --- Helpers ---

    fn actor(&self) -> Result<CurrentUser> {
        self.identity
            .current_user()
            .ok_or(SyncError::Unauthenticated)
    }

    fn fetch<T: Entity>(&self, id: &DocumentId) -> Result<Option<T>> {
        let doc: Option<Document> = self
            .retry
            .run("read", || self.store.get(T::COLLECTION, id))?;
        match doc {
            Some(doc) => {
                self.cache.put_entity(&doc);
                doc.decode().map(Some)
            }
            None => Ok(None),
        }
    }

    fn require<T: Entity>(&self, id: &DocumentId) -> Result<T> {
        self.fetch(id)?
            .ok_or_else(|| SyncError::not_found(T::COLLECTION, id))
    }

    fn write_new<T: Entity>(&self, entity: &T) -> Result<Document> {
        let fields = entity.to_fields()?;
        let doc = self.retry.run("create", || {
            self.store
                .create(T::COLLECTION, entity.id(), fields.clone())
        })?;
        self.cache.put_entity(&doc);
        Ok(doc)
    }
}

fn non_empty<'a>(content: &'a str, what: &str) -> Result<&'a str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation(format!("{} content is empty", what)));
    }
    Ok(trimmed)
}
