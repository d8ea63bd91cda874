//! Main SyncEngine struct tying all components together.

use crate::blobs::BlobUploader;
use crate::cache::{LocalCache, DEFAULT_MAX_FANOUT};
use crate::counters::{AggregateCounter, CounterStrategy, Reconciliation};
use crate::error::{Result, SyncError};
use crate::identity::IdentityProvider;
use crate::mutations::{MutationCoordinator, NewPost, RetryPolicy};
use crate::notifications::{active_tickets_query, NotificationTracker};
use crate::remote::{QueryDescriptor, RemoteStore};
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionManager};
use crate::types::{Collection, Comment, CurrentUser, DocumentId, Entity, Post, SupportTicket};
use crate::views::{comments_query, CollectionView, CommentThread};
use std::sync::Arc;
use tracing::info;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Live query delivery settings.
    pub subscription: SubscriptionConfig,

    /// How `commentCount` updates reach the store.
    pub counter_strategy: CounterStrategy,

    /// Retry policy for idempotent store calls.
    pub retry: RetryPolicy,

    /// Entity cache size (number of documents).
    pub entity_cache_size: usize,

    /// Most reference lookups run at once when resolving a view.
    pub max_fanout: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subscription: SubscriptionConfig::default(),
            counter_strategy: CounterStrategy::default(),
            retry: RetryPolicy::default(),
            entity_cache_size: 1000,
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }
}

/// Client-side synchronization engine.
///
/// Provides a unified interface for:
/// - Live queries over the remote store
/// - Joined read models (comment threads, collections)
/// - Multi-step mutations with counter maintenance
/// - The unread support-ticket indicator
pub struct SyncEngine {
    config: EngineConfig,

    store: Arc<dyn RemoteStore>,

    identity: Arc<dyn IdentityProvider>,

    /// Snapshot and entity cache (shared with subscriptions and mutations).
    cache: Arc<LocalCache>,

    subscriptions: SubscriptionManager,

    counter: Arc<AggregateCounter>,

    mutations: MutationCoordinator,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RemoteStore>,
        blobs: Arc<dyn BlobUploader>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let cache = Arc::new(
            LocalCache::new(Arc::clone(&store), config.entity_cache_size)
                .with_max_fanout(config.max_fanout),
        );
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            config.subscription.clone(),
        );
        let counter = Arc::new(AggregateCounter::new(
            Arc::clone(&store),
            config.counter_strategy,
        ));
        let mutations = MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&counter),
            blobs,
            Arc::clone(&identity),
            config.retry.clone(),
        );

        info!(strategy = ?config.counter_strategy, "sync engine started");
        Self {
            config,
            store,
            identity,
            cache,
            subscriptions,
            counter,
            mutations,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn counter(&self) -> &AggregateCounter {
        &self.counter
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.identity.current_user()
    }

    // ==================== Live queries ====================

    pub fn subscribe(&self, query: &QueryDescriptor) -> Result<SubscriptionHandle> {
        self.config
            .retry
            .run("subscribe", || self.subscriptions.subscribe(query))
    }

    /// Live comments of a post, newest first, with commenter profiles.
    pub fn watch_comments(&self, post_id: &DocumentId) -> Result<CommentThread> {
        let handle = self.subscribe(&comments_query(post_id))?;
        Ok(CommentThread::new(handle, Arc::clone(&self.cache)))
    }

    /// Unread indicator for the signed-in user's active tickets.
    pub fn watch_notifications(&self) -> Result<NotificationTracker> {
        let user = self
            .identity
            .current_user()
            .ok_or(SyncError::Unauthenticated)?;
        let handle = self.subscribe(&active_tickets_query(&user.id))?;
        Ok(NotificationTracker::new(handle))
    }

    // ==================== One-shot reads ====================

    /// Load a collection and resolve its media concurrently.
    pub fn load_collection(&self, id: &DocumentId) -> Result<CollectionView> {
        let doc = self
            .config
            .retry
            .run("load collection", || self.store.get(Collection::COLLECTION, id))?
            .ok_or_else(|| SyncError::not_found(Collection::COLLECTION, id))?;
        self.cache.put_entity(&doc);
        CollectionView::resolve(&self.cache, doc.decode()?)
    }

    // ==================== Mutations ====================

    pub fn create_comment(&self, post_id: &DocumentId, content: &str) -> Result<Comment> {
        self.mutations.create_comment(post_id, content)
    }

    pub fn delete_comment(&self, comment_id: &DocumentId) -> Result<()> {
        self.mutations.delete_comment(comment_id)
    }

    pub fn create_post(&self, new: NewPost) -> Result<Post> {
        self.mutations.create_post(new)
    }

    pub fn acknowledge_ticket(&self, ticket_id: &DocumentId) -> Result<SupportTicket> {
        self.mutations.acknowledge_ticket(ticket_id)
    }

    // ==================== Maintenance ====================

    pub fn reconcile(&self, post_id: &DocumentId) -> Result<Reconciliation> {
        let result = self.counter.reconcile(post_id)?;
        if result.drifted() {
            self.cache.forget_entity(Post::COLLECTION, post_id);
        }
        Ok(result)
    }

    /// Recount every post, returning the counters that were repaired.
    pub fn reconcile_all(&self) -> Result<Vec<Reconciliation>> {
        let repaired = self.counter.reconcile_all()?;
        for result in &repaired {
            self.cache.forget_entity(Post::COLLECTION, &result.post);
        }
        Ok(repaired)
    }

    /// Sign out, closing every live query and dropping cached state.
    pub fn sign_out(&self) -> Result<()> {
        self.identity.sign_out()?;
        self.subscriptions.close_all();
        self.cache.clear();
        info!("signed out");
        Ok(())
    }
}
