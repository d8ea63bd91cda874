//! Concurrent writers, readers and subscribers.

use docsync::{
    Comment, CounterStrategy, CurrentUser, DocumentId, EngineConfig, MemoryBlobStore,
    MemoryStore, Post, RetryPolicy, Role, StaticIdentity, SyncEngine, SyncError, Timestamp,
    UserProfile,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn engine_for(store: &Arc<MemoryStore>, user: &str, strategy: CounterStrategy) -> SyncEngine {
    let config = EngineConfig {
        counter_strategy: strategy,
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    };
    SyncEngine::new(
        config,
        store.clone(),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(StaticIdentity::signed_in(CurrentUser {
            id: DocumentId::new(user),
            display_name: user.to_string(),
            email: format!("{}@example.com", user),
            photo_url: None,
        })),
    )
}

fn seed_post(store: &MemoryStore, count: u64) -> DocumentId {
    let post = Post {
        id: DocumentId::new("p1"),
        author_id: DocumentId::new("alice"),
        content: "hello".into(),
        created_at: Timestamp::now(),
        comment_count: count,
        image_url: None,
    };
    store.insert(&post).unwrap();
    post.id
}

fn seed_profile(store: &MemoryStore, id: &str, role: Role) {
    store
        .insert(&UserProfile {
            id: DocumentId::new(id),
            display_name: id.to_string(),
            photo_url: None,
            role,
        })
        .unwrap();
}

/// `n` threads each add one comment to the same post, all starting together.
fn comment_storm(engine: &SyncEngine, post: &DocumentId, n: usize) {
    let start = Barrier::new(n);
    thread::scope(|s| {
        for i in 0..n {
            let start = &start;
            s.spawn(move || {
                start.wait();
                engine.create_comment(post, &format!("comment {}", i)).unwrap();
            });
        }
    });
}

#[test]
fn test_engine_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SyncEngine>();
}

#[test]
fn test_concurrent_comments_converge() {
    for strategy in [
        CounterStrategy::Atomic,
        CounterStrategy::CompareAndSwap { max_attempts: 1000 },
    ] {
        let store = Arc::new(MemoryStore::new());
        let post = seed_post(&store, 0);
        let engine = engine_for(&store, "alice", strategy);

        comment_storm(&engine, &post, 32);

        assert_eq!(store.count("comments"), 32);
        assert_eq!(engine.counter().current(&post).unwrap(), 32, "{:?}", strategy);
    }
}

#[test]
fn test_read_modify_write_undercounts() {
    let store = Arc::new(MemoryStore::new());
    let post = seed_post(&store, 0);
    let engine = engine_for(&store, "alice", CounterStrategy::ReadModifyWrite);

    // Each comment reads the post twice (existence check, counter read);
    // the gate lines every writer up on both reads.
    store.gate_reads("posts", Arc::new(Barrier::new(8)));
    comment_storm(&engine, &post, 8);
    store.clear_read_gate();

    assert_eq!(store.count("comments"), 8);
    assert_eq!(engine.counter().current(&post).unwrap(), 1);

    let drifted = engine.reconcile_all().unwrap();
    assert_eq!(drifted.len(), 1);
    assert_eq!(engine.counter().current(&post).unwrap(), 8);
}

#[test]
fn test_concurrent_deletes_decrement_once() {
    let store = Arc::new(MemoryStore::new());
    seed_profile(&store, "mod", Role::Moderator);
    let post = seed_post(&store, 2);
    for id in ["c1", "c2"] {
        store
            .insert(&Comment {
                id: DocumentId::new(id),
                post_id: post.clone(),
                user_id: DocumentId::new("bob"),
                content: "hi".into(),
                created_at: Timestamp::now(),
            })
            .unwrap();
    }
    let engine = engine_for(&store, "mod", CounterStrategy::Atomic);

    let target = DocumentId::new("c1");
    let start = Barrier::new(4);
    let results: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (start, engine, target) = (&start, &engine, &target);
                s.spawn(move || {
                    start.wait();
                    engine.delete_comment(target)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    // Late callers either see the comment gone or find it already deleted.
    assert!(results.iter().any(|r| r.is_ok()));
    for result in &results {
        assert!(matches!(result, Ok(()) | Err(SyncError::NotFound { .. })));
    }
    assert_eq!(store.count("comments"), 1);
    assert_eq!(engine.counter().current(&post).unwrap(), 1);
}

#[test]
fn test_profile_lookups_are_shared() {
    let store = Arc::new(MemoryStore::new());
    let post = seed_post(&store, 0);
    let users = ["alice", "bob", "carol"];
    for user in users {
        seed_profile(&store, user, Role::Member);
    }
    for i in 0..30 {
        store
            .insert(&Comment {
                id: DocumentId::new(format!("c{:02}", i)),
                post_id: post.clone(),
                user_id: DocumentId::new(users[i % users.len()]),
                content: format!("comment {}", i),
                created_at: Timestamp(i as i64),
            })
            .unwrap();
    }
    let engine = engine_for(&store, "alice", CounterStrategy::Atomic);

    let comments = engine.watch_comments(&post).unwrap();
    let view = comments.next_view(WAIT).unwrap().unwrap();

    assert_eq!(view.len(), 30);
    assert!(view.comments.iter().all(|c| c.author.is_some()));
    assert_eq!(view.comments[0].comment.id.as_str(), "c29");
    assert_eq!(engine.cache().lookup_count(), 3);
}

#[test]
fn test_many_watchers_share_one_pipeline() {
    let store = Arc::new(MemoryStore::new());
    seed_profile(&store, "alice", Role::Member);
    let post = seed_post(&store, 0);
    let engine = engine_for(&store, "alice", CounterStrategy::Atomic);

    let ready = Barrier::new(9);
    thread::scope(|s| {
        for _ in 0..8 {
            let (engine, post, ready) = (&engine, &post, &ready);
            s.spawn(move || {
                let comments = engine.watch_comments(post).unwrap();
                ready.wait();
                loop {
                    let view = comments.next_view(WAIT).unwrap().unwrap();
                    if view.len() == 1 {
                        assert!(view.comments[0].author.is_some());
                        break;
                    }
                }
            });
        }
        ready.wait();
        assert_eq!(engine.subscriptions().pipeline_count(), 1);
        engine.create_comment(&post, "for everyone").unwrap();
    });

    assert_eq!(engine.subscriptions().pipeline_count(), 0);
    assert_eq!(store.watch_count(), 0);
}
