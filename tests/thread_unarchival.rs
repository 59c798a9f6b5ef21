//! Thread unarchival: whether a reconnect request is owed depends on
//! whether the subscriber's archive scan has already passed the thread's
//! prior archive timestamp (`spec.md` §8).

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use message_tracker::chat::{ChatChannel, ChatThread};
use message_tracker::store::memory::MemoryStore;
use message_tracker::store::Store;
use message_tracker::test_support::{FakeChatClient, RecordingSubscriber};
use message_tracker::{Engine, EngineConfig, Scope, Snowflake};

fn sf(n: u64) -> Snowflake {
    Snowflake(n)
}

#[tokio::test(flavor = "multi_thread")]
async fn unarchival_after_scan_completed_inserts_nothing() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });

    let engine = Engine::new(store.clone(), chat, EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    // Not retroactive: `earliest_thread_archive_ts` stays `None`, meaning
    // this subscriber's archive scan is considered fully caught up.
    engine.subscribe("math", Scope::Global, subscriber, true, false).await.unwrap();

    let prior_archive_ts = Utc::now() - ChronoDuration::minutes(5);
    let thread = ChatThread {
        id: sf(500),
        parent_id: sf(1),
        last_message_id: Some(sf(550)),
        archived: false,
        archive_timestamp: None,
    };
    engine.on_thread_unarchived(thread, prior_archive_ts);

    // Give the serialized executor a moment to process the scheduled work.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let requests = store.reachable_thread_requests(&["math".to_string()]).await.unwrap();
    assert!(requests.is_empty(), "no catch-up request expected once the scan watermark is null");
}

#[tokio::test(flavor = "multi_thread")]
async fn unarchival_before_scan_completed_inserts_a_catchup_request() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });

    let engine = Engine::new(store.clone(), chat, EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    // Retroactive: sets `earliest_thread_archive_ts` to `Some(now)`, i.e.
    // the subscriber's archive scan still owes everything older than now.
    engine.subscribe("math", Scope::Global, subscriber, false, true).await.unwrap();

    let prior_archive_ts = Utc::now() - ChronoDuration::minutes(5);
    let thread = ChatThread {
        id: sf(500),
        parent_id: sf(1),
        last_message_id: Some(sf(550)),
        archived: false,
        archive_timestamp: None,
    };
    engine.on_thread_unarchived(thread, prior_archive_ts);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let requests = store.reachable_thread_requests(&["math".to_string()]).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].thread_id, sf(500));
    assert_eq!(requests[0].after_snowflake, sf(500));
    assert_eq!(requests[0].before_snowflake, Snowflake::of_time(prior_archive_ts + ChronoDuration::milliseconds(1)));
}
