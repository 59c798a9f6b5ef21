//! Reachability: the worker never pulls history for a channel marked
//! unreachable, and pulls resume once it's marked reachable again
//! (`spec.md` §8, testable property 6).

use std::sync::Arc;
use std::time::Duration;

use message_tracker::chat::ChatChannel;
use message_tracker::store::memory::MemoryStore;
use message_tracker::store::Store;
use message_tracker::test_support::{wait_until, FakeChatClient, RecordingSubscriber};
use message_tracker::{Engine, EngineConfig, Scope, Snowflake};

fn sf(n: u64) -> Snowflake {
    Snowflake(n)
}

fn msg(id: u64) -> message_tracker::ChatMessage {
    message_tracker::ChatMessage { id: sf(id), channel_id: sf(1), thread_parent_id: None, guild_id: 1 }
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_channel_blocks_pulls_until_permission_restored() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });
    chat.post_message(msg(10));
    chat.post_message(msg(20));

    let engine = Engine::new(store.clone(), chat.clone(), EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    // retroactive=true queues a channel request covering the existing history.
    engine.subscribe("math", Scope::Global, subscriber.clone(), false, true).await.unwrap();

    // Mark the channel unreachable before the worker has a chance to act,
    // as if a permission change raced the subscribe.
    store.mark_channel_reachable(sf(1), false).await.unwrap();

    // Give the worker a window in which it could (incorrectly) deliver.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(subscriber.received_ids().is_empty(), "unreachable channel must not be pulled");

    // Reachability restored: the existing request is still queued and the
    // worker picks it up on its next notified iteration.
    engine.on_channel_permission_updated(sf(1));

    assert!(wait_until(Duration::from_secs(2), || {
        let got = subscriber.received_ids();
        got.contains(&sf(10)) && got.contains(&sf(20))
    })
    .await);
}

#[tokio::test(flavor = "multi_thread")]
async fn forbidden_history_fetch_marks_channel_unreachable() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });
    chat.post_message(msg(10));
    chat.mark_unreachable(sf(1));

    let engine = Engine::new(store.clone(), chat, EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe("math", Scope::Global, subscriber.clone(), false, true).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        matches!(futures::executor::block_on(store.channel(sf(1))), Ok(Some(c)) if !c.reachable)
    })
    .await);
    assert!(subscriber.received_ids().is_empty());
}
