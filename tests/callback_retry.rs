//! Callback transient failure: the first live delivery of a message fails,
//! a one-message catch-up request is inserted, and the backfill worker
//! redelivers it exactly once more (`spec.md` §8).

use std::sync::Arc;
use std::time::Duration;

use message_tracker::chat::{ChatChannel, ChatMessage};
use message_tracker::store::memory::MemoryStore;
use message_tracker::test_support::{wait_until, FakeChatClient, RecordingSubscriber};
use message_tracker::{Engine, EngineConfig, Scope, Snowflake};

fn sf(n: u64) -> Snowflake {
    Snowflake(n)
}

fn msg(id: u64) -> ChatMessage {
    ChatMessage { id: sf(id), channel_id: sf(1), thread_parent_id: None, guild_id: 1 }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_live_delivery_is_redelivered_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });
    chat.post_message(msg(100));

    let engine = Engine::new(store, chat.clone(), EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    // missing=true so a cursor exists on this channel for "math" and the
    // live router's failure path has a state to attach a request to.
    engine.subscribe("math", Scope::Global, subscriber.clone(), true, false).await.unwrap();

    subscriber.fail_once_on(sf(500));
    chat.post_message(msg(500));
    engine.on_message(msg(500));

    assert!(wait_until(Duration::from_secs(2), || subscriber.received_ids() == vec![sf(500)]).await);

    // No further invocations once the backfill request is satisfied.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscriber.received_ids(), vec![sf(500)]);
}
