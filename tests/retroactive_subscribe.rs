//! Subscribe with `retroactive=true`: channel history {10, 20, 30} is
//! replayed to the subscriber in descending order (`spec.md` §8).

use std::sync::Arc;
use std::time::Duration;

use message_tracker::chat::ChatChannel;
use message_tracker::store::memory::MemoryStore;
use message_tracker::test_support::{wait_until, FakeChatClient, RecordingSubscriber};
use message_tracker::{Engine, EngineConfig, Scope, Snowflake};

fn sf(n: u64) -> Snowflake {
    Snowflake(n)
}

fn msg(id: u64, channel_id: u64) -> message_tracker::ChatMessage {
    message_tracker::ChatMessage { id: sf(id), channel_id: sf(channel_id), thread_parent_id: None, guild_id: 1 }
}

#[tokio::test(flavor = "multi_thread")]
async fn retroactive_replay_is_descending() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });
    chat.post_message(msg(10, 1));
    chat.post_message(msg(20, 1));
    chat.post_message(msg(30, 1));

    let engine = Engine::new(store, chat, EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe("math", Scope::Global, subscriber.clone(), false, true).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || subscriber.received_ids() == vec![sf(30), sf(20), sf(10)]).await);
}
