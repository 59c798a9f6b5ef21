//! Fresh subscribe, not retroactive, not missing: only live messages
//! posted after subscribe are delivered (`spec.md` §8).

use std::sync::Arc;
use std::time::Duration;

use message_tracker::chat::{ChatChannel, ChatMessage};
use message_tracker::store::memory::MemoryStore;
use message_tracker::test_support::{wait_until, FakeChatClient, RecordingSubscriber};
use message_tracker::{Engine, EngineConfig, Scope, Snowflake};

fn sf(n: u64) -> Snowflake {
    Snowflake(n)
}

fn msg(id: u64, channel_id: u64) -> ChatMessage {
    ChatMessage { id: sf(id), channel_id: sf(channel_id), thread_parent_id: None, guild_id: 1 }
}

#[tokio::test(flavor = "multi_thread")]
async fn only_live_messages_after_subscribe_are_delivered() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: None });
    chat.post_message(msg(100, 1));

    let engine = Engine::new(store, chat.clone(), EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe("math", Scope::Global, subscriber.clone(), false, false).await.unwrap();

    chat.post_message(msg(300, 1));
    engine.on_message(msg(300, 1));

    assert!(wait_until(Duration::from_secs(2), || subscriber.received_ids() == vec![sf(300)]).await);
}
