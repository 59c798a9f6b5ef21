//! Reconnect catchup: ids posted while the engine was offline are
//! discovered via `on_ready` and eventually delivered (`spec.md` §8).

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
async fn reconnect_discovers_a_single_gap_request_and_delivers_it() {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(FakeChatClient::new());
    chat.add_channel(ChatChannel { guild_id: 1, id: sf(1), last_message_id: Some(sf(750)) });

    let engine = Engine::new(store.clone(), chat.clone(), EngineConfig::default());
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe("math", Scope::Global, subscriber.clone(), true, false).await.unwrap();

    // Messages arrive while "offline": only the chat library's history
    // sees them, no `on_message` is delivered.
    chat.post_message(msg(800));
    chat.post_message(msg(850));
    chat.post_message(msg(900));

    engine.on_ready().await.unwrap();

    let states = store.states_for_subscriber("math").await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].last_message_id, sf(900));

    assert!(wait_until(Duration::from_secs(2), || {
        let got = subscriber.received_ids();
        got.contains(&sf(900)) && got.contains(&sf(850)) && got.contains(&sf(800))
    })
    .await);
}
