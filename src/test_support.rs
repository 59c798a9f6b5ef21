//! Scriptable fakes used by this crate's own tests and available to
//! integration tests under `tests/`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chat::{CallbackError, ChatChannel, ChatClient, ChatMessage, ChatThread, HistorySource, Subscriber};
use crate::snowflake::Snowflake;

#[derive(Default)]
struct ChannelScript {
    /// Messages in descending order (newest first), as a real history
    /// call would return them.
    messages: Vec<ChatMessage>,
    archived_threads: Vec<ChatThread>,
    live_threads: Vec<ChatThread>,
    unreachable: bool,
}

/// An in-memory `ChatClient` whose channel/thread contents and failure
/// behavior are scripted ahead of time, for deterministic tests.
#[derive(Default)]
pub struct FakeChatClient {
    channels: Mutex<HashMap<Snowflake, ChatChannel>>,
    channel_scripts: Mutex<HashMap<Snowflake, ChannelScript>>,
    thread_scripts: Mutex<HashMap<Snowflake, ChannelScript>>,
    threads_by_id: Mutex<HashMap<Snowflake, ChatThread>>,
    gone_guilds: Mutex<HashSet<u64>>,
}

impl FakeChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, channel: ChatChannel) {
        self.channels.lock().unwrap().insert(channel.id, channel);
    }

    /// Appends `msg` to the front of the channel's (or thread's) history,
    /// keeping it sorted newest-first, and updates the owning channel's
    /// cached `last_message_id`.
    pub fn post_message(&self, msg: ChatMessage) {
        let channel_id = msg.tracked_channel_id();
        let history_key = msg.thread_parent_id.map(|_| msg.channel_id).unwrap_or(channel_id);
        let mut scripts = if msg.thread_parent_id.is_some() {
            self.thread_scripts.lock().unwrap()
        } else {
            self.channel_scripts.lock().unwrap()
        };
        let script = scripts.entry(history_key).or_default();
        script.messages.insert(0, msg.clone());
        drop(scripts);

        let mut channels = self.channels.lock().unwrap();
        if let Some(c) = channels.get_mut(&channel_id) {
            c.last_message_id = Some(c.last_message_id.map_or(msg.id, |cur| cur.max(msg.id)));
        }
    }

    pub fn add_live_thread(&self, thread: ChatThread) {
        self.threads_by_id.lock().unwrap().insert(thread.id, thread.clone());
        self.channel_scripts.lock().unwrap().entry(thread.parent_id).or_default().live_threads.push(thread);
    }

    pub fn archive_thread(&self, channel_id: Snowflake, thread: ChatThread) {
        self.threads_by_id.lock().unwrap().insert(thread.id, thread.clone());
        self.channel_scripts
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .archived_threads
            .push(thread);
    }

    pub fn mark_unreachable(&self, channel_id: Snowflake) {
        self.channel_scripts.lock().unwrap().entry(channel_id).or_default().unreachable = true;
    }

    /// Simulates the bot losing access to an entire guild (kicked, guild
    /// deleted, ...), as distinct from a single channel's permissions
    /// changing.
    pub fn mark_guild_gone(&self, guild_id: u64) {
        self.gone_guilds.lock().unwrap().insert(guild_id);
    }
}

struct FakeHistorySource {
    messages: Vec<ChatMessage>,
    archived_threads: Vec<ChatThread>,
    unreachable: bool,
}

#[async_trait]
impl HistorySource for FakeHistorySource {
    async fn history(&self, limit: u32, before: Snowflake) -> Result<Vec<ChatMessage>, crate::chat::HistoryError> {
        if self.unreachable {
            return Err(crate::chat::HistoryError::Forbidden);
        }
        Ok(self
            .messages
            .iter()
            .filter(|m| m.id < before)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn archived_threads(
        &self,
        limit: u32,
        before: DateTime<Utc>,
    ) -> Result<Vec<ChatThread>, crate::chat::HistoryError> {
        if self.unreachable {
            return Err(crate::chat::HistoryError::Forbidden);
        }
        let mut threads: Vec<ChatThread> =
            self.archived_threads.iter().filter(|t| t.archive_timestamp.map_or(false, |ts| ts < before)).cloned().collect();
        threads.sort_by_key(|t| std::cmp::Reverse(t.archive_timestamp));
        threads.truncate(limit as usize);
        Ok(threads)
    }
}

#[async_trait]
impl ChatClient for FakeChatClient {
    fn visible_channels(&self) -> Vec<ChatChannel> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    fn visible_channels_in_guild(&self, guild_id: u64) -> Vec<ChatChannel> {
        self.channels.lock().unwrap().values().filter(|c| c.guild_id == guild_id).cloned().collect()
    }

    fn is_guild_visible(&self, guild_id: u64) -> bool {
        !self.gone_guilds.lock().unwrap().contains(&guild_id)
    }

    fn live_threads(&self, channel_id: Snowflake) -> Vec<ChatThread> {
        self.channel_scripts.lock().unwrap().get(&channel_id).map(|s| s.live_threads.clone()).unwrap_or_default()
    }

    fn channel(&self, channel_id: Snowflake) -> Box<dyn HistorySource> {
        let scripts = self.channel_scripts.lock().unwrap();
        let script = scripts.get(&channel_id);
        Box::new(FakeHistorySource {
            messages: script.map(|s| s.messages.clone()).unwrap_or_default(),
            archived_threads: script.map(|s| s.archived_threads.clone()).unwrap_or_default(),
            unreachable: script.map(|s| s.unreachable).unwrap_or(false),
        })
    }

    async fn fetch_thread(&self, thread_id: Snowflake) -> Result<Box<dyn HistorySource>, crate::chat::HistoryError> {
        if !self.threads_by_id.lock().unwrap().contains_key(&thread_id) {
            return Err(crate::chat::HistoryError::NotFound);
        }
        let scripts = self.thread_scripts.lock().unwrap();
        let script = scripts.get(&thread_id);
        Ok(Box::new(FakeHistorySource {
            messages: script.map(|s| s.messages.clone()).unwrap_or_default(),
            archived_threads: Vec::new(),
            unreachable: script.map(|s| s.unreachable).unwrap_or(false),
        }))
    }
}

/// A `Subscriber` that records every batch it's called with, and can be
/// scripted to fail on specific message ids.
#[derive(Default)]
pub struct RecordingSubscriber {
    received: Mutex<Vec<ChatMessage>>,
    fail_once_on: Mutex<Vec<Snowflake>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next delivery containing `id` will fail; subsequent ones
    /// succeed.
    pub fn fail_once_on(&self, id: Snowflake) {
        self.fail_once_on.lock().unwrap().push(id);
    }

    pub fn received(&self) -> Vec<ChatMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_ids(&self) -> Vec<Snowflake> {
        self.received.lock().unwrap().iter().map(|m| m.id).collect()
    }
}

/// Polls `condition` until it's true or `timeout` elapses, for tests that
/// exercise the engine's background worker/executor tasks and cannot
/// otherwise observe when an asynchronous delivery has landed.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    async fn on_messages(&self, msgs: &[ChatMessage]) -> Result<(), CallbackError> {
        {
            let mut fail_on = self.fail_once_on.lock().unwrap();
            if let Some(pos) = msgs.iter().position(|m| fail_on.contains(&m.id)) {
                let id = msgs[pos].id;
                fail_on.retain(|x| *x != id);
                return Err(format!("scripted failure on {id}").into());
            }
        }
        self.received.lock().unwrap().extend_from_slice(msgs);
        Ok(())
    }
}
