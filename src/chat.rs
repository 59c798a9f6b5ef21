//! The chat-library interfaces the engine consumes. The bot's actual client
//! implements these traits; nothing in this module reaches the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::snowflake::Snowflake;

/// A message belonging to a single channel or thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    /// `Some` when this message was posted in a thread; carries the thread's
    /// parent (top-level) channel id.
    pub thread_parent_id: Option<Snowflake>,
    pub guild_id: u64,
}

impl ChatMessage {
    /// The top-level channel this message is tracked under: a thread's
    /// parent, or the message's own channel.
    pub fn tracked_channel_id(&self) -> Snowflake {
        self.thread_parent_id.unwrap_or(self.channel_id)
    }
}

/// A live or archived thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatThread {
    pub id: Snowflake,
    pub parent_id: Snowflake,
    pub last_message_id: Option<Snowflake>,
    pub archived: bool,
    pub archive_timestamp: Option<DateTime<Utc>>,
}

/// A top-level, watchable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChannel {
    pub guild_id: u64,
    pub id: Snowflake,
    pub last_message_id: Option<Snowflake>,
}

/// Failure reading history, archived threads, or fetching a channel.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("chat library error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A handle to one channel or thread's message history, as returned by
/// [`ChatClient::channel`] / [`ChatClient::fetch_thread`].
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` messages strictly before `before`, newest first.
    async fn history(
        &self,
        limit: u32,
        before: Snowflake,
    ) -> Result<Vec<ChatMessage>, HistoryError>;

    /// Up to `limit` archived threads with `archive_timestamp < before`,
    /// newest-archived first. Only meaningful on top-level channels.
    async fn archived_threads(
        &self,
        limit: u32,
        before: DateTime<Utc>,
    ) -> Result<Vec<ChatThread>, HistoryError>;
}

/// Failure returned by a subscriber's callback; opaque to the engine,
/// which only needs to know that redelivery is owed.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber's delivery callback: a single async method taking a batch
/// of messages from one channel or thread. Tagged-trait style — no
/// reflection, per the design note this follows.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_messages(&self, msgs: &[ChatMessage]) -> Result<(), CallbackError>;
}

/// The subset of the chat library the engine needs: guild/channel/thread
/// enumeration and history access.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Every top-level channel currently visible, across every guild.
    fn visible_channels(&self) -> Vec<ChatChannel>;

    /// Every top-level channel currently visible in one guild.
    fn visible_channels_in_guild(&self, guild_id: u64) -> Vec<ChatChannel>;

    /// Whether `guild_id` itself is still visible to this client — distinct
    /// from any one channel's reachability, since a guild the bot was
    /// removed from takes every one of its channels down at once.
    fn is_guild_visible(&self, guild_id: u64) -> bool;

    /// The live (non-archived) threads currently visible under `channel_id`.
    fn live_threads(&self, channel_id: Snowflake) -> Vec<ChatThread>;

    /// A handle for reading history out of a top-level channel.
    fn channel(&self, channel_id: Snowflake) -> Box<dyn HistorySource>;

    /// A handle for reading history out of a thread, or `NotFound` if the
    /// thread no longer exists or is inaccessible.
    async fn fetch_thread(&self, thread_id: Snowflake) -> Result<Box<dyn HistorySource>, HistoryError>;
}
