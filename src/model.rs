//! The four persisted record types described in the data model.

use chrono::{DateTime, Utc};

use crate::snowflake::Snowflake;

/// A top-level channel the engine has ever observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub guild_id: u64,
    pub id: Snowflake,
    pub reachable: bool,
}

/// Per-(channel, subscriber) cursor: what has been delivered so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub channel_id: Snowflake,
    pub subscriber: String,
    /// Greatest id, in the channel or any of its threads, the subscriber
    /// is known to have seen or been queued for.
    pub last_message_id: Snowflake,
    /// While `Some`, the engine still owes this subscriber an archived-thread
    /// scan older than this timestamp. `None` means archival is fully scanned.
    pub earliest_thread_archive_ts: Option<DateTime<Utc>>,
}

/// An outstanding commitment to deliver `[after, before)` in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub id: i64,
    pub channel_id: Snowflake,
    pub subscriber: String,
    /// Inclusive.
    pub after_snowflake: Snowflake,
    /// Exclusive.
    pub before_snowflake: Snowflake,
}

/// An outstanding commitment to deliver `[after, before)` inside one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRequest {
    pub id: i64,
    pub channel_id: Snowflake,
    pub thread_id: Snowflake,
    pub subscriber: String,
    /// Inclusive.
    pub after_snowflake: Snowflake,
    /// Exclusive.
    pub before_snowflake: Snowflake,
}
