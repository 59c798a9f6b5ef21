//! The persistence layer: four tables, transactional helpers, nothing else.
//!
//! `Store` is the leaf dependency of the engine — it knows nothing about
//! the planner, worker, router, or registry that call it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Channel, ChannelRequest, ChannelState, ThreadRequest};
use crate::snowflake::Snowflake;

/// One unit of backfill work, as selected by the three-tier priority query
/// described in `spec.md` §4.3. Returned by [`Store::reachable_states_with_pending_archive_scan`]
/// et al.; the planner picks among the three tiers, the store only answers
/// "what's the best candidate in this tier".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    ThreadArchiveScan { channel_id: Snowflake },
    ChannelHistoryPull { channel_id: Snowflake, before: Snowflake },
    ThreadHistoryPull { channel_id: Snowflake, thread_id: Snowflake, before: Snowflake },
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create the schema if it does not already exist. Idempotent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    // -- Channel -------------------------------------------------------

    /// Insert `channel` if no row with this id exists yet. Does not touch
    /// `reachable` on an existing row.
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError>;

    async fn channel(&self, channel_id: Snowflake) -> Result<Option<Channel>, StoreError>;

    async fn all_channels(&self) -> Result<Vec<Channel>, StoreError>;

    async fn mark_channel_reachable(&self, channel_id: Snowflake, reachable: bool) -> Result<(), StoreError>;

    async fn mark_guild_unreachable(&self, guild_id: u64) -> Result<(), StoreError>;

    // -- ChannelState ----------------------------------------------------

    /// Insert a cursor for `(channel_id, subscriber)` if one doesn't already
    /// exist. Returns `true` if a row was inserted.
    async fn upsert_channel_state(&self, state: &ChannelState) -> Result<bool, StoreError>;

    async fn channel_state(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
    ) -> Result<Option<ChannelState>, StoreError>;

    async fn states_for_subscriber(&self, subscriber: &str) -> Result<Vec<ChannelState>, StoreError>;

    /// Cursors for every subscriber in `subscribers` that has one on `channel_id`.
    async fn states_for_channel(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
    ) -> Result<Vec<ChannelState>, StoreError>;

    /// `last_message_id = max(last_message_id, msg_id)` for every subscriber
    /// in `subscribers` that has a cursor on `channel_id`.
    async fn advance_last_message_id(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
        msg_id: Snowflake,
    ) -> Result<(), StoreError>;

    async fn set_archive_watermark(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Cursors on `channel_id` whose archive watermark is later than `ts` —
    /// i.e. subscribers who had already scanned past a thread that just
    /// unarchived.
    async fn states_with_archive_watermark_after(
        &self,
        channel_id: Snowflake,
        ts: DateTime<Utc>,
    ) -> Result<Vec<ChannelState>, StoreError>;

    // -- Requests ----------------------------------------------------------

    async fn insert_channel_request(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError>;

    async fn insert_thread_request(
        &self,
        channel_id: Snowflake,
        thread_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError>;

    async fn delete_channel_request(&self, id: i64) -> Result<(), StoreError>;

    async fn delete_thread_request(&self, id: i64) -> Result<(), StoreError>;

    async fn shrink_channel_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError>;

    async fn shrink_thread_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError>;

    async fn delete_thread_requests_for_thread(&self, thread_id: Snowflake) -> Result<(), StoreError>;

    // -- Planner tier candidates -------------------------------------------

    /// Tier 1 candidates: reachable channels' states with a non-null archive
    /// watermark, restricted to `subscribers`.
    async fn reachable_states_with_pending_archive_scan(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ChannelState>, StoreError>;

    /// Tier 2 candidates: channel requests on reachable channels, restricted
    /// to `subscribers`.
    async fn reachable_channel_requests(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ChannelRequest>, StoreError>;

    /// Tier 3 candidates: thread requests on reachable channels, restricted
    /// to `subscribers`.
    async fn reachable_thread_requests(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ThreadRequest>, StoreError>;

    // -- Worker overlapping-request selection ------------------------------

    /// All channel requests for `channel_id` (any of `subscribers`) whose
    /// range overlaps the contiguous run starting at the request with
    /// `before >= max_before`, per the recursive walk in `spec.md` §4.4.
    async fn overlapping_channel_requests(
        &self,
        subscribers: &[String],
        channel_id: Snowflake,
        max_before: Snowflake,
    ) -> Result<Vec<ChannelRequest>, StoreError>;

    async fn overlapping_thread_requests(
        &self,
        subscribers: &[String],
        thread_id: Snowflake,
        max_before: Snowflake,
    ) -> Result<Vec<ThreadRequest>, StoreError>;

    // -- Transactions --------------------------------------------------

    /// Begins a unit of work covering the mutations in [`StoreTransaction`]:
    /// none of them are visible to other callers until
    /// [`StoreTransaction::commit`] runs, and none of them persist at all
    /// if the handle is dropped first. Mirrors the original's
    /// `async with sessionmaker() as session: ...; await session.commit()`,
    /// used wherever a caller issues more than one mutation that must land
    /// together (`spec.md` §4.1).
    async fn transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// The subset of [`Store`]'s mutating methods needed inside a single unit
/// of work. Reads are intentionally not part of this trait: every call
/// site reads current committed state through the plain [`Store`] handle
/// before opening a transaction, then only issues writes through it, so
/// no transactional read-your-own-writes support is needed.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError>;

    async fn upsert_channel_state(&self, state: &ChannelState) -> Result<bool, StoreError>;

    async fn insert_channel_request(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError>;

    async fn insert_thread_request(
        &self,
        channel_id: Snowflake,
        thread_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError>;

    async fn advance_last_message_id(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
        msg_id: Snowflake,
    ) -> Result<(), StoreError>;

    async fn set_archive_watermark(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn delete_channel_request(&self, id: i64) -> Result<(), StoreError>;

    async fn delete_thread_request(&self, id: i64) -> Result<(), StoreError>;

    async fn shrink_channel_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError>;

    async fn shrink_thread_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError>;

    /// Commits every mutation issued through this handle. Dropping the
    /// handle instead rolls them all back.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
