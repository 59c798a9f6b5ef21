//! Postgres-backed [`Store`], grounded on the repository pattern used by the
//! pack's chat-server reference (`query_as` against row models, errors
//! mapped to a crate-local type, `#[instrument]` on every method).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::error::StoreError;
use crate::model::{Channel, ChannelRequest, ChannelState, ThreadRequest};
use crate::snowflake::Snowflake;

use super::{Store, StoreTransaction};

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_db_error(err: sqlx::Error) -> StoreError {
    StoreError::Sqlx(err)
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    id: i64,
    guild_id: i64,
    reachable: bool,
}

impl From<ChannelRow> for Channel {
    fn from(r: ChannelRow) -> Self {
        Channel {
            guild_id: r.guild_id as u64,
            id: Snowflake(r.id as u64),
            reachable: r.reachable,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChannelStateRow {
    channel_id: i64,
    subscriber: String,
    last_message_id: i64,
    earliest_thread_archive_ts: Option<DateTime<Utc>>,
}

impl From<ChannelStateRow> for ChannelState {
    fn from(r: ChannelStateRow) -> Self {
        ChannelState {
            channel_id: Snowflake(r.channel_id as u64),
            subscriber: r.subscriber,
            last_message_id: Snowflake(r.last_message_id as u64),
            earliest_thread_archive_ts: r.earliest_thread_archive_ts,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChannelRequestRow {
    id: i64,
    channel_id: i64,
    subscriber: String,
    after_snowflake: i64,
    before_snowflake: i64,
}

impl From<ChannelRequestRow> for ChannelRequest {
    fn from(r: ChannelRequestRow) -> Self {
        ChannelRequest {
            id: r.id,
            channel_id: Snowflake(r.channel_id as u64),
            subscriber: r.subscriber,
            after_snowflake: Snowflake(r.after_snowflake as u64),
            before_snowflake: Snowflake(r.before_snowflake as u64),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ThreadRequestRow {
    id: i64,
    channel_id: i64,
    thread_id: i64,
    subscriber: String,
    after_snowflake: i64,
    before_snowflake: i64,
}

impl From<ThreadRequestRow> for ThreadRequest {
    fn from(r: ThreadRequestRow) -> Self {
        ThreadRequest {
            id: r.id,
            channel_id: Snowflake(r.channel_id as u64),
            thread_id: Snowflake(r.thread_id as u64),
            subscriber: r.subscriber,
            after_snowflake: Snowflake(r.after_snowflake as u64),
            before_snowflake: Snowflake(r.before_snowflake as u64),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self))]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(map_db_error)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO message_tracker.channels (id, guild_id, reachable)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(channel.id.get() as i64)
        .bind(channel.guild_id as i64)
        .bind(channel.reachable)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn channel(&self, channel_id: Snowflake) -> Result<Option<Channel>, StoreError> {
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, guild_id, reachable FROM message_tracker.channels WHERE id = $1",
        )
        .bind(channel_id.get() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.map(Channel::from))
    }

    #[instrument(skip(self))]
    async fn all_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelRow>("SELECT id, guild_id, reachable FROM message_tracker.channels")
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Channel::from).collect())
    }

    #[instrument(skip(self))]
    async fn mark_channel_reachable(&self, channel_id: Snowflake, reachable: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE message_tracker.channels SET reachable = $2 WHERE id = $1")
            .bind(channel_id.get() as i64)
            .bind(reachable)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_guild_unreachable(&self, guild_id: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE message_tracker.channels SET reachable = FALSE WHERE guild_id = $1")
            .bind(guild_id as i64)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn upsert_channel_state(&self, state: &ChannelState) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO message_tracker.channel_states
                (channel_id, subscriber, last_message_id, earliest_thread_archive_ts)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (channel_id, subscriber) DO NOTHING",
        )
        .bind(state.channel_id.get() as i64)
        .bind(&state.subscriber)
        .bind(state.last_message_id.get() as i64)
        .bind(state.earliest_thread_archive_ts)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn channel_state(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
    ) -> Result<Option<ChannelState>, StoreError> {
        let row = sqlx::query_as::<_, ChannelStateRow>(
            "SELECT channel_id, subscriber, last_message_id, earliest_thread_archive_ts
             FROM message_tracker.channel_states WHERE channel_id = $1 AND subscriber = $2",
        )
        .bind(channel_id.get() as i64)
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.map(ChannelState::from))
    }

    #[instrument(skip(self))]
    async fn states_for_subscriber(&self, subscriber: &str) -> Result<Vec<ChannelState>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelStateRow>(
            "SELECT channel_id, subscriber, last_message_id, earliest_thread_archive_ts
             FROM message_tracker.channel_states WHERE subscriber = $1",
        )
        .bind(subscriber)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ChannelState::from).collect())
    }

    #[instrument(skip(self, subscribers))]
    async fn states_for_channel(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
    ) -> Result<Vec<ChannelState>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelStateRow>(
            "SELECT channel_id, subscriber, last_message_id, earliest_thread_archive_ts
             FROM message_tracker.channel_states
             WHERE channel_id = $1 AND subscriber = ANY($2)",
        )
        .bind(channel_id.get() as i64)
        .bind(subscribers)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ChannelState::from).collect())
    }

    #[instrument(skip(self, subscribers))]
    async fn advance_last_message_id(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
        msg_id: Snowflake,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE message_tracker.channel_states
             SET last_message_id = GREATEST(last_message_id, $3)
             WHERE channel_id = $1 AND subscriber = ANY($2)",
        )
        .bind(channel_id.get() as i64)
        .bind(subscribers)
        .bind(msg_id.get() as i64)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_archive_watermark(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE message_tracker.channel_states SET earliest_thread_archive_ts = $3
             WHERE channel_id = $1 AND subscriber = $2",
        )
        .bind(channel_id.get() as i64)
        .bind(subscriber)
        .bind(ts)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn states_with_archive_watermark_after(
        &self,
        channel_id: Snowflake,
        ts: DateTime<Utc>,
    ) -> Result<Vec<ChannelState>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelStateRow>(
            "SELECT channel_id, subscriber, last_message_id, earliest_thread_archive_ts
             FROM message_tracker.channel_states
             WHERE channel_id = $1 AND earliest_thread_archive_ts > $2",
        )
        .bind(channel_id.get() as i64)
        .bind(ts)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ChannelState::from).collect())
    }

    #[instrument(skip(self))]
    async fn insert_channel_request(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO message_tracker.channel_requests
                (channel_id, subscriber, after_snowflake, before_snowflake)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(channel_id.get() as i64)
        .bind(subscriber)
        .bind(after.get() as i64)
        .bind(before.get() as i64)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn insert_thread_request(
        &self,
        channel_id: Snowflake,
        thread_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO message_tracker.thread_requests
                (channel_id, thread_id, subscriber, after_snowflake, before_snowflake)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(channel_id.get() as i64)
        .bind(thread_id.get() as i64)
        .bind(subscriber)
        .bind(after.get() as i64)
        .bind(before.get() as i64)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_channel_request(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_tracker.channel_requests WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_thread_request(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_tracker.thread_requests WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shrink_channel_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        sqlx::query("UPDATE message_tracker.channel_requests SET before_snowflake = $2 WHERE id = $1")
            .bind(id)
            .bind(new_before.get() as i64)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shrink_thread_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        sqlx::query("UPDATE message_tracker.thread_requests SET before_snowflake = $2 WHERE id = $1")
            .bind(id)
            .bind(new_before.get() as i64)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_thread_requests_for_thread(&self, thread_id: Snowflake) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_tracker.thread_requests WHERE thread_id = $1")
            .bind(thread_id.get() as i64)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    #[instrument(skip(self, subscribers))]
    async fn reachable_states_with_pending_archive_scan(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ChannelState>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelStateRow>(
            "SELECT s.channel_id, s.subscriber, s.last_message_id, s.earliest_thread_archive_ts
             FROM message_tracker.channel_states s
             JOIN message_tracker.channels c ON c.id = s.channel_id
             WHERE c.reachable AND s.subscriber = ANY($1) AND s.earliest_thread_archive_ts IS NOT NULL",
        )
        .bind(subscribers)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ChannelState::from).collect())
    }

    #[instrument(skip(self, subscribers))]
    async fn reachable_channel_requests(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ChannelRequest>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelRequestRow>(
            "SELECT r.id, r.channel_id, r.subscriber, r.after_snowflake, r.before_snowflake
             FROM message_tracker.channel_requests r
             JOIN message_tracker.channels c ON c.id = r.channel_id
             WHERE c.reachable AND r.subscriber = ANY($1)",
        )
        .bind(subscribers)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ChannelRequest::from).collect())
    }

    #[instrument(skip(self, subscribers))]
    async fn reachable_thread_requests(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ThreadRequest>, StoreError> {
        let rows = sqlx::query_as::<_, ThreadRequestRow>(
            "SELECT r.id, r.channel_id, r.thread_id, r.subscriber, r.after_snowflake, r.before_snowflake
             FROM message_tracker.thread_requests r
             JOIN message_tracker.channels c ON c.id = r.channel_id
             WHERE c.reachable AND r.subscriber = ANY($1)",
        )
        .bind(subscribers)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ThreadRequest::from).collect())
    }

    #[instrument(skip(self, subscribers))]
    async fn overlapping_channel_requests(
        &self,
        subscribers: &[String],
        channel_id: Snowflake,
        max_before: Snowflake,
    ) -> Result<Vec<ChannelRequest>, StoreError> {
        // Recursive walk: start at the request with the smallest before >=
        // max_before, then keep pulling in any earlier request whose before
        // is still >= the running minimum after. See `spec.md` §4.4.
        // The recursive term can't carry its own ORDER BY/LIMIT (Postgres
        // rejects that outright), so each step's "pick the next one" is
        // pushed into a LATERAL subquery instead — the same trick the
        // original reaches for with SQLAlchemy's `.lateral()`.
        let rows = sqlx::query_as::<_, ChannelRequestRow>(
            r#"
            WITH RECURSIVE first(after_snowflake) AS (
                SELECT after_snowflake FROM message_tracker.channel_requests
                WHERE channel_id = $1 AND subscriber = ANY($2) AND before_snowflake >= $3
                ORDER BY before_snowflake LIMIT 1
                UNION
                SELECT next.after_snowflake
                FROM first
                CROSS JOIN LATERAL (
                    SELECT r.after_snowflake
                    FROM message_tracker.channel_requests r
                    WHERE r.channel_id = $1 AND r.subscriber = ANY($2)
                      AND r.before_snowflake >= first.after_snowflake
                    ORDER BY r.before_snowflake
                    LIMIT 1
                ) AS next
            )
            SELECT id, channel_id, subscriber, after_snowflake, before_snowflake
            FROM message_tracker.channel_requests
            WHERE channel_id = $1 AND subscriber = ANY($2)
              AND before_snowflake <= $3
              AND after_snowflake >= (SELECT MIN(after_snowflake) FROM first)
            "#,
        )
        .bind(channel_id.get() as i64)
        .bind(subscribers)
        .bind(max_before.get() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ChannelRequest::from).collect())
    }

    #[instrument(skip(self, subscribers))]
    async fn overlapping_thread_requests(
        &self,
        subscribers: &[String],
        thread_id: Snowflake,
        max_before: Snowflake,
    ) -> Result<Vec<ThreadRequest>, StoreError> {
        // See the lateral-join note on `overlapping_channel_requests`: the
        // recursive term's "pick the next one" step has to live in a
        // LATERAL subquery, not as a bare ORDER BY/LIMIT on the term itself.
        let rows = sqlx::query_as::<_, ThreadRequestRow>(
            r#"
            WITH RECURSIVE first(after_snowflake) AS (
                SELECT after_snowflake FROM message_tracker.thread_requests
                WHERE thread_id = $1 AND subscriber = ANY($2) AND before_snowflake >= $3
                ORDER BY before_snowflake LIMIT 1
                UNION
                SELECT next.after_snowflake
                FROM first
                CROSS JOIN LATERAL (
                    SELECT r.after_snowflake
                    FROM message_tracker.thread_requests r
                    WHERE r.thread_id = $1 AND r.subscriber = ANY($2)
                      AND r.before_snowflake >= first.after_snowflake
                    ORDER BY r.before_snowflake
                    LIMIT 1
                ) AS next
            )
            SELECT id, channel_id, thread_id, subscriber, after_snowflake, before_snowflake
            FROM message_tracker.thread_requests
            WHERE thread_id = $1 AND subscriber = ANY($2)
              AND before_snowflake <= $3
              AND after_snowflake >= (SELECT MIN(after_snowflake) FROM first)
            "#,
        )
        .bind(thread_id.get() as i64)
        .bind(subscribers)
        .bind(max_before.get() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(ThreadRequest::from).collect())
    }

    #[instrument(skip(self))]
    async fn transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        Ok(Box::new(PgTransaction { tx: AsyncMutex::new(Some(tx)) }))
    }
}

/// A pending `sqlx` transaction. Queries need `&mut` access to the
/// underlying connection, so the handle serializes them behind an async
/// mutex rather than requiring `&mut self` up through the object-safe
/// [`StoreTransaction`] trait.
struct PgTransaction {
    tx: AsyncMutex<Option<Transaction<'static, Postgres>>>,
}

impl PgTransaction {
    async fn active(&self) -> Result<tokio::sync::MappedMutexGuard<'_, Transaction<'static, Postgres>>, StoreError> {
        let guard = self.tx.lock().await;
        tokio::sync::MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| StoreError::Invariant("transaction already committed".to_string()))
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query(
            "INSERT INTO message_tracker.channels (id, guild_id, reachable)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(channel.id.get() as i64)
        .bind(channel.guild_id as i64)
        .bind(channel.reachable)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn upsert_channel_state(&self, state: &ChannelState) -> Result<bool, StoreError> {
        let mut tx = self.active().await?;
        let result = sqlx::query(
            "INSERT INTO message_tracker.channel_states
                (channel_id, subscriber, last_message_id, earliest_thread_archive_ts)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (channel_id, subscriber) DO NOTHING",
        )
        .bind(state.channel_id.get() as i64)
        .bind(&state.subscriber)
        .bind(state.last_message_id.get() as i64)
        .bind(state.earliest_thread_archive_ts)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_channel_request(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query(
            "INSERT INTO message_tracker.channel_requests
                (channel_id, subscriber, after_snowflake, before_snowflake)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(channel_id.get() as i64)
        .bind(subscriber)
        .bind(after.get() as i64)
        .bind(before.get() as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn insert_thread_request(
        &self,
        channel_id: Snowflake,
        thread_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query(
            "INSERT INTO message_tracker.thread_requests
                (channel_id, thread_id, subscriber, after_snowflake, before_snowflake)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(channel_id.get() as i64)
        .bind(thread_id.get() as i64)
        .bind(subscriber)
        .bind(after.get() as i64)
        .bind(before.get() as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn advance_last_message_id(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
        msg_id: Snowflake,
    ) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query(
            "UPDATE message_tracker.channel_states
             SET last_message_id = GREATEST(last_message_id, $3)
             WHERE channel_id = $1 AND subscriber = ANY($2)",
        )
        .bind(channel_id.get() as i64)
        .bind(subscribers)
        .bind(msg_id.get() as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn set_archive_watermark(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query(
            "UPDATE message_tracker.channel_states SET earliest_thread_archive_ts = $3
             WHERE channel_id = $1 AND subscriber = $2",
        )
        .bind(channel_id.get() as i64)
        .bind(subscriber)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn delete_channel_request(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query("DELETE FROM message_tracker.channel_requests WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn delete_thread_request(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query("DELETE FROM message_tracker.thread_requests WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn shrink_channel_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query("UPDATE message_tracker.channel_requests SET before_snowflake = $2 WHERE id = $1")
            .bind(id)
            .bind(new_before.get() as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn shrink_thread_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        let mut tx = self.active().await?;
        sqlx::query("UPDATE message_tracker.thread_requests SET before_snowflake = $2 WHERE id = $1")
            .bind(id)
            .bind(new_before.get() as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let tx = self
            .tx
            .into_inner()
            .take()
            .ok_or_else(|| StoreError::Invariant("transaction already committed".to_string()))?;
        tx.commit().await.map_err(map_db_error)
    }
}
