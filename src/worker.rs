//! The backfill worker: a single long-lived task that executes whatever
//! the planner selects (`spec.md` §4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tracing::{error, info, instrument, warn};

use crate::chat::{ChatClient, ChatMessage, HistoryError};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::planner;
use crate::registry::Registry;
use crate::snowflake::Snowflake;
use crate::store::{Store, StoreTransaction, Work};

/// The subset of a descending (newest-first) history page whose ids fall
/// in the half-open range `[after, before)`. Mirrors `index_after_msg_desc`
/// / `bisect_right` in the original: `idx_from` is the first index whose
/// id is `< before`, `idx_to` is the first index whose id is `< after`.
fn slice_range(page: &[ChatMessage], after: Snowflake, before: Snowflake) -> &[ChatMessage] {
    let idx_from = page.partition_point(|m| m.id >= before);
    let idx_to = page.partition_point(|m| m.id >= after);
    &page[idx_from..idx_to]
}

pub struct Worker {
    store: Arc<dyn Store>,
    chat: Arc<dyn ChatClient>,
    registry: Arc<RwLock<Registry>>,
    config: EngineConfig,
    notify: Arc<Notify>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        chat: Arc<dyn ChatClient>,
        registry: Arc<RwLock<Registry>>,
        config: EngineConfig,
        notify: Arc<Notify>,
    ) -> Self {
        Self { store, chat, registry, config, notify }
    }

    /// Runs until cancelled. Idles on `notify` between iterations; after a
    /// persistence error, sleeps an exponentially growing backoff instead
    /// (reset to the base on the next successful iteration).
    pub async fn run(&self) {
        let mut backoff_exponent: u32 = 0;
        loop {
            match self.tick().await {
                Ok(true) => {
                    backoff_exponent = 0;
                    self.notify.notify_one();
                }
                Ok(false) => {
                    backoff_exponent = 0;
                    self.notify.notified().await;
                }
                Err(err) => {
                    error!(error = %err, "backfill worker iteration failed, backing off");
                    let delay = self.config.backoff_base * 2u32.saturating_pow(backoff_exponent);
                    backoff_exponent = backoff_exponent.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One planner call plus its dispatch. `Ok(true)` if work was done
    /// (more may remain), `Ok(false)` if the planner found nothing.
    #[instrument(skip(self))]
    async fn tick(&self) -> Result<bool, Error> {
        let active = self.registry.read().await.active_subscribers();
        let Some(work) = planner::select_work(self.store.as_ref(), &active).await? else {
            return Ok(false);
        };

        let channel_id = match &work {
            Work::ThreadArchiveScan { channel_id } => *channel_id,
            Work::ChannelHistoryPull { channel_id, .. } => *channel_id,
            Work::ThreadHistoryPull { channel_id, .. } => *channel_id,
        };
        // Mirrors the original's guild-gone check ahead of every fetch
        // (`fetch_task`): a guild the bot can no longer see takes every one
        // of its channels down at once, which a per-channel `NotFound`/
        // `Forbidden` from a single history call would never catch.
        if let Some(channel) = self.store.channel(channel_id).await? {
            if !self.chat.is_guild_visible(channel.guild_id) {
                warn!(guild_id = channel.guild_id, "guild no longer visible, marking its channels unreachable");
                self.store.mark_guild_unreachable(channel.guild_id).await?;
                return Ok(true);
            }
        }

        match work {
            Work::ThreadArchiveScan { channel_id } => self.scan_thread_archive(channel_id, &active).await?,
            Work::ChannelHistoryPull { channel_id, before } => {
                self.pull_channel_history(channel_id, before, &active).await?
            }
            Work::ThreadHistoryPull { channel_id, thread_id, before } => {
                self.pull_thread_history(channel_id, thread_id, before, &active).await?
            }
        }
        Ok(true)
    }

    #[instrument(skip(self, active))]
    async fn scan_thread_archive(&self, channel_id: Snowflake, active: &[String]) -> Result<(), Error> {
        let states: Vec<_> = self
            .store
            .states_for_channel(channel_id, active)
            .await?
            .into_iter()
            .filter(|s| s.earliest_thread_archive_ts.is_some())
            .collect();
        let Some(max_ts) = states.iter().filter_map(|s| s.earliest_thread_archive_ts).max() else {
            return Ok(());
        };

        let page = match self
            .chat
            .channel(channel_id)
            .archived_threads(self.config.archive_page_size, max_ts)
            .await
        {
            Ok(page) => page,
            Err(HistoryError::NotFound | HistoryError::Forbidden) => {
                warn!(%channel_id, "archived-threads listing failed, marking channel unreachable");
                self.store.mark_channel_reachable(channel_id, false).await?;
                return Ok(());
            }
            Err(other) => return Err(Error::Chat(other)),
        };

        if page.is_empty() {
            for state in &states {
                self.store.set_archive_watermark(channel_id, &state.subscriber, None).await?;
            }
            return Ok(());
        }

        for state in &states {
            let watermark = state.earliest_thread_archive_ts.expect("filtered above");
            for thread in &page {
                let archive_ts = thread.archive_timestamp.expect("archived thread always carries a timestamp");
                if archive_ts < watermark {
                    if let Some(last_message_id) = thread.last_message_id {
                        self.store
                            .insert_thread_request(
                                channel_id,
                                thread.id,
                                &state.subscriber,
                                thread.id,
                                Snowflake(last_message_id.get() + 1),
                            )
                            .await?;
                    }
                }
            }
        }

        let oldest_ts = page.iter().filter_map(|t| t.archive_timestamp).min().expect("page is non-empty");
        for state in &states {
            self.store.set_archive_watermark(channel_id, &state.subscriber, Some(oldest_ts)).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, active))]
    async fn pull_channel_history(
        &self,
        channel_id: Snowflake,
        before: Snowflake,
        active: &[String],
    ) -> Result<(), Error> {
        let overlapping = self.store.overlapping_channel_requests(active, channel_id, before).await?;
        let Some(max_before) = overlapping.iter().map(|r| r.before_snowflake).max() else {
            return Ok(());
        };
        let min_after = overlapping.iter().map(|r| r.after_snowflake).min().expect("non-empty above");

        let mut page = match self.chat.channel(channel_id).history(self.config.history_page_size, max_before).await {
            Ok(page) => page,
            Err(HistoryError::NotFound | HistoryError::Forbidden) => {
                warn!(%channel_id, "channel history fetch failed, marking channel unreachable");
                self.store.mark_channel_reachable(channel_id, false).await?;
                return Ok(());
            }
            Err(other) => return Err(Error::Chat(other)),
        };
        // Stop at the first id below every overlapping request's `after`:
        // mirrors the original's `break` inside its history iterator.
        page.truncate(page.partition_point(|m| m.id >= min_after));

        let mut first_callback_error = None;
        let tx = self.store.transaction().await?;
        for req in &overlapping {
            let slice = slice_range(&page, req.after_snowflake, req.before_snowflake);
            let idx_to = page.partition_point(|m| m.id >= req.after_snowflake);

            let delivered = if slice.is_empty() {
                true
            } else {
                match self.deliver(&req.subscriber, slice).await {
                    Ok(()) => true,
                    Err(e) => {
                        first_callback_error.get_or_insert(e);
                        false
                    }
                }
            };
            if !delivered {
                continue;
            }

            if page.is_empty() || idx_to < page.len() {
                tx.delete_channel_request(req.id).await?;
            } else if let Some(oldest) = page.last() {
                tx.shrink_channel_request(req.id, oldest.id).await?;
            }
        }
        tx.commit().await?;

        if let Some(e) = first_callback_error {
            return Err(Error::Callback(e));
        }
        Ok(())
    }

    #[instrument(skip(self, active))]
    async fn pull_thread_history(
        &self,
        channel_id: Snowflake,
        thread_id: Snowflake,
        before: Snowflake,
        active: &[String],
    ) -> Result<(), Error> {
        let overlapping = self.store.overlapping_thread_requests(active, thread_id, before).await?;
        let Some(max_before) = overlapping.iter().map(|r| r.before_snowflake).max() else {
            return Ok(());
        };
        let min_after = overlapping.iter().map(|r| r.after_snowflake).min().expect("non-empty above");

        let thread = match self.chat.fetch_thread(thread_id).await {
            Ok(handle) => handle,
            Err(HistoryError::NotFound) => {
                warn!(%thread_id, "thread gone, dropping its outstanding requests");
                self.store.delete_thread_requests_for_thread(thread_id).await?;
                return Ok(());
            }
            Err(HistoryError::Forbidden) => {
                warn!(%channel_id, "thread fetch forbidden, marking parent channel unreachable");
                self.store.mark_channel_reachable(channel_id, false).await?;
                return Ok(());
            }
            Err(other) => return Err(Error::Chat(other)),
        };
        let mut page = thread.history(self.config.history_page_size, max_before).await.map_err(Error::Chat)?;
        page.truncate(page.partition_point(|m| m.id >= min_after));

        let mut first_callback_error = None;
        let tx = self.store.transaction().await?;
        for req in &overlapping {
            let slice = slice_range(&page, req.after_snowflake, req.before_snowflake);
            let idx_to = page.partition_point(|m| m.id >= req.after_snowflake);

            let delivered = if slice.is_empty() {
                true
            } else {
                match self.deliver(&req.subscriber, slice).await {
                    Ok(()) => true,
                    Err(e) => {
                        first_callback_error.get_or_insert(e);
                        false
                    }
                }
            };
            if !delivered {
                continue;
            }

            if page.is_empty() || idx_to < page.len() {
                tx.delete_thread_request(req.id).await?;
            } else if let Some(oldest) = page.last() {
                tx.shrink_thread_request(req.id, oldest.id).await?;
            }
        }
        tx.commit().await?;

        if let Some(e) = first_callback_error {
            return Err(Error::Callback(e));
        }
        Ok(())
    }

    async fn deliver(&self, subscriber: &str, msgs: &[ChatMessage]) -> Result<(), String> {
        let callback = self.registry.read().await.callback(subscriber);
        match callback {
            Some(cb) => cb.on_messages(msgs).await.map_err(|e| e.to_string()),
            None => {
                info!(subscriber, "dropping backfill delivery, subscriber no longer registered");
                Ok(())
            }
        }
    }
}
