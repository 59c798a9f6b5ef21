//! The live event router: dispatches live messages and channel/thread
//! transitions to subscribers, inserting catch-up requests on failure
//! (`spec.md` §4.5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::sync::{Notify, RwLock};
use tracing::{error, instrument};

use crate::chat::{ChatChannel, ChatMessage, ChatThread};
use crate::executor::Executor;
use crate::model::{Channel, ChannelState};
use crate::registry::Registry;
use crate::snowflake::Snowflake;
use crate::store::Store;

/// Per-channel cache of the latest archive timestamp this process has
/// observed, feeding the snapshot oracle so a future subscribe-with-
/// catchup doesn't redundantly re-scan already-indexed threads. Purely an
/// optimization — rebuilt from nothing on restart.
pub type LastArchivalTimes = Arc<Mutex<HashMap<Snowflake, DateTime<Utc>>>>;

pub struct Router {
    store: Arc<dyn Store>,
    registry: Arc<RwLock<Registry>>,
    executor: Executor,
    notify: Arc<Notify>,
    last_archival_times: LastArchivalTimes,
}

impl Router {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<RwLock<Registry>>,
        executor: Executor,
        notify: Arc<Notify>,
        last_archival_times: LastArchivalTimes,
    ) -> Self {
        Self { store, registry, executor, notify, last_archival_times }
    }

    pub fn last_archival_times(&self) -> LastArchivalTimes {
        self.last_archival_times.clone()
    }

    /// A message was posted. Routed through the executor so it cannot
    /// interleave with a concurrent subscription change for the same
    /// channel.
    #[instrument(skip(self, msg))]
    pub fn on_message(&self, msg: ChatMessage) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let notify = self.notify.clone();
        self.executor.schedule(move || Box::pin(Self::handle_message(store, registry, notify, msg)));
    }

    async fn handle_message(
        store: Arc<dyn Store>,
        registry: Arc<RwLock<Registry>>,
        notify: Arc<Notify>,
        msg: ChatMessage,
    ) {
        let channel_id = msg.tracked_channel_id();
        let subs = registry.read().await.subscribers_for_channel(msg.guild_id, channel_id);
        if subs.is_empty() {
            return;
        }

        let results = join_all(subs.iter().map(|(name, cb)| {
            let cb = cb.clone();
            let name = name.clone();
            let batch = [msg.clone()];
            async move { (name, cb.on_messages(&batch).await) }
        }))
        .await;

        for (name, result) in &results {
            let Err(err) = result else { continue };
            match store.channel_state(channel_id, name).await {
                Ok(Some(_)) => {
                    let insert_result = match msg.thread_parent_id {
                        Some(_) => {
                            store
                                .insert_thread_request(
                                    channel_id,
                                    msg.channel_id,
                                    name,
                                    msg.id,
                                    Snowflake(msg.id.get() + 1),
                                )
                                .await
                        }
                        None => {
                            store
                                .insert_channel_request(channel_id, name, msg.id, Snowflake(msg.id.get() + 1))
                                .await
                        }
                    };
                    if let Err(e) = insert_result {
                        error!(subscriber = %name, error = %e, "failed to record catch-up request after callback failure");
                    } else {
                        tracing::warn!(subscriber = %name, error = %err, "live delivery failed, catch-up request recorded");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(subscriber = %name, error = %e, "failed to check cursor after callback failure"),
            }
        }

        let names: Vec<String> = subs.keys().cloned().collect();
        if let Err(e) = store.advance_last_message_id(channel_id, &names, msg.id).await {
            error!(error = %e, "failed to advance cursor after live delivery");
        }
        notify.notify_one();
    }

    /// A previously archived thread came back. Subscribers whose archive
    /// scan had already passed this thread's archive timestamp (i.e. it
    /// would otherwise never be revisited) get a one-off catch-up request.
    #[instrument(skip(self))]
    pub fn on_thread_unarchived(&self, thread: ChatThread, prior_archive_ts: DateTime<Utc>) {
        let store = self.store.clone();
        let notify = self.notify.clone();
        self.executor
            .schedule(move || Box::pin(Self::handle_thread_unarchived(store, notify, thread, prior_archive_ts)));
    }

    async fn handle_thread_unarchived(
        store: Arc<dyn Store>,
        notify: Arc<Notify>,
        thread: ChatThread,
        prior_archive_ts: DateTime<Utc>,
    ) {
        let states = match store.states_with_archive_watermark_after(thread.parent_id, prior_archive_ts).await {
            Ok(states) => states,
            Err(e) => {
                error!(error = %e, "failed to look up states for unarchived thread");
                return;
            }
        };
        if states.is_empty() {
            return;
        }
        let before = Snowflake::of_time(prior_archive_ts + ChronoDuration::milliseconds(1));
        for state in states {
            if let Err(e) = store
                .insert_thread_request(thread.parent_id, thread.id, &state.subscriber, thread.id, before)
                .await
            {
                error!(subscriber = %state.subscriber, error = %e, "failed to record unarchival catch-up request");
            }
        }
        notify.notify_one();
    }

    /// A thread was archived. Updates the in-memory watermark cache only;
    /// no store mutation, no worker wake-up needed.
    #[instrument(skip(self))]
    pub fn on_thread_archived(&self, thread: ChatThread) {
        let cache = self.last_archival_times.clone();
        self.executor.schedule(move || {
            Box::pin(async move {
                let Some(ts) = thread.archive_timestamp else { return };
                let mut cache = cache.lock().unwrap();
                let entry = cache.entry(thread.parent_id).or_insert(ts);
                if ts > *entry {
                    *entry = ts;
                }
            })
        });
    }

    /// A permission update may have made a previously unreachable channel
    /// readable again.
    #[instrument(skip(self))]
    pub fn on_channel_permission_updated(&self, channel_id: Snowflake) {
        let store = self.store.clone();
        let notify = self.notify.clone();
        self.executor.schedule(move || {
            Box::pin(async move {
                if let Err(e) = store.mark_channel_reachable(channel_id, true).await {
                    error!(error = %e, "failed to mark channel reachable after permission update");
                }
                notify.notify_one();
            })
        });
    }

    /// A new top-level channel appeared. Every globally- or guild-
    /// subscribed subscriber gets a cursor starting at the channel's own
    /// id (it has no history yet).
    #[instrument(skip(self))]
    pub fn on_channel_created(&self, channel: ChatChannel) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        self.executor.schedule(move || Box::pin(Self::handle_channel_created(store, registry, channel)));
    }

    async fn handle_channel_created(store: Arc<dyn Store>, registry: Arc<RwLock<Registry>>, channel: ChatChannel) {
        if let Err(e) = store
            .upsert_channel(&Channel { guild_id: channel.guild_id, id: channel.id, reachable: true })
            .await
        {
            error!(error = %e, "failed to record newly created channel");
            return;
        }
        let mut subscribers = registry.read().await.global_names();
        subscribers.extend(registry.read().await.guild_names(channel.guild_id));
        subscribers.sort();
        subscribers.dedup();

        for name in subscribers {
            if let Err(e) = store
                .upsert_channel_state(&ChannelState {
                    channel_id: channel.id,
                    subscriber: name.clone(),
                    last_message_id: channel.id,
                    earliest_thread_archive_ts: None,
                })
                .await
            {
                error!(subscriber = %name, error = %e, "failed to create cursor for newly created channel");
            }
        }
    }

    /// A channel vanished: mark it unreachable so the planner skips it.
    #[instrument(skip(self))]
    pub fn on_channel_deleted(&self, channel_id: Snowflake) {
        let store = self.store.clone();
        self.executor.schedule(move || {
            Box::pin(async move {
                if let Err(e) = store.mark_channel_reachable(channel_id, false).await {
                    error!(error = %e, "failed to mark deleted channel unreachable");
                }
            })
        });
    }
}
