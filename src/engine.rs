//! The engine: the single process-owned value gathering the persistence
//! layer, snapshot oracle, planner, worker, router, executor, and
//! registry (`spec.md` §9, Design Note 1 — no singletons).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tracing::instrument;

use crate::chat::{ChatChannel, ChatClient, ChatMessage, ChatThread, Subscriber};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::executor::Executor;
use crate::model::{Channel, ChannelState};
use crate::registry::{Registry, Scope};
use crate::router::Router;
use crate::snapshot::{approx_archival_ts, take_snapshot};
use crate::snowflake::Snowflake;
use crate::store::{Store, StoreTransaction};
use crate::worker::Worker;

/// The crate's public entry point. Construct once at startup, `run` it
/// alongside the consumer's own event loop, and call the `on_*`/
/// `subscribe`/`unsubscribe` methods from the chat library's event
/// handlers.
pub struct Engine {
    store: Arc<dyn Store>,
    chat: Arc<dyn ChatClient>,
    registry: Arc<RwLock<Registry>>,
    executor: Executor,
    executor_join: tokio::task::JoinHandle<()>,
    router: Router,
    worker: Arc<Worker>,
    worker_join: Mutex<Option<tokio::task::JoinHandle<()>>>,
    notify: Arc<Notify>,
    config: EngineConfig,
}

impl Engine {
    /// Builds the engine and spawns its two long-lived tasks (the
    /// serialized executor's consumer, and the backfill worker). Call
    /// `Store::ensure_schema` yourself before this if you need the schema
    /// created first — `Engine::new` does not do it implicitly, since a
    /// `MemoryStore` has nothing to create.
    pub fn new(store: Arc<dyn Store>, chat: Arc<dyn ChatClient>, config: EngineConfig) -> Self {
        let registry = Arc::new(RwLock::new(Registry::new()));
        let notify = Arc::new(Notify::new());
        let (executor, executor_join) = Executor::spawn();
        let last_archival_times: HashMap<Snowflake, DateTime<Utc>> = HashMap::new();
        let router = Router::new(
            store.clone(),
            registry.clone(),
            executor.clone(),
            notify.clone(),
            Arc::new(Mutex::new(last_archival_times)),
        );
        let worker = Arc::new(Worker::new(store.clone(), chat.clone(), registry.clone(), config.clone(), notify.clone()));
        let worker_handle = worker.clone();
        let worker_join = tokio::spawn(async move { worker_handle.run().await });

        Self {
            store,
            chat,
            registry,
            executor,
            executor_join,
            router,
            worker,
            worker_join: Mutex::new(Some(worker_join)),
            notify,
            config,
        }
    }

    /// Ensures the schema exists. Call once at startup before any other
    /// method, when running against a real database.
    pub async fn ensure_schema(&self) -> Result<(), Error> {
        self.store.ensure_schema().await.map_err(Error::Store)
    }

    /// Registers `callback` under `name` for the given `scope`. See
    /// `spec.md` §4.7 and §6 for the exact semantics of `missing` and
    /// `retroactive`.
    ///
    /// Known race (preserved from the source, not resolved — see
    /// `spec.md` §9 and `DESIGN.md`): if a live `on_message` is already
    /// queued on the executor for a message this subscribe's snapshot
    /// also observes, both the live router and this retroactive scan may
    /// deliver it, since subscribers must already tolerate redelivery.
    #[instrument(skip(self, callback))]
    pub async fn subscribe(
        &self,
        name: &str,
        scope: Scope,
        callback: Arc<dyn Subscriber>,
        missing: bool,
        retroactive: bool,
    ) -> Result<(), Error> {
        let channels_in_scope = self.channels_in_scope(scope);

        // Fetched up front (outside the serialized executor, like
        // `channels_in_scope` above) since `HistorySource::archived_threads`
        // is async and the registry's own `subscribe` runs inside a plain
        // closure scheduled onto the executor.
        let mut archived_first_pages: HashMap<Snowflake, Vec<ChatThread>> = HashMap::new();
        if retroactive {
            for channel in &channels_in_scope {
                let page = self
                    .chat
                    .channel(channel.id)
                    .archived_threads(self.config.archive_page_size, Utc::now())
                    .await
                    .unwrap_or_default();
                archived_first_pages.insert(channel.id, page);
            }
        }
        let last_archival_times = self.router.last_archival_times();

        let chat = self.chat.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let name = name.to_string();

        self.executor
            .schedule_and_wait(move || async move {
                let mut registry = registry.write().await;
                registry
                    .subscribe(
                        store.as_ref(),
                        &name,
                        scope,
                        callback,
                        missing,
                        retroactive,
                        &channels_in_scope,
                        |channel_id| chat.live_threads(channel_id),
                        &archived_first_pages,
                        &last_archival_times,
                    )
                    .await
            })
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Removes `name`'s callback from `scope`. Persistent cursors are
    /// untouched, so a future resubscribe resumes cleanly.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, name: &str, scope: Scope) {
        let registry = self.registry.clone();
        let name = name.to_string();
        self.executor
            .schedule_and_wait(move || async move {
                registry.write().await.unsubscribe(&name, scope);
            })
            .await;
    }

    fn channels_in_scope(&self, scope: Scope) -> Vec<ChatChannel> {
        match scope {
            Scope::Global => self.chat.visible_channels(),
            Scope::Guild(guild_id) => self.chat.visible_channels_in_guild(guild_id),
            Scope::Channel(channel_id) => self
                .chat
                .visible_channels()
                .into_iter()
                .filter(|c| c.id == channel_id)
                .collect(),
        }
    }

    /// A live message arrived.
    pub fn on_message(&self, msg: ChatMessage) {
        self.router.on_message(msg);
    }

    /// A thread came back from the archive.
    pub fn on_thread_unarchived(&self, thread: ChatThread, prior_archive_ts: DateTime<Utc>) {
        self.router.on_thread_unarchived(thread, prior_archive_ts);
    }

    /// A thread was archived.
    pub fn on_thread_archived(&self, thread: ChatThread) {
        self.router.on_thread_archived(thread);
    }

    /// A channel's permissions changed.
    pub fn on_channel_permission_updated(&self, channel_id: Snowflake) {
        self.router.on_channel_permission_updated(channel_id);
    }

    /// A new top-level channel appeared.
    pub fn on_channel_created(&self, channel: ChatChannel) {
        self.router.on_channel_created(channel);
    }

    /// A top-level channel vanished.
    pub fn on_channel_deleted(&self, channel_id: Snowflake) {
        self.router.on_channel_deleted(channel_id);
    }

    /// Called from the chat library's `ready`/reconnect handler: reconciles
    /// reachability for every known channel against what is currently
    /// visible, creates a `Channel`/`ChannelState` for every channel first
    /// observed at this reconnect (for every global/guild subscriber, the
    /// same as a live `on_channel_created` would have — `spec.md` §3,
    /// "reconnect scan" as a channel-creation trigger), and catches up
    /// every `missing`/`retroactive` subscriber on every channel (and its
    /// live or newly-archived threads) they're subscribed to.
    #[instrument(skip(self))]
    pub async fn on_ready(&self) -> Result<(), Error> {
        let visible_channels = self.chat.visible_channels();
        let visible: HashMap<Snowflake, ChatChannel> =
            visible_channels.iter().cloned().map(|c| (c.id, c)).collect();
        let snapshot = take_snapshot(&visible_channels, |channel_id| self.chat.live_threads(channel_id));

        let mut known_ids: std::collections::HashSet<Snowflake> = std::collections::HashSet::new();
        for known in self.store.all_channels().await.map_err(Error::Store)? {
            known_ids.insert(known.id);
            let now_visible = visible.contains_key(&known.id);
            if known.reachable && !now_visible {
                self.store.mark_channel_reachable(known.id, false).await.map_err(Error::Store)?;
            } else if !known.reachable && now_visible {
                self.store.mark_channel_reachable(known.id, true).await.map_err(Error::Store)?;
            }
        }

        // A channel visible now but absent from the store was created (or
        // simply never seen) while this process was disconnected: seed it
        // for every global/guild subscriber exactly as `on_channel_created`
        // would, since a globally-subscribed subscriber that was offline at
        // creation would otherwise never get a cursor and silently lose
        // every message the channel has ever had (`spec.md` §8 property 1).
        let new_channels: Vec<&ChatChannel> =
            visible_channels.iter().filter(|c| !known_ids.contains(&c.id)).collect();
        if !new_channels.is_empty() {
            let registry = self.registry.read().await;
            let global_names = registry.global_names();
            drop(registry);

            let tx = self.store.transaction().await.map_err(Error::Store)?;
            for channel in &new_channels {
                tx.upsert_channel(&Channel { guild_id: channel.guild_id, id: channel.id, reachable: true })
                    .await
                    .map_err(Error::Store)?;

                let mut subscribers = global_names.clone();
                subscribers.extend(self.registry.read().await.guild_names(channel.guild_id));
                subscribers.sort();
                subscribers.dedup();

                let high_water = snapshot.channel(channel.id).unwrap_or(channel.id);
                let archive_page = self
                    .chat
                    .channel(channel.id)
                    .archived_threads(self.config.archive_page_size, Utc::now())
                    .await
                    .unwrap_or_default();
                let last_archival_times = self.router.last_archival_times();
                let archive_ts = {
                    let cache = last_archival_times.lock().unwrap();
                    approx_archival_ts(channel.id, &cache, &archive_page)
                };

                for name in &subscribers {
                    tx.upsert_channel_state(&ChannelState {
                        channel_id: channel.id,
                        subscriber: name.clone(),
                        last_message_id: high_water,
                        earliest_thread_archive_ts: archive_ts,
                    })
                    .await
                    .map_err(Error::Store)?;
                }
            }
            tx.commit().await.map_err(Error::Store)?;
        }

        let active = self.registry.read().await.active_subscribers();
        let tx = self.store.transaction().await.map_err(Error::Store)?;
        for name in &active {
            for channel in visible.values() {
                let Some(state) = self.store.channel_state(channel.id, name).await.map_err(Error::Store)? else {
                    continue;
                };
                let high_water = snapshot.channel(channel.id).unwrap_or(channel.id);
                let mut new_watermark = state.last_message_id;

                if state.last_message_id < high_water {
                    tx.insert_channel_request(
                        channel.id,
                        name,
                        Snowflake(state.last_message_id.get() + 1),
                        Snowflake(high_water.get() + 1),
                    )
                    .await
                    .map_err(Error::Store)?;
                    new_watermark = high_water;
                }

                if let Some(threads) = snapshot.threads(channel.id) {
                    for (&thread_id, &thread_high_water) in threads {
                        if thread_high_water > state.last_message_id {
                            tx.insert_thread_request(
                                channel.id,
                                thread_id,
                                name,
                                Snowflake(state.last_message_id.get() + 1),
                                Snowflake(thread_high_water.get() + 1),
                            )
                            .await
                            .map_err(Error::Store)?;
                        }
                        if thread_high_water > new_watermark {
                            new_watermark = thread_high_water;
                        }
                    }
                }

                // Archived-thread catch-up: threads that archived while this
                // process was disconnected never show up in `live_threads`,
                // so they're only visible through a direct archived-threads
                // page read, mirroring `process_ready`'s `find_archived_threads`.
                if let Some(watermark) = state.earliest_thread_archive_ts {
                    let page = self
                        .chat
                        .channel(channel.id)
                        .archived_threads(self.config.archive_page_size, Utc::now())
                        .await
                        .unwrap_or_default();
                    for thread in &page {
                        let Some(archive_ts) = thread.archive_timestamp else { continue };
                        if archive_ts < watermark {
                            continue;
                        }
                        if let Some(last_message_id) = thread.last_message_id {
                            if last_message_id > state.last_message_id {
                                tx.insert_thread_request(
                                    channel.id,
                                    thread.id,
                                    name,
                                    Snowflake(state.last_message_id.get() + 1),
                                    Snowflake(last_message_id.get() + 1),
                                )
                                .await
                                .map_err(Error::Store)?;
                            }
                        }
                    }
                }

                if new_watermark > state.last_message_id {
                    tx.advance_last_message_id(channel.id, &[name.clone()], new_watermark)
                        .await
                        .map_err(Error::Store)?;
                }
            }
        }
        tx.commit().await.map_err(Error::Store)?;

        self.notify.notify_one();
        Ok(())
    }

    /// Shuts the engine down: stops the worker, then drains and stops the
    /// executor, per `spec.md` §4.6/§5 ("executor drains its queue first,
    /// then exits").
    pub async fn shutdown(self) {
        if let Some(handle) = self.worker_join.lock().unwrap().take() {
            handle.abort();
        }
        drop(self.executor);
        let _ = self.executor_join.await;
    }
}
