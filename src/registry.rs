//! The subscription registry: subscriber name → callback, scoped globally,
//! by guild, or by channel, plus the fetch map of subscribers owed
//! persistent backfill (`spec.md` §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use crate::chat::{ChatChannel, ChatThread, Subscriber};
use crate::error::Error;
use crate::model::{Channel, ChannelState};
use crate::router::LastArchivalTimes;
use crate::snapshot::{approx_archival_ts, take_snapshot};
use crate::snowflake::Snowflake;
use crate::store::{Store, StoreTransaction};

/// Which channels a subscription applies to. Kept free of a `ChatClient`
/// dependency: the caller resolves `channels_in_scope` from the live
/// client and passes it in, per the dependency-order leaves-first
/// structure of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Guild(u64),
    Channel(Snowflake),
}

#[derive(Default)]
pub struct Registry {
    global: HashMap<String, Arc<dyn Subscriber>>,
    guild: HashMap<u64, HashMap<String, Arc<dyn Subscriber>>>,
    channel: HashMap<Snowflake, HashMap<String, Arc<dyn Subscriber>>>,
    fetch_map: HashMap<String, Arc<dyn Subscriber>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subscriber whose callback would fire for a message in
    /// `channel_id`/`guild_id`: the union of global, guild, and
    /// channel-scoped maps.
    pub fn subscribers_for_channel(&self, guild_id: u64, channel_id: Snowflake) -> HashMap<String, Arc<dyn Subscriber>> {
        let mut out = self.global.clone();
        if let Some(g) = self.guild.get(&guild_id) {
            out.extend(g.clone());
        }
        if let Some(c) = self.channel.get(&channel_id) {
            out.extend(c.clone());
        }
        out
    }

    /// Subscribers with a callback registered anywhere, restricted to
    /// those also in the fetch map — the set the planner/worker may work
    /// on behalf of.
    pub fn active_subscribers(&self) -> Vec<String> {
        self.fetch_map.keys().cloned().collect()
    }

    /// Subscribers registered at global scope, by name.
    pub fn global_names(&self) -> Vec<String> {
        self.global.keys().cloned().collect()
    }

    /// Subscribers registered at guild scope for `guild_id`, by name.
    pub fn guild_names(&self, guild_id: u64) -> Vec<String> {
        self.guild.get(&guild_id).map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.fetch_map.contains_key(name)
    }

    /// The callback registered for `name`, if any, regardless of scope.
    pub fn callback(&self, name: &str) -> Option<Arc<dyn Subscriber>> {
        self.fetch_map
            .get(name)
            .or_else(|| self.global.get(name))
            .or_else(|| self.guild.values().find_map(|m| m.get(name)))
            .or_else(|| self.channel.values().find_map(|m| m.get(name)))
            .cloned()
    }

    fn insert_scoped(&mut self, name: &str, scope: Scope, callback: Arc<dyn Subscriber>) {
        match scope {
            Scope::Global => {
                self.global.insert(name.to_string(), callback);
            }
            Scope::Guild(guild_id) => {
                self.guild.entry(guild_id).or_default().insert(name.to_string(), callback);
            }
            Scope::Channel(channel_id) => {
                self.channel.entry(channel_id).or_default().insert(name.to_string(), callback);
            }
        }
    }

    fn remove_scoped(&mut self, name: &str, scope: Scope) {
        match scope {
            Scope::Global => {
                self.global.remove(name);
            }
            Scope::Guild(guild_id) => {
                if let Some(m) = self.guild.get_mut(&guild_id) {
                    m.remove(name);
                }
            }
            Scope::Channel(channel_id) => {
                if let Some(m) = self.channel.get_mut(&channel_id) {
                    m.remove(name);
                }
            }
        }
    }

    /// Steps 1-5 of `spec.md` §4.7's `subscribe`. Always called from
    /// inside the serialized executor.
    ///
    /// Mirrors the original's `subscribe`: when neither `missing` nor
    /// `retroactive` is set, the callback is registered for live events
    /// only and no store work happens at all (the original never calls
    /// `process_subscription` in that case).
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, store, callback, channels_in_scope, live_threads, archived_first_pages, last_archival_times))]
    pub async fn subscribe(
        &mut self,
        store: &dyn Store,
        name: &str,
        scope: Scope,
        callback: Arc<dyn Subscriber>,
        missing: bool,
        retroactive: bool,
        channels_in_scope: &[ChatChannel],
        live_threads: impl Fn(Snowflake) -> Vec<ChatThread>,
        archived_first_pages: &HashMap<Snowflake, Vec<ChatThread>>,
        last_archival_times: &LastArchivalTimes,
    ) -> Result<(), Error> {
        if missing || retroactive {
            // The snapshot oracle is the only source of "current high-water"
            // here, per `spec.md` §4.2 — no per-channel inline recomputation.
            let snapshot = take_snapshot(channels_in_scope, &live_threads);
            let tx = store.transaction().await?;

            for channel in channels_in_scope {
                tx.upsert_channel(&Channel { guild_id: channel.guild_id, id: channel.id, reachable: true })
                    .await?;

                let high_water = snapshot.channel(channel.id).unwrap_or(channel.id);
                let existing = store.channel_state(channel.id, name).await?;

                match existing {
                    None => {
                        let archive_ts = if retroactive {
                            let first_page =
                                archived_first_pages.get(&channel.id).map(|v| v.as_slice()).unwrap_or(&[]);
                            let cache = last_archival_times.lock().unwrap();
                            approx_archival_ts(channel.id, &cache, first_page)
                        } else {
                            None
                        };
                        tx.upsert_channel_state(&ChannelState {
                            channel_id: channel.id,
                            subscriber: name.to_string(),
                            last_message_id: high_water,
                            earliest_thread_archive_ts: archive_ts,
                        })
                        .await?;

                        if retroactive {
                            if channel.id < high_water {
                                tx.insert_channel_request(channel.id, name, channel.id, Snowflake(high_water.get() + 1))
                                    .await?;
                            }
                            if let Some(threads) = snapshot.threads(channel.id) {
                                for (&thread_id, &thread_high_water) in threads {
                                    tx.insert_thread_request(
                                        channel.id,
                                        thread_id,
                                        name,
                                        thread_id,
                                        Snowflake(thread_high_water.get() + 1),
                                    )
                                    .await?;
                                }
                            }
                        }
                    }
                    Some(state) => {
                        let mut new_watermark = state.last_message_id;

                        if state.last_message_id < high_water {
                            tx.insert_channel_request(
                                channel.id,
                                name,
                                Snowflake(state.last_message_id.get() + 1),
                                Snowflake(high_water.get() + 1),
                            )
                            .await?;
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
                                    .await?;
                                }
                                if thread_high_water > new_watermark {
                                    new_watermark = thread_high_water;
                                }
                            }
                        }
                        if new_watermark > state.last_message_id {
                            tx.advance_last_message_id(channel.id, &[name.to_string()], new_watermark).await?;
                        }

                        // A one-time archived-thread catch-up is owed whenever this
                        // subscriber's scan was previously marked complete (`None`)
                        // but a reconnect gap was just discovered: re-arm the
                        // watermark so the ordinary ThreadArchiveScan tier picks it
                        // up on the next worker iteration, rather than scanning
                        // inline here.
                        if state.earliest_thread_archive_ts.is_none() && new_watermark > state.last_message_id {
                            let now = chrono::Utc::now();
                            tx.set_archive_watermark(channel.id, name, Some(now)).await?;
                        }
                    }
                }
            }

            tx.commit().await?;
        }

        self.insert_scoped(name, scope, callback.clone());
        if missing || retroactive {
            self.fetch_map.insert(name.to_string(), callback);
        }
        Ok(())
    }

    /// `spec.md` §4.7's `unsubscribe`: removes the callback, leaves
    /// persistent cursors alone so a future resubscribe picks up cleanly.
    #[instrument(skip(self))]
    pub fn unsubscribe(&mut self, name: &str, scope: Scope) {
        self.remove_scoped(name, scope);
        self.fetch_map.remove(name);
    }
}
