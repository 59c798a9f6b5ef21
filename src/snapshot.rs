//! The snapshot oracle: the only source of truth for "current high-water"
//! used elsewhere in the engine (`spec.md` §4.2).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::chat::{ChatChannel, ChatThread};
use crate::snowflake::Snowflake;

/// Approximate high-water snowflakes for a set of channels and their live
/// threads, as cheaply reported by the chat library.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub channel_high_water: HashMap<Snowflake, Snowflake>,
    pub thread_high_water: HashMap<Snowflake, HashMap<Snowflake, Snowflake>>,
}

impl Snapshot {
    pub fn channel(&self, channel_id: Snowflake) -> Option<Snowflake> {
        self.channel_high_water.get(&channel_id).copied()
    }

    pub fn threads(&self, channel_id: Snowflake) -> Option<&HashMap<Snowflake, Snowflake>> {
        self.thread_high_water.get(&channel_id)
    }
}

/// The greatest id the host library can cheaply report for each channel
/// and each of its live threads; falls back to the channel's or thread's
/// own id when no `last_message_id` is known (a safe lower bound, since a
/// snowflake never exceeds the id of the entity it names).
pub fn take_snapshot(channels: &[ChatChannel], live_threads: impl Fn(Snowflake) -> Vec<ChatThread>) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for channel in channels {
        let high_water = channel.last_message_id.unwrap_or(channel.id);
        snapshot.channel_high_water.insert(channel.id, high_water);

        let mut threads = HashMap::new();
        for thread in live_threads(channel.id) {
            let thread_high_water = thread.last_message_id.unwrap_or(thread.id);
            threads.insert(thread.id, thread_high_water);
        }
        snapshot.thread_high_water.insert(channel.id, threads);
    }
    snapshot
}

/// The archive-scan watermark to assign a freshly-observed channel state:
/// the in-memory cache of the latest archive timestamp this engine has
/// observed for the channel, or (first time only) the archive timestamp
/// of the newest entry in one page of the channel's archived-thread
/// history, or `None` if the channel has no archived threads at all.
pub fn approx_archival_ts(
    channel_id: Snowflake,
    last_archival_times: &HashMap<Snowflake, DateTime<Utc>>,
    first_page: &[ChatThread],
) -> Option<DateTime<Utc>> {
    if let Some(ts) = last_archival_times.get(&channel_id) {
        return Some(*ts);
    }
    first_page.iter().filter_map(|t| t.archive_timestamp).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(n: u64) -> Snowflake {
        Snowflake(n)
    }

    #[test]
    fn falls_back_to_channel_id_when_no_last_message() {
        let channels = vec![ChatChannel { guild_id: 1, id: sf(42), last_message_id: None }];
        let snapshot = take_snapshot(&channels, |_| Vec::new());
        assert_eq!(snapshot.channel(sf(42)), Some(sf(42)));
    }

    #[test]
    fn captures_per_thread_high_water() {
        let channels = vec![ChatChannel { guild_id: 1, id: sf(1), last_message_id: Some(sf(100)) }];
        let snapshot = take_snapshot(&channels, |_| {
            vec![ChatThread {
                id: sf(2),
                parent_id: sf(1),
                last_message_id: Some(sf(50)),
                archived: false,
                archive_timestamp: None,
            }]
        });
        assert_eq!(snapshot.channel(sf(1)), Some(sf(100)));
        assert_eq!(snapshot.threads(sf(1)).unwrap().get(&sf(2)), Some(&sf(50)));
    }
}
