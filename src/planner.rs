//! The backfill planner: selects at most one unit of work per call, in the
//! three-tier priority order from `spec.md` §4.3.

use crate::error::StoreError;
use crate::store::{Store, Work};

/// Tier 1: archival scans (null-`before_snowflake`, sorts first) take
/// priority over tier 2 (channel pulls), which takes priority over tier 3
/// (thread pulls). Each tier picks its single best row; channels with
/// `reachable=false` are already filtered out by the store queries.
pub async fn select_work(store: &dyn Store, active_subscribers: &[String]) -> Result<Option<Work>, StoreError> {
    if active_subscribers.is_empty() {
        return Ok(None);
    }

    let archive_candidates = store.reachable_states_with_pending_archive_scan(active_subscribers).await?;
    if let Some(state) = archive_candidates
        .iter()
        .max_by_key(|s| s.earliest_thread_archive_ts)
    {
        return Ok(Some(Work::ThreadArchiveScan { channel_id: state.channel_id }));
    }

    let channel_candidates = store.reachable_channel_requests(active_subscribers).await?;
    if let Some(req) = channel_candidates.iter().max_by_key(|r| r.before_snowflake) {
        return Ok(Some(Work::ChannelHistoryPull {
            channel_id: req.channel_id,
            before: req.before_snowflake,
        }));
    }

    let thread_candidates = store.reachable_thread_requests(active_subscribers).await?;
    if let Some(req) = thread_candidates.iter().max_by_key(|r| r.before_snowflake) {
        return Ok(Some(Work::ThreadHistoryPull {
            channel_id: req.channel_id,
            thread_id: req.thread_id,
            before: req.before_snowflake,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snowflake::Snowflake;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn sf(n: u64) -> Snowflake {
        Snowflake(n)
    }

    #[tokio::test]
    async fn archive_scan_beats_channel_and_thread_requests() {
        let store = MemoryStore::new();
        let subs = vec!["math".to_string()];
        store
            .upsert_channel(&crate::model::Channel { guild_id: 1, id: sf(1), reachable: true })
            .await
            .unwrap();
        store
            .upsert_channel_state(&crate::model::ChannelState {
                channel_id: sf(1),
                subscriber: "math".into(),
                last_message_id: sf(0),
                earliest_thread_archive_ts: Some(Utc::now()),
            })
            .await
            .unwrap();
        store.insert_channel_request(sf(1), "math", sf(10), sf(20)).await.unwrap();

        let work = select_work(&store, &subs).await.unwrap();
        assert_eq!(work, Some(Work::ThreadArchiveScan { channel_id: sf(1) }));
    }

    #[tokio::test]
    async fn channel_request_beats_thread_request() {
        let store = MemoryStore::new();
        let subs = vec!["math".to_string()];
        store
            .upsert_channel(&crate::model::Channel { guild_id: 1, id: sf(1), reachable: true })
            .await
            .unwrap();
        store
            .upsert_channel_state(&crate::model::ChannelState {
                channel_id: sf(1),
                subscriber: "math".into(),
                last_message_id: sf(0),
                earliest_thread_archive_ts: None,
            })
            .await
            .unwrap();
        store.insert_channel_request(sf(1), "math", sf(10), sf(20)).await.unwrap();
        store.insert_thread_request(sf(1), sf(2), "math", sf(10), sf(20)).await.unwrap();

        let work = select_work(&store, &subs).await.unwrap();
        assert_eq!(work, Some(Work::ChannelHistoryPull { channel_id: sf(1), before: sf(20) }));
    }

    #[tokio::test]
    async fn no_work_returns_none() {
        let store = MemoryStore::new();
        let work = select_work(&store, &["math".to_string()]).await.unwrap();
        assert_eq!(work, None);
    }

    #[tokio::test]
    async fn unreachable_channel_is_skipped() {
        let store = MemoryStore::new();
        let subs = vec!["math".to_string()];
        store
            .upsert_channel(&crate::model::Channel { guild_id: 1, id: sf(1), reachable: false })
            .await
            .unwrap();
        store
            .upsert_channel_state(&crate::model::ChannelState {
                channel_id: sf(1),
                subscriber: "math".into(),
                last_message_id: sf(0),
                earliest_thread_archive_ts: None,
            })
            .await
            .unwrap();
        store.insert_channel_request(sf(1), "math", sf(10), sf(20)).await.unwrap();

        let work = select_work(&store, &subs).await.unwrap();
        assert_eq!(work, None);
    }
}
