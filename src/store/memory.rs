//! In-process [`Store`] backed by a `Mutex`-guarded set of tables, used by
//! the crate's own tests and by consumers exercising the engine without a
//! database.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Channel, ChannelRequest, ChannelState, ThreadRequest};
use crate::snowflake::Snowflake;

use super::{Store, StoreTransaction};

#[derive(Default)]
struct Tables {
    channels: Vec<Channel>,
    states: Vec<ChannelState>,
    channel_requests: Vec<ChannelRequest>,
    thread_requests: Vec<ThreadRequest>,
    next_request_id: i64,
}

fn do_upsert_channel(t: &mut Tables, channel: &Channel) {
    if !t.channels.iter().any(|c| c.id == channel.id) {
        t.channels.push(channel.clone());
    }
}

fn do_upsert_channel_state(t: &mut Tables, state: &ChannelState) -> bool {
    let exists = t.states.iter().any(|s| s.channel_id == state.channel_id && s.subscriber == state.subscriber);
    if exists {
        return false;
    }
    t.states.push(state.clone());
    true
}

fn do_insert_channel_request(t: &mut Tables, channel_id: Snowflake, subscriber: &str, after: Snowflake, before: Snowflake) {
    let id = t.next_request_id;
    t.next_request_id += 1;
    t.channel_requests.push(ChannelRequest {
        id,
        channel_id,
        subscriber: subscriber.to_string(),
        after_snowflake: after,
        before_snowflake: before,
    });
}

fn do_insert_thread_request(
    t: &mut Tables,
    channel_id: Snowflake,
    thread_id: Snowflake,
    subscriber: &str,
    after: Snowflake,
    before: Snowflake,
) {
    let id = t.next_request_id;
    t.next_request_id += 1;
    t.thread_requests.push(ThreadRequest {
        id,
        channel_id,
        thread_id,
        subscriber: subscriber.to_string(),
        after_snowflake: after,
        before_snowflake: before,
    });
}

fn do_advance_last_message_id(t: &mut Tables, channel_id: Snowflake, subscribers: &[String], msg_id: Snowflake) {
    for s in t.states.iter_mut().filter(|s| s.channel_id == channel_id && matches_subscriber(&s.subscriber, subscribers)) {
        if msg_id > s.last_message_id {
            s.last_message_id = msg_id;
        }
    }
}

fn do_set_archive_watermark(t: &mut Tables, channel_id: Snowflake, subscriber: &str, ts: Option<DateTime<Utc>>) {
    if let Some(s) = t.states.iter_mut().find(|s| s.channel_id == channel_id && s.subscriber == subscriber) {
        s.earliest_thread_archive_ts = ts;
    }
}

fn do_delete_channel_request(t: &mut Tables, id: i64) {
    t.channel_requests.retain(|r| r.id != id);
}

fn do_delete_thread_request(t: &mut Tables, id: i64) {
    t.thread_requests.retain(|r| r.id != id);
}

fn do_shrink_channel_request(t: &mut Tables, id: i64, new_before: Snowflake) {
    if let Some(r) = t.channel_requests.iter_mut().find(|r| r.id == id) {
        r.before_snowflake = new_before;
    }
}

fn do_shrink_thread_request(t: &mut Tables, id: i64, new_before: Snowflake) {
    if let Some(r) = t.thread_requests.iter_mut().find(|r| r.id == id) {
        r.before_snowflake = new_before;
    }
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_subscriber(subscriber: &str, subscribers: &[String]) -> bool {
    subscribers.iter().any(|s| s == subscriber)
}

/// The recursive walk from `spec.md` §4.4, run in-memory: find the request
/// with the smallest `before >= max_before`, then keep pulling in any
/// request whose `before` is still `>=` the running minimum `after`.
fn overlapping<'a, T>(
    candidates: &'a [T],
    max_before: Snowflake,
    before: impl Fn(&T) -> Snowflake,
    after: impl Fn(&T) -> Snowflake,
) -> Vec<&'a T> {
    let seed = candidates
        .iter()
        .filter(|r| before(r) >= max_before)
        .min_by_key(|r| before(r));
    let Some(seed) = seed else {
        return Vec::new();
    };
    let mut floor = after(seed);
    loop {
        let next = candidates
            .iter()
            .filter(|r| before(r) >= floor && after(r) < floor)
            .min_by_key(|r| after(r));
        match next {
            Some(r) => floor = after(r),
            None => break,
        }
    }
    candidates
        .iter()
        .filter(|r| before(r) <= max_before && after(r) >= floor)
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if !t.channels.iter().any(|c| c.id == channel.id) {
            t.channels.push(channel.clone());
        }
        Ok(())
    }

    async fn channel(&self, channel_id: Snowflake) -> Result<Option<Channel>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.channels.iter().find(|c| c.id == channel_id).cloned())
    }

    async fn all_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.channels.clone())
    }

    async fn mark_channel_reachable(&self, channel_id: Snowflake, reachable: bool) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(c) = t.channels.iter_mut().find(|c| c.id == channel_id) {
            c.reachable = reachable;
        }
        Ok(())
    }

    async fn mark_guild_unreachable(&self, guild_id: u64) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        for c in t.channels.iter_mut().filter(|c| c.guild_id == guild_id) {
            c.reachable = false;
        }
        Ok(())
    }

    async fn upsert_channel_state(&self, state: &ChannelState) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().unwrap();
        let exists = t
            .states
            .iter()
            .any(|s| s.channel_id == state.channel_id && s.subscriber == state.subscriber);
        if exists {
            return Ok(false);
        }
        t.states.push(state.clone());
        Ok(true)
    }

    async fn channel_state(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
    ) -> Result<Option<ChannelState>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.states
            .iter()
            .find(|s| s.channel_id == channel_id && s.subscriber == subscriber)
            .cloned())
    }

    async fn states_for_subscriber(&self, subscriber: &str) -> Result<Vec<ChannelState>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.states.iter().filter(|s| s.subscriber == subscriber).cloned().collect())
    }

    async fn states_for_channel(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
    ) -> Result<Vec<ChannelState>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.states
            .iter()
            .filter(|s| s.channel_id == channel_id && matches_subscriber(&s.subscriber, subscribers))
            .cloned()
            .collect())
    }

    async fn advance_last_message_id(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
        msg_id: Snowflake,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        for s in t
            .states
            .iter_mut()
            .filter(|s| s.channel_id == channel_id && matches_subscriber(&s.subscriber, subscribers))
        {
            if msg_id > s.last_message_id {
                s.last_message_id = msg_id;
            }
        }
        Ok(())
    }

    async fn set_archive_watermark(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(s) = t
            .states
            .iter_mut()
            .find(|s| s.channel_id == channel_id && s.subscriber == subscriber)
        {
            s.earliest_thread_archive_ts = ts;
        }
        Ok(())
    }

    async fn states_with_archive_watermark_after(
        &self,
        channel_id: Snowflake,
        ts: DateTime<Utc>,
    ) -> Result<Vec<ChannelState>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.states
            .iter()
            .filter(|s| s.channel_id == channel_id && s.earliest_thread_archive_ts.map_or(false, |w| w > ts))
            .cloned()
            .collect())
    }

    async fn insert_channel_request(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        let id = t.next_request_id;
        t.next_request_id += 1;
        t.channel_requests.push(ChannelRequest {
            id,
            channel_id,
            subscriber: subscriber.to_string(),
            after_snowflake: after,
            before_snowflake: before,
        });
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
        let mut t = self.tables.lock().unwrap();
        let id = t.next_request_id;
        t.next_request_id += 1;
        t.thread_requests.push(ThreadRequest {
            id,
            channel_id,
            thread_id,
            subscriber: subscriber.to_string(),
            after_snowflake: after,
            before_snowflake: before,
        });
        Ok(())
    }

    async fn delete_channel_request(&self, id: i64) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        t.channel_requests.retain(|r| r.id != id);
        Ok(())
    }

    async fn delete_thread_request(&self, id: i64) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        t.thread_requests.retain(|r| r.id != id);
        Ok(())
    }

    async fn shrink_channel_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(r) = t.channel_requests.iter_mut().find(|r| r.id == id) {
            r.before_snowflake = new_before;
        }
        Ok(())
    }

    async fn shrink_thread_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        if let Some(r) = t.thread_requests.iter_mut().find(|r| r.id == id) {
            r.before_snowflake = new_before;
        }
        Ok(())
    }

    async fn delete_thread_requests_for_thread(&self, thread_id: Snowflake) -> Result<(), StoreError> {
        let mut t = self.tables.lock().unwrap();
        t.thread_requests.retain(|r| r.thread_id != thread_id);
        Ok(())
    }

    async fn reachable_states_with_pending_archive_scan(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ChannelState>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.states
            .iter()
            .filter(|s| {
                s.earliest_thread_archive_ts.is_some()
                    && matches_subscriber(&s.subscriber, subscribers)
                    && t.channels.iter().any(|c| c.id == s.channel_id && c.reachable)
            })
            .cloned()
            .collect())
    }

    async fn reachable_channel_requests(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ChannelRequest>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.channel_requests
            .iter()
            .filter(|r| {
                matches_subscriber(&r.subscriber, subscribers)
                    && t.channels.iter().any(|c| c.id == r.channel_id && c.reachable)
            })
            .cloned()
            .collect())
    }

    async fn reachable_thread_requests(
        &self,
        subscribers: &[String],
    ) -> Result<Vec<ThreadRequest>, StoreError> {
        let t = self.tables.lock().unwrap();
        Ok(t.thread_requests
            .iter()
            .filter(|r| {
                matches_subscriber(&r.subscriber, subscribers)
                    && t.channels.iter().any(|c| c.id == r.channel_id && c.reachable)
            })
            .cloned()
            .collect())
    }

    async fn overlapping_channel_requests(
        &self,
        subscribers: &[String],
        channel_id: Snowflake,
        max_before: Snowflake,
    ) -> Result<Vec<ChannelRequest>, StoreError> {
        let t = self.tables.lock().unwrap();
        let candidates: Vec<ChannelRequest> = t
            .channel_requests
            .iter()
            .filter(|r| r.channel_id == channel_id && matches_subscriber(&r.subscriber, subscribers))
            .cloned()
            .collect();
        Ok(overlapping(&candidates, max_before, |r| r.before_snowflake, |r| r.after_snowflake)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn overlapping_thread_requests(
        &self,
        subscribers: &[String],
        thread_id: Snowflake,
        max_before: Snowflake,
    ) -> Result<Vec<ThreadRequest>, StoreError> {
        let t = self.tables.lock().unwrap();
        let candidates: Vec<ThreadRequest> = t
            .thread_requests
            .iter()
            .filter(|r| r.thread_id == thread_id && matches_subscriber(&r.subscriber, subscribers))
            .cloned()
            .collect();
        Ok(overlapping(&candidates, max_before, |r| r.before_snowflake, |r| r.after_snowflake)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            pending: Mutex::new(Some(Vec::new())),
        }))
    }
}

/// A pending in-memory transaction. Mutations are staged as closures rather
/// than applied immediately, so a dropped handle leaves the shared tables
/// untouched — the same all-or-nothing behavior `PgTransaction` gets from
/// an uncommitted `sqlx` transaction.
struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    pending: Mutex<Option<Vec<Box<dyn FnOnce(&mut Tables) + Send>>>>,
}

impl MemoryTransaction {
    fn stage(&self, op: impl FnOnce(&mut Tables) + Send + 'static) {
        self.pending
            .lock()
            .unwrap()
            .as_mut()
            .expect("transaction already committed")
            .push(Box::new(op));
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let channel = channel.clone();
        self.stage(move |t| do_upsert_channel(t, &channel));
        Ok(())
    }

    async fn upsert_channel_state(&self, state: &ChannelState) -> Result<bool, StoreError> {
        let state = state.clone();
        self.stage(move |t| {
            do_upsert_channel_state(t, &state);
        });
        Ok(true)
    }

    async fn insert_channel_request(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        after: Snowflake,
        before: Snowflake,
    ) -> Result<(), StoreError> {
        let subscriber = subscriber.to_string();
        self.stage(move |t| do_insert_channel_request(t, channel_id, &subscriber, after, before));
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
        let subscriber = subscriber.to_string();
        self.stage(move |t| do_insert_thread_request(t, channel_id, thread_id, &subscriber, after, before));
        Ok(())
    }

    async fn advance_last_message_id(
        &self,
        channel_id: Snowflake,
        subscribers: &[String],
        msg_id: Snowflake,
    ) -> Result<(), StoreError> {
        let subscribers = subscribers.to_vec();
        self.stage(move |t| do_advance_last_message_id(t, channel_id, &subscribers, msg_id));
        Ok(())
    }

    async fn set_archive_watermark(
        &self,
        channel_id: Snowflake,
        subscriber: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let subscriber = subscriber.to_string();
        self.stage(move |t| do_set_archive_watermark(t, channel_id, &subscriber, ts));
        Ok(())
    }

    async fn delete_channel_request(&self, id: i64) -> Result<(), StoreError> {
        self.stage(move |t| do_delete_channel_request(t, id));
        Ok(())
    }

    async fn delete_thread_request(&self, id: i64) -> Result<(), StoreError> {
        self.stage(move |t| do_delete_thread_request(t, id));
        Ok(())
    }

    async fn shrink_channel_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        self.stage(move |t| do_shrink_channel_request(t, id, new_before));
        Ok(())
    }

    async fn shrink_thread_request(&self, id: i64, new_before: Snowflake) -> Result<(), StoreError> {
        self.stage(move |t| do_shrink_thread_request(t, id, new_before));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let ops = self
            .pending
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| StoreError::Invariant("transaction already committed".to_string()))?;
        let mut t = self.tables.lock().unwrap();
        for op in ops {
            op(&mut t);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(n: u64) -> Snowflake {
        Snowflake(n)
    }

    #[tokio::test]
    async fn upsert_channel_state_is_idempotent() {
        let store = MemoryStore::new();
        let state = ChannelState {
            channel_id: sf(1),
            subscriber: "math".into(),
            last_message_id: sf(0),
            earliest_thread_archive_ts: None,
        };
        assert!(store.upsert_channel_state(&state).await.unwrap());
        assert!(!store.upsert_channel_state(&state).await.unwrap());
    }

    #[tokio::test]
    async fn advance_last_message_id_only_moves_forward() {
        let store = MemoryStore::new();
        let state = ChannelState {
            channel_id: sf(1),
            subscriber: "math".into(),
            last_message_id: sf(100),
            earliest_thread_archive_ts: None,
        };
        store.upsert_channel_state(&state).await.unwrap();
        store
            .advance_last_message_id(sf(1), &["math".to_string()], sf(50))
            .await
            .unwrap();
        let got = store.channel_state(sf(1), "math").await.unwrap().unwrap();
        assert_eq!(got.last_message_id, sf(100));

        store
            .advance_last_message_id(sf(1), &["math".to_string()], sf(200))
            .await
            .unwrap();
        let got = store.channel_state(sf(1), "math").await.unwrap().unwrap();
        assert_eq!(got.last_message_id, sf(200));
    }

    #[tokio::test]
    async fn overlapping_channel_requests_merges_contiguous_runs() {
        let store = MemoryStore::new();
        let subs = vec!["math".to_string()];
        // [10, 20), [20, 30), and a disjoint [100, 110)
        store.insert_channel_request(sf(1), "math", sf(10), sf(20)).await.unwrap();
        store.insert_channel_request(sf(1), "math", sf(20), sf(30)).await.unwrap();
        store.insert_channel_request(sf(1), "math", sf(100), sf(110)).await.unwrap();

        let got = store.overlapping_channel_requests(&subs, sf(1), sf(30)).await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| r.before_snowflake <= sf(30)));
    }
}
