//! Configuration surface (`spec.md` §6). Sourcing these values (env, file,
//! CLI flags) is the consumer's job; this crate only defines the knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EngineConfig {
    /// Base of the exponential backoff applied after a persistence error
    /// in the backfill worker.
    pub backoff_base: Duration,
    /// Max messages fetched per channel-history or thread-history pull.
    pub history_page_size: u32,
    /// Max archived threads fetched per thread-archive scan.
    pub archive_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(10),
            history_page_size: 1000,
            archive_page_size: 50,
        }
    }
}
