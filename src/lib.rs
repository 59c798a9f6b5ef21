//! Durable message-tracking and backfill engine: guarantees every
//! subscriber observes every message posted in every watched channel and
//! thread, exactly once to the extent the failure path allows, across
//! restarts, reconnects, permission changes, and transient callback
//! failures.
//!
//! [`Engine`] is the crate's entry point; everything else is an
//! implementation detail reachable through it or through the traits in
//! [`chat`] that a consumer implements to plug in its own chat library.

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod model;
pub mod planner;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod snowflake;
pub mod store;
pub mod worker;

/// Scriptable fakes (`FakeChatClient`, a recording `Subscriber`) for
/// exercising the engine without a real chat connection or database.
/// Public so integration tests under `tests/` can use it too.
pub mod test_support;

pub use chat::{ChatChannel, ChatClient, ChatMessage, ChatThread, HistoryError, Subscriber};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::Error;
pub use registry::Scope;
pub use snowflake::Snowflake;
