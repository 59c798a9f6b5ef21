//! Crate-wide error type.

use thiserror::Error;

use crate::chat::HistoryError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Invariant(String),
}

/// Errors surfaced by the engine's internal operations. Nothing in
/// `spec.md` §7 is user-visible; this exists so the worker and executor
/// have something concrete to log and branch on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
    #[error("chat library error: {0}")]
    Chat(#[from] HistoryError),
    #[error("subscriber callback failed: {0}")]
    Callback(String),
}
