use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::Key;

/// A mutation the guards refuse to let through. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("event {event}: end {end} must be after start {start}")]
    InvalidDuration {
        event: Key,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("event {event} comes from a channel; {rule}")]
    LockedField { event: Key, rule: &'static str },
    #[error("event {event} cannot be deleted: {rule}")]
    UnsafeDelete { event: Key, rule: &'static str },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("rejected: {0}")]
    Rejected(#[from] GuardViolation),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SyncError {
    pub fn violation(&self) -> Option<&GuardViolation> {
        match self {
            SyncError::Rejected(v) => Some(v),
            _ => None,
        }
    }
}
