//! Lock errors, holds and configuration

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type LockResult<T> = std::result::Result<T, LockError>;

#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// Waited the full budget and the node is still held
    #[error("Lock timeout: node '{resource}' is held by {holder}")]
    Timeout { resource: String, holder: String },

    #[error("Lock contention: node '{resource}' is held by {holder}")]
    Contention { resource: String, holder: String },

    #[error("Invalid lock state: {0}")]
    InvalidState(String),
}

/// One holder's claim on a node id
#[derive(Debug, Clone)]
pub struct LockHold {
    /// Unique per acquisition, so a released stale hold never clears its successor
    pub id: Uuid,
    pub node_id: String,
    /// Who holds it, e.g. a group key or `repair case <id>`
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub stale_at: Option<DateTime<Utc>>,
}

impl LockHold {
    pub fn new(node_id: &str, holder: &str, stale_after: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            stale_at: stale_after.and_then(|d| chrono::Duration::from_std(d).ok().map(|d| now + d)),
        }
    }

    /// Held past its stale window; the next acquirer takes it over
    pub fn is_stale(&self) -> bool {
        self.stale_at.is_some_and(|at| Utc::now() > at)
    }

    pub fn held_for(&self) -> chrono::Duration {
        Utc::now() - self.acquired_at
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Wait budget when the caller passes none
    pub default_timeout: Duration,
    /// Longest sleep between re-checks while waiting for a release
    pub retry_interval: Duration,
    /// A hold older than this belongs to a holder that never finished
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl LockConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_goes_stale() {
        let hold = LockHold::new("n1", "merge", Some(Duration::from_secs(60)));
        assert!(!hold.is_stale());

        let mut old = hold.clone();
        old.stale_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(old.is_stale());

        assert!(!LockHold::new("n1", "merge", None).is_stale());
    }
}
