//! Commit log abstraction
//!
//! The commit log is the persistence boundary: an ordered, replayable
//! sequence of committed transactions.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::transaction::CommitRecord;
use crate::error::Result;

/// Append-only store of commit records
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Durably append a record. Records arrive in sequence order.
    async fn append(&self, record: &CommitRecord) -> Result<()>;

    /// Load every record in sequence order
    async fn load_all(&self) -> Result<Vec<CommitRecord>>;

    /// Highest sequence appended so far, 0 when empty
    async fn last_sequence(&self) -> Result<u64>;

    /// Records that touched a node, in sequence order
    async fn history_for_node(&self, node_id: &str) -> Result<Vec<CommitRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| {
                r.transaction.touched_node_ids().contains(node_id)
                    || r.transaction
                        .edge_upserts
                        .iter()
                        .any(|e| e.references(node_id))
            })
            .collect())
    }
}

/// In-memory commit log, used by tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryCommitLog {
    records: Mutex<Vec<CommitRecord>>,
}

impl MemoryCommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl CommitLog for MemoryCommitLog {
    async fn append(&self, record: &CommitRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CommitRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn last_sequence(&self) -> Result<u64> {
        Ok(self
            .records
            .lock()
            .await
            .last()
            .map_or(0, |r| r.sequence))
    }
}
