//! SQLite implementation of the CommitLog
//!
//! Each record is stored as a JSON payload keyed by its sequence number, with
//! a per-node index for history lookups. Record and index rows are written in
//! one SQLite transaction.

use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::domain::graph::{CommitLog, CommitRecord};
use crate::error::{Error, Result};

/// SQLite-backed commit log
#[derive(Clone)]
pub struct SqliteCommitLog {
    pool: SqlitePool,
}

impl SqliteCommitLog {
    /// Create a commit log over a migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of records stored
    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM commit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// The most recent `limit` records, newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<CommitRecord>> {
        let rows: Vec<CommitRow> = sqlx::query_as(
            "SELECT sequence, payload FROM commit_log ORDER BY sequence DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CommitRow::into_record).collect()
    }
}

#[async_trait]
impl CommitLog for SqliteCommitLog {
    async fn append(&self, record: &CommitRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let tx_record = &record.transaction;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO commit_log (sequence, transaction_id, description, committed_at, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.sequence as i64)
        .bind(&tx_record.id)
        .bind(&tx_record.description)
        .bind(record.committed_at.to_rfc3339())
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

        let mut index: Vec<(&str, &str)> = Vec::new();
        for node in &tx_record.node_upserts {
            index.push((node.id.as_str(), "upsert"));
        }
        if let Some(rewrite) = &tx_record.rewrite {
            index.push((rewrite.survivor_id.as_str(), "survivor"));
            for retired in &rewrite.retired_ids {
                index.push((retired.as_str(), "retired"));
            }
        }
        for edge in &tx_record.edge_upserts {
            index.push((edge.source_id.as_str(), "edge_endpoint"));
            index.push((edge.target_id.as_str(), "edge_endpoint"));
        }

        for (node_id, role) in index {
            sqlx::query(
                "INSERT OR IGNORE INTO commit_log_nodes (sequence, node_id, role) VALUES (?, ?, ?)",
            )
            .bind(record.sequence as i64)
            .bind(node_id)
            .bind(role)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(sequence = record.sequence, tx_id = %tx_record.id, "Commit record appended");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CommitRecord>> {
        let rows: Vec<CommitRow> = sqlx::query_as(
            "SELECT sequence, payload FROM commit_log ORDER BY sequence",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CommitRow::into_record).collect()
    }

    async fn last_sequence(&self) -> Result<u64> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence) FROM commit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0) as u64)
    }

    async fn history_for_node(&self, node_id: &str) -> Result<Vec<CommitRecord>> {
        let rows: Vec<CommitRow> = sqlx::query_as(
            r#"
            SELECT c.sequence, c.payload
            FROM commit_log c
            WHERE c.sequence IN (SELECT sequence FROM commit_log_nodes WHERE node_id = ?)
            ORDER BY c.sequence
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CommitRow::into_record).collect()
    }
}

#[derive(FromRow)]
struct CommitRow {
    sequence: i64,
    payload: String,
}

impl CommitRow {
    fn into_record(self) -> Result<CommitRecord> {
        let record: CommitRecord = serde_json::from_str(&self.payload)?;
        if record.sequence != self.sequence as u64 {
            return Err(Error::Other(format!(
                "commit log row {} holds a payload for sequence {}",
                self.sequence, record.sequence
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{Edge, GraphStore, Node, RelationshipType, Transaction};
    use crate::storage::Database;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn person(label: &str, id: &str) -> Node {
        Node::new(label, "person")
            .with_id(id)
            .with_taxonomy_path(["People"])
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let db = Database::in_memory().await.unwrap();
        let log = SqliteCommitLog::new(db.pool().clone());
        let store = GraphStore::new(Arc::new(log.clone()));

        store.put_node(person("Alice", "a")).await.unwrap();
        store.put_node(person("Bob", "b")).await.unwrap();
        store
            .put_edge(Edge::new("a", "b", RelationshipType::Met))
            .await
            .unwrap();

        assert_eq!(log.count().await.unwrap(), 3);
        assert_eq!(log.last_sequence().await.unwrap(), 3);
        let records = log.load_all().await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(log.history_for_node("a").await.unwrap().len(), 2);
        assert_eq!(log.recent(1).await.unwrap()[0].sequence, 3);
    }

    #[tokio::test]
    async fn test_replay_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loom.db");

        {
            let db = Database::open(&path).await.unwrap();
            let store = GraphStore::new(Arc::new(SqliteCommitLog::new(db.pool().clone())));
            let mut tx = Transaction::new("seed");
            tx.upsert_node(person("Alice", "a1"));
            tx.upsert_node(person("Alice", "a2"));
            tx.upsert_node(person("Bob", "b"));
            tx.upsert_edge(Edge::new("a2", "b", RelationshipType::Invited));
            store.apply(tx).await.unwrap();
            let mut merge = Transaction::new("merge");
            merge.set_rewrite("a1", vec!["a2".into()]).unwrap();
            store.apply(merge).await.unwrap();
            db.close().await;
        }

        let db = Database::open(&path).await.unwrap();
        let log = Arc::new(SqliteCommitLog::new(db.pool().clone()));
        let store = GraphStore::open(log).await.unwrap();
        let stats = store.stats().await;
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.retired, 1);
        assert_eq!(stats.last_sequence, 2);
        let edges = store.list_neighbors("a1", None).await.unwrap();
        assert_eq!(edges[0].relationship_type, RelationshipType::Invited);

        // Appending continues after the replayed sequence
        store.put_node(person("Carol", "c")).await.unwrap();
        assert_eq!(store.stats().await.last_sequence, 3);
    }
}
