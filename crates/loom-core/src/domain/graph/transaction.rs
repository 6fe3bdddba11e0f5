//! Transactions and commit records
//!
//! A transaction is the only way to mutate committed state. It carries node
//! and edge upserts, new taxonomy categories, and at most one
//! duplicate-resolution rewrite.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::edge::Edge;
use super::node::Node;
use crate::domain::taxonomy::TaxonomyNode;
use crate::error::{Error, Result};

/// Retire `retired_ids` into `survivor_id`, repointing every reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRewrite {
    pub survivor_id: String,
    pub retired_ids: Vec<String>,
}

/// A batch of changes applied atomically by the graph store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Short human-readable description for logs
    pub description: String,
    #[serde(default)]
    pub node_upserts: Vec<Node>,
    #[serde(default)]
    pub edge_upserts: Vec<Edge>,
    #[serde(default)]
    pub category_additions: Vec<TaxonomyNode>,
    #[serde(default)]
    pub rewrite: Option<MergeRewrite>,
}

impl Transaction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            node_upserts: Vec::new(),
            edge_upserts: Vec::new(),
            category_additions: Vec::new(),
            rewrite: None,
        }
    }

    pub fn upsert_node(&mut self, node: Node) -> &mut Self {
        self.node_upserts.push(node);
        self
    }

    pub fn upsert_edge(&mut self, edge: Edge) -> &mut Self {
        self.edge_upserts.push(edge);
        self
    }

    pub fn add_category(&mut self, category: TaxonomyNode) -> &mut Self {
        self.category_additions.push(category);
        self
    }

    /// Attach the duplicate-resolution rewrite; a transaction carries at most one
    pub fn set_rewrite(
        &mut self,
        survivor_id: impl Into<String>,
        retired_ids: Vec<String>,
    ) -> Result<&mut Self> {
        if self.rewrite.is_some() {
            return Err(Error::ValidationError(format!(
                "transaction '{}' already carries a merge rewrite",
                self.id
            )));
        }
        self.rewrite = Some(MergeRewrite {
            survivor_id: survivor_id.into(),
            retired_ids,
        });
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.node_upserts.is_empty()
            && self.edge_upserts.is_empty()
            && self.category_additions.is_empty()
            && self.rewrite.is_none()
    }

    /// Node ids this transaction writes or retires
    pub fn touched_node_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self
            .node_upserts
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        if let Some(rewrite) = &self.rewrite {
            ids.insert(rewrite.survivor_id.clone());
            ids.extend(rewrite.retired_ids.iter().cloned());
        }
        ids
    }
}

/// A committed transaction with its position in the commit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
    /// The transaction as applied: ids assigned and versions stamped
    pub transaction: Transaction,
    /// Edge ids removed by the rewrite (collapsed duplicates and dropped self-loops)
    #[serde(default)]
    pub removed_edge_ids: Vec<String>,
}

/// Summary returned to callers of `GraphStore::apply`
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub sequence: u64,
    pub node_ids: Vec<String>,
    pub edge_ids: Vec<String>,
    pub removed_edge_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rewrite_per_transaction() {
        let mut tx = Transaction::new("merge");
        tx.set_rewrite("a", vec!["b".into()]).unwrap();
        assert!(tx.set_rewrite("a", vec!["c".into()]).is_err());
        assert_eq!(
            tx.touched_node_ids().into_iter().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_empty_transaction() {
        let mut tx = Transaction::new("noop");
        assert!(tx.is_empty());
        tx.upsert_node(Node::new("Alice", "person"));
        assert!(!tx.is_empty());
        assert!(tx.touched_node_ids().is_empty());
    }
}
