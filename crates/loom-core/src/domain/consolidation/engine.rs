//! Consolidation engine
//!
//! The transactional core. Candidate batches become committed nodes and
//! edges here, and every duplicate group gets exactly one decision:
//!
//! 1. Resolve the group's ids through the retirement map
//! 2. Apply the proposal's verdict and the merge threshold
//! 3. Check the pipeline gate
//! 4. Lock the ids (sorted, bounded wait)
//! 5. Re-resolve under the locks, unify, commit one transaction
//!
//! Deferred groups are pushed to the review queue instead of failing the
//! caller.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::decision::{DeferredMerge, MergeDecision, MergeProposal};
use super::unify::{choose_survivor, unify};
use crate::domain::dedup::DuplicateGroup;
use crate::domain::extraction::CandidateBatch;
use crate::domain::graph::{Commit, Edge, GraphStore, Node, Transaction};
use crate::domain::locking::{LockError, NodeLockManager};
use crate::domain::pipeline::PipelineGate;
use crate::error::{Error, Result};

/// Attempts at locking a group whose ids move under concurrent merges
const MAX_LOCK_ROUNDS: usize = 3;

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Merge confidence below this defers the group
    pub merge_threshold: f32,
    /// Longest wait for a group's node locks
    pub lock_timeout: Duration,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.5,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Decision counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationStats {
    pub batches_committed: u64,
    pub nodes_created: u64,
    pub edges_created: u64,
    pub merged: u64,
    pub deferred: u64,
    pub rejected: u64,
    pub retired: u64,
}

#[derive(Default)]
struct Counters {
    batches_committed: AtomicU64,
    nodes_created: AtomicU64,
    edges_created: AtomicU64,
    merged: AtomicU64,
    deferred: AtomicU64,
    rejected: AtomicU64,
    retired: AtomicU64,
}

/// Result of committing a candidate batch
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub commit: Commit,
    /// temp id -> committed id
    pub node_ids: HashMap<String, String>,
    pub edge_ids: HashMap<String, String>,
    pub categories_added: usize,
}

pub struct ConsolidationEngine {
    store: Arc<GraphStore>,
    locks: Arc<NodeLockManager>,
    gate: PipelineGate,
    config: ConsolidationConfig,
    counters: Counters,
    deferred_sink: Option<mpsc::UnboundedSender<DeferredMerge>>,
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<GraphStore>,
        locks: Arc<NodeLockManager>,
        gate: PipelineGate,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            store,
            locks,
            gate,
            config,
            counters: Counters::default(),
            deferred_sink: None,
        }
    }

    /// Send deferred groups to `sink` (usually the repair loop's queue)
    pub fn with_deferred_sink(mut self, sink: mpsc::UnboundedSender<DeferredMerge>) -> Self {
        self.deferred_sink = Some(sink);
        self
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn gate(&self) -> &PipelineGate {
        &self.gate
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Commit a validated, placed candidate batch as one transaction
    ///
    /// New categories proposed by the placements commit in the same
    /// transaction as the nodes that need them.
    pub async fn commit_batch(&self, batch: &CandidateBatch) -> Result<BatchCommit> {
        if self.gate.is_paused() {
            let reason = self.gate.reason().unwrap_or_else(|| "paused".to_string());
            return Err(Error::PipelinePaused(reason));
        }
        batch.validate()?;
        if batch.is_empty() {
            return Err(Error::ValidationError(format!(
                "batch '{}' has nothing to commit",
                batch.batch_id
            )));
        }

        let now = Utc::now();
        let mut tx = Transaction::new(format!("commit batch {} (unit {})", batch.batch_id, batch.unit_id));
        let mut node_ids = HashMap::with_capacity(batch.nodes.len());
        let mut categories_added = 0;

        for candidate in &batch.nodes {
            let id = Uuid::new_v4().to_string();
            let node = candidate.to_node(&id, now)?;
            if let Some(category) = candidate
                .placement
                .as_ref()
                .and_then(|p| p.new_category.clone())
            {
                tx.add_category(category);
                categories_added += 1;
            }
            tx.upsert_node(node);
            node_ids.insert(candidate.temp_id.clone(), id);
        }

        let mut edge_ids = HashMap::with_capacity(batch.edges.len());
        for candidate in &batch.edges {
            // validate() guarantees both endpoints are batch temp ids
            let (Some(source), Some(target)) =
                (node_ids.get(&candidate.source), node_ids.get(&candidate.target))
            else {
                return Err(Error::DanglingTempReference {
                    edge: candidate.temp_id.clone(),
                    temp_id: candidate.source.clone(),
                });
            };
            let id = Uuid::new_v4().to_string();
            let mut edge = Edge::new(source, target, candidate.relationship_type.clone())
                .with_id(&id)
                .with_bidirectional(candidate.bidirectional)
                .with_created_at(now);
            if !candidate.label.trim().is_empty() {
                edge = edge.with_label(&candidate.label);
            }
            edge.source_sentence = candidate.source_sentence.clone();
            edge.context_window = candidate.context_window.clone();
            tx.upsert_edge(edge);
            edge_ids.insert(candidate.temp_id.clone(), id);
        }

        let commit = self.store.apply(tx).await?;
        self.counters.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .nodes_created
            .fetch_add(node_ids.len() as u64, Ordering::Relaxed);
        self.counters
            .edges_created
            .fetch_add(edge_ids.len() as u64, Ordering::Relaxed);
        info!(
            batch_id = %batch.batch_id,
            unit_id = %batch.unit_id,
            sequence = commit.sequence,
            nodes = node_ids.len(),
            edges = edge_ids.len(),
            categories = categories_added,
            "Candidate batch committed"
        );
        Ok(BatchCommit {
            commit,
            node_ids,
            edge_ids,
            categories_added,
        })
    }

    /// Decide one duplicate group
    pub async fn consolidate(
        &self,
        group: &DuplicateGroup,
        proposal: &MergeProposal,
    ) -> MergeDecision {
        let decision = self.decide(group, proposal).await;
        match &decision {
            MergeDecision::Merged { into, retired, .. } => {
                self.counters.merged.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .retired
                    .fetch_add(retired.len() as u64, Ordering::Relaxed);
                info!(group = %group.key, survivor = %into, retired = retired.len(), "Group merged");
            }
            MergeDecision::Deferred { reason } => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                info!(group = %group.key, reason = %reason, "Group deferred");
                self.enqueue_deferred(group, reason, Some(proposal.clone()));
            }
            MergeDecision::Rejected { reason } => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(group = %group.key, reason = %reason, "Group rejected");
            }
        }
        decision
    }

    /// Defer a group whose proposal could not be obtained
    pub fn defer_unproposed(&self, group: &DuplicateGroup, reason: impl Into<String>) -> MergeDecision {
        let reason = reason.into();
        self.counters.deferred.fetch_add(1, Ordering::Relaxed);
        info!(group = %group.key, reason = %reason, "Group deferred without proposal");
        self.enqueue_deferred(group, &reason, None);
        MergeDecision::Deferred { reason }
    }

    fn enqueue_deferred(&self, group: &DuplicateGroup, reason: &str, proposal: Option<MergeProposal>) {
        let Some(sink) = &self.deferred_sink else {
            return;
        };
        let record = DeferredMerge {
            group: group.clone(),
            reason: reason.to_string(),
            proposal,
            deferred_at: Utc::now(),
        };
        if sink.send(record).is_err() {
            warn!(group = %group.key, "Review queue closed, deferred group dropped");
        }
    }

    async fn resolve_group(&self, ids: &BTreeSet<String>) -> std::result::Result<BTreeSet<String>, MergeDecision> {
        let snapshot = self.store.snapshot().await;
        let mut resolved = BTreeSet::new();
        for id in ids {
            match snapshot.resolve(id) {
                Some(current) => {
                    resolved.insert(current);
                }
                None => {
                    return Err(MergeDecision::rejected(format!("unknown node '{}'", id)));
                }
            }
        }
        if resolved.len() < 2 {
            return Err(MergeDecision::rejected("already-merged"));
        }
        Ok(resolved)
    }

    async fn decide(&self, group: &DuplicateGroup, proposal: &MergeProposal) -> MergeDecision {
        let mut ids = match self.resolve_group(&group.node_ids).await {
            Ok(ids) => ids,
            Err(decision) => return decision,
        };

        if !proposal.same_entity {
            let reason = proposal
                .rationale
                .clone()
                .unwrap_or_else(|| "not the same entity".to_string());
            return MergeDecision::Rejected { reason };
        }
        if proposal.review_later {
            return MergeDecision::deferred("flagged for review");
        }
        if proposal.merge_confidence < self.config.merge_threshold {
            return MergeDecision::deferred(format!(
                "merge confidence {:.2} below threshold {:.2}",
                proposal.merge_confidence, self.config.merge_threshold
            ));
        }

        for round in 1..=MAX_LOCK_ROUNDS {
            if self.gate.is_paused() {
                return MergeDecision::deferred("pipeline paused");
            }

            let guard = match self
                .locks
                .acquire_many(&ids, &group.key, Some(self.config.lock_timeout))
                .await
            {
                Ok(guard) => guard,
                Err(LockError::Timeout { resource, holder }) => {
                    return MergeDecision::deferred(format!(
                        "lock timeout on '{}' held by {}",
                        resource, holder
                    ));
                }
                Err(e) => return MergeDecision::deferred(format!("lock failure: {}", e)),
            };

            // Another merge may have committed while we waited
            let current = match self.resolve_group(&ids).await {
                Ok(current) => current,
                Err(decision) => return decision,
            };
            if !current.iter().all(|id| guard.covers(id)) {
                debug!(group = %group.key, round, "Group ids moved while locking, retrying");
                drop(guard);
                ids = current;
                continue;
            }

            let (nodes, known_path) = {
                let snapshot = self.store.snapshot().await;
                let nodes: Vec<Node> = current
                    .iter()
                    .filter_map(|id| snapshot.node(id).cloned())
                    .collect();
                let known_path = proposal
                    .unified
                    .taxonomy_path
                    .as_ref()
                    .is_none_or(|path| snapshot.taxonomy().find_path(path).is_some());
                (nodes, known_path)
            };
            let Some(survivor) = choose_survivor(&nodes) else {
                return MergeDecision::rejected("already-merged");
            };
            let unified = if known_path {
                unify(&nodes, survivor, proposal)
            } else {
                // Categories come from placement only; keep the survivor's path
                warn!(group = %group.key, "Proposed taxonomy path is not in the tree, ignoring it");
                let mut proposal = proposal.clone();
                proposal.unified.taxonomy_path = None;
                unify(&nodes, survivor, &proposal)
            };
            let survivor_id = unified.id.clone();
            let retired: Vec<String> = nodes
                .iter()
                .map(|n| n.id.clone())
                .filter(|id| *id != survivor_id)
                .collect();

            let mut tx = Transaction::new(format!("merge group {}", group.key));
            tx.upsert_node(unified);
            if let Err(e) = tx.set_rewrite(&survivor_id, retired.clone()) {
                return MergeDecision::deferred(format!("invalid rewrite: {}", e));
            }

            let result = self.store.apply(tx).await;
            drop(guard);
            return match result {
                Ok(_) => match self.store.get_node(&survivor_id).await {
                    Ok(node) => MergeDecision::Merged {
                        into: survivor_id,
                        unified: Box::new(node),
                        retired,
                    },
                    Err(e) => MergeDecision::deferred(format!("survivor unreadable after commit: {}", e)),
                },
                Err(e) => {
                    warn!(group = %group.key, error = %e, "Merge transaction aborted");
                    MergeDecision::deferred(format!("commit failed: {}", e))
                }
            };
        }

        MergeDecision::deferred("group ids kept moving under concurrent merges")
    }

    pub fn stats(&self) -> ConsolidationStats {
        ConsolidationStats {
            batches_committed: self.counters.batches_committed.load(Ordering::Relaxed),
            nodes_created: self.counters.nodes_created.load(Ordering::Relaxed),
            edges_created: self.counters.edges_created.load(Ordering::Relaxed),
            merged: self.counters.merged.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::decision::UnifiedFields;
    use crate::domain::extraction::{CandidateEdge, CandidateNode};
    use crate::domain::graph::RelationshipType;
    use crate::domain::locking::LockConfig;
    use crate::domain::taxonomy::{PlacementConfig, TaxonomyPlacer};

    fn engine(store: Arc<GraphStore>) -> ConsolidationEngine {
        ConsolidationEngine::new(
            store,
            Arc::new(NodeLockManager::with_defaults()),
            PipelineGate::new(),
            ConsolidationConfig::default(),
        )
    }

    fn person(id: &str, label: &str, score: f32) -> Node {
        Node::new(label, "person")
            .with_id(id)
            .with_confidence(score)
            .with_importance(score)
            .with_taxonomy_path(["Person"])
    }

    async fn seeded(nodes: Vec<Node>) -> Arc<GraphStore> {
        let store = Arc::new(GraphStore::in_memory());
        let mut tx = Transaction::new("seed");
        for node in nodes {
            tx.upsert_node(node);
        }
        store.apply(tx).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_commit_batch_maps_temp_ids() {
        let store = Arc::new(GraphStore::in_memory());
        let engine = engine(Arc::clone(&store));
        let mut batch = CandidateBatch::new(
            "u1",
            vec![
                CandidateNode::new("n1", "Alice", "person"),
                CandidateNode::new("n2", "Bob", "person"),
            ],
            vec![CandidateEdge::new("e1", "n1", "n2", RelationshipType::Met)],
        );
        TaxonomyPlacer::new(PlacementConfig::default()).place_batch(&store.taxonomy().await, &mut batch.nodes);

        let result = engine.commit_batch(&batch).await.unwrap();
        assert_eq!(result.categories_added, 1);
        let alice = &result.node_ids["n1"];
        let edge = store.get_edge(&result.edge_ids["e1"]).await.unwrap();
        assert_eq!(&edge.source_id, alice);
        assert_eq!(store.get_node(alice).await.unwrap().taxonomy_path, vec!["Person"]);
        assert_eq!(store.taxonomy().await.len(), 1);
        assert_eq!(engine.stats().batches_committed, 1);
    }

    #[tokio::test]
    async fn test_commit_batch_requires_placement() {
        let store = Arc::new(GraphStore::in_memory());
        let batch = CandidateBatch::new("u1", vec![CandidateNode::new("n1", "Alice", "person")], vec![]);
        let result = engine(Arc::clone(&store)).commit_batch(&batch).await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert_eq!(store.stats().await.nodes, 0);
    }

    #[tokio::test]
    async fn test_merge_then_idempotent() {
        let store = seeded(vec![person("a", "Alice", 0.9), person("b", "alice", 0.5)]).await;
        let engine = engine(Arc::clone(&store));
        let group = DuplicateGroup::new(["a", "b"], Vec::new());

        let first = engine.consolidate(&group, &MergeProposal::same(0.9)).await;
        assert_eq!(first.survivor(), Some("a"));
        assert_eq!(store.resolve("b").await.as_deref(), Some("a"));

        let second = engine.consolidate(&group, &MergeProposal::same(0.9)).await;
        assert_eq!(second, MergeDecision::rejected("already-merged"));
        assert_eq!(engine.stats().merged, 1);
        assert_eq!(engine.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_unified_path_is_ignored() {
        let store = seeded(vec![person("a", "Alice", 0.9), person("b", "alice", 0.5)]).await;
        let engine = engine(Arc::clone(&store));
        let group = DuplicateGroup::new(["a", "b"], Vec::new());
        let proposal = MergeProposal::same(0.9).with_unified(UnifiedFields {
            core: Some("a chemist".to_string()),
            taxonomy_path: Some(vec!["Ghost".to_string(), "Branch".to_string()]),
            ..UnifiedFields::default()
        });

        let decision = engine.consolidate(&group, &proposal).await;
        assert_eq!(decision.survivor(), Some("a"));
        let survivor = store.get_node("a").await.unwrap();
        assert_eq!(survivor.taxonomy_path, vec!["Person"]);
        assert_eq!(survivor.core, "a chemist");
        assert!(store.taxonomy().await.is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_deferred_and_queued() {
        let store = seeded(vec![person("a", "Alice", 0.9), person("b", "Alicia", 0.5)]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(Arc::clone(&store)).with_deferred_sink(tx);
        let group = DuplicateGroup::new(["a", "b"], vec!["a ~ b".to_string()]);

        let decision = engine.consolidate(&group, &MergeProposal::same(0.3)).await;
        assert_eq!(decision.kind(), "deferred");
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.group.key, group.key);
        assert_eq!(store.stats().await.nodes, 2);
    }

    #[tokio::test]
    async fn test_distinct_and_unknown_rejected() {
        let store = seeded(vec![person("a", "Alice", 0.9), person("b", "Bob", 0.5)]).await;
        let engine = engine(Arc::clone(&store));
        let pair = DuplicateGroup::new(["a", "b"], Vec::new());
        assert_eq!(
            engine.consolidate(&pair, &MergeProposal::distinct()).await.kind(),
            "rejected"
        );
        let unknown = DuplicateGroup::new(["a", "zzz"], Vec::new());
        let decision = engine.consolidate(&unknown, &MergeProposal::same(0.9)).await;
        assert_eq!(decision.reason(), Some("unknown node 'zzz'"));
    }

    #[tokio::test]
    async fn test_paused_gate_defers() {
        let store = seeded(vec![person("a", "Alice", 0.9), person("b", "alice", 0.5)]).await;
        let engine = engine(Arc::clone(&store));
        engine.gate().pause("operator");
        let group = DuplicateGroup::new(["a", "b"], Vec::new());
        let decision = engine.consolidate(&group, &MergeProposal::same(0.9)).await;
        assert_eq!(decision, MergeDecision::deferred("pipeline paused"));
        assert!(!store.snapshot().await.is_retired("b"));
    }

    #[tokio::test]
    async fn test_lock_timeout_defers() {
        let store = seeded(vec![person("a", "Alice", 0.9), person("b", "alice", 0.5)]).await;
        let locks = Arc::new(NodeLockManager::new(LockConfig::default()));
        let engine = ConsolidationEngine::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            PipelineGate::new(),
            ConsolidationConfig {
                lock_timeout: Duration::from_millis(30),
                ..ConsolidationConfig::default()
            },
        );
        let _held = locks.try_acquire("b", "someone else").unwrap();
        let group = DuplicateGroup::new(["a", "b"], Vec::new());
        let decision = engine.consolidate(&group, &MergeProposal::same(0.9)).await;
        assert_eq!(decision.kind(), "deferred");
        assert!(decision.reason().unwrap().contains("lock timeout"));
    }
}
