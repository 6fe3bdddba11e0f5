//! Graph store
//!
//! Arena of nodes and edges behind a `tokio::sync::RwLock`. Writers take the
//! commit mutex, validate the transaction under a read guard, append the
//! commit record to the log, and only then take the write guard to apply the
//! staged change in a single infallible step. Readers are blocked only for
//! that last step and never see a torn transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use super::edge::{Edge, RelationshipType};
use super::log::{CommitLog, MemoryCommitLog};
use super::node::Node;
use super::transaction::{Commit, CommitRecord, Transaction};
use crate::domain::taxonomy::{TaxonomyNode, TaxonomyTree};
use crate::error::{Error, Result};

/// Consistent read view of the graph
pub type GraphSnapshot<'a> = RwLockReadGuard<'a, GraphState>;

/// Counts reported by `GraphStore::stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub categories: usize,
    pub retired: usize,
    pub last_sequence: u64,
}

/// Committed graph state
#[derive(Debug, Default)]
pub struct GraphState {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    /// node id -> ids of edges touching it
    adjacency: HashMap<String, BTreeSet<String>>,
    /// retired id -> surviving id (chains collapsed)
    retired: HashMap<String, String>,
    taxonomy: TaxonomyTree,
    last_sequence: u64,
}

/// Changes computed by `GraphState::stage`, ready to apply without failure
struct Staged {
    applied: Transaction,
    taxonomy: Option<TaxonomyTree>,
    node_writes: Vec<Node>,
    edge_writes: BTreeMap<String, Edge>,
    edge_removals: Vec<String>,
    retirements: Vec<(String, String)>,
}

impl GraphState {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_node(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub fn get_edge(&self, id: &str) -> Result<&Edge> {
        self.edges
            .get(id)
            .ok_or_else(|| Error::EdgeNotFound(id.to_string()))
    }

    /// Edges touching `id`, optionally restricted to some relationship types,
    /// ordered by creation time
    pub fn list_neighbors(
        &self,
        id: &str,
        relationship_filter: Option<&[RelationshipType]>,
    ) -> Result<Vec<&Edge>> {
        if !self.nodes.contains_key(id) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        let mut edges: Vec<&Edge> = self
            .adjacency
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|eid| self.edges.get(eid))
            .filter(|e| {
                relationship_filter.is_none_or(|types| types.contains(&e.relationship_type))
            })
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(edges)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn degree(&self, id: &str) -> usize {
        self.adjacency.get(id).map_or(0, BTreeSet::len)
    }

    /// Follow the retirement map to the committed id currently standing for `id`
    pub fn resolve(&self, id: &str) -> Option<String> {
        if self.nodes.contains_key(id) {
            return Some(id.to_string());
        }
        let survivor = self.retired.get(id)?;
        self.nodes.contains_key(survivor).then(|| survivor.clone())
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains_key(id)
    }

    pub fn taxonomy(&self) -> &TaxonomyTree {
        &self.taxonomy
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
            categories: self.taxonomy.len(),
            retired: self.retired.len(),
            last_sequence: self.last_sequence,
        }
    }

    fn stale_or_missing(&self, id: &str) -> Error {
        if self.retired.contains_key(id) {
            Error::StaleReference(id.to_string())
        } else {
            Error::NodeNotFound(id.to_string())
        }
    }

    /// Validate `tx` against the current state and compute every change
    fn stage(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<Staged> {
        if tx.is_empty() {
            return Err(Error::ValidationError(format!(
                "transaction '{}' is empty",
                tx.id
            )));
        }

        let mut applied = Transaction {
            id: tx.id.clone(),
            description: tx.description.clone(),
            node_upserts: Vec::new(),
            edge_upserts: Vec::new(),
            category_additions: Vec::new(),
            rewrite: tx.rewrite.clone(),
        };

        // Categories: an addition matching an existing sibling label is
        // folded into that category.
        let mut taxonomy = None;
        if !tx.category_additions.is_empty() {
            let mut tree = self.taxonomy.clone();
            let mut remap: HashMap<String, String> = HashMap::new();
            for category in &tx.category_additions {
                let mut category: TaxonomyNode = category.clone();
                let mapped_parent = category
                    .parent
                    .as_ref()
                    .and_then(|p| remap.get(p))
                    .cloned();
                if mapped_parent.is_some() {
                    category.parent = mapped_parent;
                }
                let existing = category
                    .parent
                    .as_deref()
                    .and_then(|p| tree.child_by_label(p, &category.label))
                    .map(|c| c.id.clone());
                if let Some(existing) = existing {
                    remap.insert(category.id.clone(), existing);
                    continue;
                }
                tree.insert(category.clone())?;
                applied.category_additions.push(category);
            }
            taxonomy = Some(tree);
        }

        // Rewrite targets
        let mut survivor: Option<&str> = None;
        let mut retiring: HashSet<&str> = HashSet::new();
        if let Some(rewrite) = &tx.rewrite {
            if rewrite.retired_ids.is_empty() {
                return Err(Error::ValidationError(
                    "merge rewrite retires no nodes".to_string(),
                ));
            }
            if !self.nodes.contains_key(&rewrite.survivor_id) {
                return Err(self.stale_or_missing(&rewrite.survivor_id));
            }
            for retired in &rewrite.retired_ids {
                if retired == &rewrite.survivor_id {
                    return Err(Error::ValidationError(format!(
                        "node '{}' cannot be retired into itself",
                        retired
                    )));
                }
                if !self.nodes.contains_key(retired) {
                    return Err(self.stale_or_missing(retired));
                }
                if !retiring.insert(retired.as_str()) {
                    return Err(Error::ValidationError(format!(
                        "node '{}' listed twice in merge rewrite",
                        retired
                    )));
                }
            }
            survivor = Some(rewrite.survivor_id.as_str());
        }

        // Node upserts
        let tree = taxonomy.as_ref().unwrap_or(&self.taxonomy);
        let mut node_writes = Vec::with_capacity(tx.node_upserts.len());
        let mut upserted: HashSet<String> = HashSet::new();
        for node in &tx.node_upserts {
            let mut node = node.clone();
            node.ensure_id();
            if self.retired.contains_key(&node.id) {
                return Err(Error::StaleReference(node.id));
            }
            if retiring.contains(node.id.as_str()) {
                return Err(Error::ValidationError(format!(
                    "node '{}' is retired by this transaction and cannot be upserted",
                    node.id
                )));
            }
            if !upserted.insert(node.id.clone()) {
                return Err(Error::ValidationError(format!(
                    "node '{}' upserted twice in one transaction",
                    node.id
                )));
            }
            node.validate_committable()?;
            match self.nodes.get(&node.id) {
                Some(existing) => {
                    // A node may only move into a category that exists
                    if existing.taxonomy_path != node.taxonomy_path
                        && tree.find_path(&node.taxonomy_path).is_none()
                    {
                        return Err(Error::ValidationError(format!(
                            "node '{}' moved to unknown category path '{}'",
                            node.id,
                            node.taxonomy_path.join(" / ")
                        )));
                    }
                    node.version = existing.version + 1;
                    node.created_at = existing.created_at;
                }
                None => node.version = 1,
            }
            node.updated_at = now;
            applied.node_upserts.push(node.clone());
            node_writes.push(node);
        }

        let redirect = |id: &str| -> String {
            if retiring.contains(id) {
                survivor.unwrap_or(id).to_string()
            } else if let Some(s) = self.retired.get(id) {
                s.clone()
            } else {
                id.to_string()
            }
        };
        let exists_after = |id: &str| -> bool {
            !retiring.contains(id) && (self.nodes.contains_key(id) || upserted.contains(id))
        };

        // Edge upserts
        let mut edge_writes: BTreeMap<String, Edge> = BTreeMap::new();
        for edge in &tx.edge_upserts {
            let mut edge = edge.clone();
            edge.ensure_id();
            if edge_writes.contains_key(&edge.id) {
                return Err(Error::ValidationError(format!(
                    "edge '{}' upserted twice in one transaction",
                    edge.id
                )));
            }
            if let Some(existing) = self.edges.get(&edge.id) {
                edge.created_at = existing.created_at;
            }
            edge.source_id = redirect(&edge.source_id);
            edge.target_id = redirect(&edge.target_id);
            for endpoint in [&edge.source_id, &edge.target_id] {
                if !exists_after(endpoint) {
                    return Err(Error::DanglingReference {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
            edge.validate_shape()?;
            applied.edge_upserts.push(edge.clone());
            edge_writes.insert(edge.id.clone(), edge);
        }

        // Merge rewrite: repoint, drop self-loops, collapse identical edges
        let mut edge_removals = Vec::new();
        let mut retirements = Vec::new();
        if let (Some(survivor), Some(rewrite)) = (survivor, &tx.rewrite) {
            let mut affected: BTreeMap<String, Edge> = BTreeMap::new();
            for id in std::iter::once(survivor).chain(rewrite.retired_ids.iter().map(String::as_str)) {
                for eid in self.adjacency.get(id).into_iter().flatten() {
                    let edge = edge_writes
                        .get(eid)
                        .or_else(|| self.edges.get(eid))
                        .cloned();
                    if let Some(edge) = edge {
                        affected.insert(eid.clone(), edge);
                    }
                }
            }
            for (eid, edge) in &edge_writes {
                if edge.references(survivor) {
                    affected.insert(eid.clone(), edge.clone());
                }
            }

            let mut changed: HashSet<String> = HashSet::new();
            for (eid, edge) in affected.iter_mut() {
                for retired in &rewrite.retired_ids {
                    if edge.repoint(retired, survivor) {
                        changed.insert(eid.clone());
                    }
                }
            }

            let mut removed: Vec<String> = affected
                .values()
                .filter(|e| e.is_self_loop() && !e.relationship_type.is_reflexive_permitted())
                .map(|e| e.id.clone())
                .collect();

            let mut ordered: Vec<&Edge> = affected
                .values()
                .filter(|e| !removed.contains(&e.id))
                .collect();
            ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            let mut keys = HashSet::new();
            for edge in ordered {
                if !keys.insert(edge.identity_key()) {
                    removed.push(edge.id.clone());
                }
            }

            for eid in &removed {
                edge_writes.remove(eid);
                if self.edges.contains_key(eid) {
                    edge_removals.push(eid.clone());
                }
            }
            for eid in changed {
                if removed.contains(&eid) {
                    continue;
                }
                if let Some(edge) = affected.remove(&eid) {
                    edge_writes.insert(eid, edge);
                }
            }
            edge_removals.sort();

            for retired in &rewrite.retired_ids {
                retirements.push((retired.clone(), survivor.to_string()));
            }
        }

        Ok(Staged {
            applied,
            taxonomy,
            node_writes,
            edge_writes,
            edge_removals,
            retirements,
        })
    }

    /// Apply staged changes. Cannot fail.
    fn commit(&mut self, staged: Staged, sequence: u64) {
        if let Some(tree) = staged.taxonomy {
            self.taxonomy = tree;
        }
        for node in staged.node_writes {
            self.nodes.insert(node.id.clone(), node);
        }
        for eid in &staged.edge_removals {
            if let Some(edge) = self.edges.remove(eid) {
                self.unlink(&edge);
            }
        }
        for (eid, edge) in staged.edge_writes {
            if let Some(old) = self.edges.remove(&eid) {
                self.unlink(&old);
            }
            self.adjacency
                .entry(edge.source_id.clone())
                .or_default()
                .insert(eid.clone());
            self.adjacency
                .entry(edge.target_id.clone())
                .or_default()
                .insert(eid.clone());
            self.edges.insert(eid, edge);
        }
        for (retired, survivor) in staged.retirements {
            self.nodes.remove(&retired);
            self.adjacency.remove(&retired);
            for target in self.retired.values_mut() {
                if *target == retired {
                    *target = survivor.clone();
                }
            }
            self.retired.insert(retired, survivor);
        }
        self.last_sequence = sequence;
    }

    fn unlink(&mut self, edge: &Edge) {
        for end in [&edge.source_id, &edge.target_id] {
            if let Some(set) = self.adjacency.get_mut(end) {
                set.remove(&edge.id);
            }
        }
    }
}

/// The single source of truth for committed nodes and edges
pub struct GraphStore {
    state: RwLock<GraphState>,
    /// Held from staging until the staged change is applied
    commit: Mutex<()>,
    log: Arc<dyn CommitLog>,
}

impl GraphStore {
    /// Create an empty store appending to `log`
    pub fn new(log: Arc<dyn CommitLog>) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            commit: Mutex::new(()),
            log,
        }
    }

    /// Create an empty store backed by an in-memory commit log
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCommitLog::new()))
    }

    /// Rebuild a store by replaying every record in `log`
    pub async fn open(log: Arc<dyn CommitLog>) -> Result<Self> {
        let records = log.load_all().await?;
        let mut state = GraphState::default();
        for record in &records {
            if record.sequence != state.last_sequence + 1 {
                return Err(Error::TransactionAborted(format!(
                    "commit log gap: expected sequence {}, found {}",
                    state.last_sequence + 1,
                    record.sequence
                )));
            }
            let staged = state
                .stage(&record.transaction, record.committed_at)
                .map_err(|e| {
                    Error::TransactionAborted(format!(
                        "replay of sequence {} failed: {}",
                        record.sequence, e
                    ))
                })?;
            state.commit(staged, record.sequence);
        }
        info!(
            records = records.len(),
            nodes = state.node_count(),
            edges = state.edge_count(),
            "Replayed commit log"
        );
        Ok(Self {
            state: RwLock::new(state),
            commit: Mutex::new(()),
            log,
        })
    }

    pub fn commit_log(&self) -> Arc<dyn CommitLog> {
        Arc::clone(&self.log)
    }

    /// Apply a transaction atomically: all of it becomes visible, or none
    pub async fn apply(&self, tx: Transaction) -> Result<Commit> {
        let _writer = self.commit.lock().await;
        let committed_at = Utc::now();
        let (staged, sequence) = {
            let state = self.state.read().await;
            let staged = state.stage(&tx, committed_at).inspect_err(|e| {
                debug!(tx_id = %tx.id, error = %e, "Transaction rejected during validation");
            })?;
            (staged, state.last_sequence + 1)
        };

        let record = CommitRecord {
            sequence,
            committed_at,
            transaction: staged.applied.clone(),
            removed_edge_ids: staged.edge_removals.clone(),
        };
        if let Err(e) = self.log.append(&record).await {
            warn!(tx_id = %tx.id, sequence, error = %e, "Commit log append failed, aborting transaction");
            return Err(Error::TransactionAborted(format!(
                "commit log append failed: {}",
                e
            )));
        }

        let commit = Commit {
            sequence,
            node_ids: staged.applied.node_upserts.iter().map(|n| n.id.clone()).collect(),
            edge_ids: staged.edge_writes.keys().cloned().collect(),
            removed_edge_ids: staged.edge_removals.clone(),
        };
        self.state.write().await.commit(staged, sequence);
        debug!(
            tx_id = %tx.id,
            sequence,
            description = %tx.description,
            nodes = commit.node_ids.len(),
            edges = commit.edge_ids.len(),
            "Transaction committed"
        );
        Ok(commit)
    }

    /// Fetch a committed node by id
    pub async fn get_node(&self, id: &str) -> Result<Node> {
        self.state.read().await.get_node(id).cloned()
    }

    pub async fn get_edge(&self, id: &str) -> Result<Edge> {
        self.state.read().await.get_edge(id).cloned()
    }

    /// Upsert a single node, assigning a fresh id if it has none
    pub async fn put_node(&self, mut node: Node) -> Result<String> {
        let id = node.ensure_id().to_string();
        let mut tx = Transaction::new(format!("put node {}", id));
        tx.upsert_node(node);
        self.apply(tx).await?;
        Ok(id)
    }

    /// Upsert a single edge; both endpoints must already be committed
    pub async fn put_edge(&self, mut edge: Edge) -> Result<String> {
        let id = edge.ensure_id().to_string();
        let mut tx = Transaction::new(format!("put edge {}", id));
        tx.upsert_edge(edge);
        self.apply(tx).await?;
        Ok(id)
    }

    pub async fn list_neighbors(
        &self,
        id: &str,
        relationship_filter: Option<&[RelationshipType]>,
    ) -> Result<Vec<Edge>> {
        let state = self.state.read().await;
        Ok(state
            .list_neighbors(id, relationship_filter)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Current id standing for `id`, following retirements
    pub async fn resolve(&self, id: &str) -> Option<String> {
        self.state.read().await.resolve(id)
    }

    /// Read guard over a consistent view of the graph
    pub async fn snapshot(&self) -> GraphSnapshot<'_> {
        self.state.read().await
    }

    /// Copy of the current taxonomy tree
    pub async fn taxonomy(&self) -> TaxonomyTree {
        self.state.read().await.taxonomy().clone()
    }

    pub async fn stats(&self) -> GraphStats {
        self.state.read().await.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::taxonomy::ROOT_ID;
    use async_trait::async_trait;

    fn person(label: &str) -> Node {
        Node::new(label, "person")
            .with_taxonomy_path(["People"])
            .with_confidence(0.8)
    }

    struct FailingLog;

    #[async_trait]
    impl CommitLog for FailingLog {
        async fn append(&self, _record: &CommitRecord) -> Result<()> {
            Err(Error::Other("disk full".to_string()))
        }
        async fn load_all(&self) -> Result<Vec<CommitRecord>> {
            Ok(Vec::new())
        }
        async fn last_sequence(&self) -> Result<u64> {
            Ok(0)
        }
    }

    /// Holds every append until released
    struct SlowLog {
        inner: MemoryCommitLog,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl CommitLog for SlowLog {
        async fn append(&self, record: &CommitRecord) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.append(record).await
        }
        async fn load_all(&self) -> Result<Vec<CommitRecord>> {
            self.inner.load_all().await
        }
        async fn last_sequence(&self) -> Result<u64> {
            self.inner.last_sequence().await
        }
    }

    #[tokio::test]
    async fn test_put_and_get_node() {
        let store = GraphStore::in_memory();
        let id = store.put_node(person("Alice")).await.unwrap();
        assert!(!id.is_empty());

        let node = store.get_node(&id).await.unwrap();
        assert_eq!(node.label, "Alice");
        assert_eq!(node.version, 1);

        let updated = node.clone().with_core("friend of Bob");
        store.put_node(updated).await.unwrap();
        let node = store.get_node(&id).await.unwrap();
        assert_eq!(node.version, 2);
        assert_eq!(node.core, "friend of Bob");

        assert!(matches!(
            store.get_node("missing").await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_edge_requires_endpoints() {
        let store = GraphStore::in_memory();
        let a = store.put_node(person("Alice")).await.unwrap();

        let result = store
            .put_edge(Edge::new(&a, "ghost", RelationshipType::Met))
            .await;
        assert!(matches!(result, Err(Error::DanglingReference { .. })));
        assert_eq!(store.stats().await.edges, 0);
    }

    #[tokio::test]
    async fn test_transaction_is_atomic_on_validation_failure() {
        let store = GraphStore::in_memory();
        let mut tx = Transaction::new("bad batch");
        tx.upsert_node(person("Alice").with_id("a"));
        tx.upsert_node(Node::new("Nowhere", "place").with_id("b"));
        tx.upsert_edge(Edge::new("a", "b", RelationshipType::LocatedIn));

        assert!(store.apply(tx).await.is_err());
        let stats = store.stats().await;
        assert_eq!(stats.nodes, 0);
        assert_eq!(stats.edges, 0);
        assert_eq!(stats.last_sequence, 0);
    }

    #[tokio::test]
    async fn test_transaction_is_atomic_on_log_failure() {
        let store = GraphStore::new(Arc::new(FailingLog));
        let mut tx = Transaction::new("unlucky");
        tx.upsert_node(person("Alice").with_id("a"));
        tx.upsert_node(person("Bob").with_id("b"));
        tx.upsert_edge(Edge::new("a", "b", RelationshipType::Met));

        let result = store.apply(tx).await;
        assert!(matches!(result, Err(Error::TransactionAborted(_))));
        assert_eq!(store.stats().await, GraphStats::default());
    }

    #[tokio::test]
    async fn test_merge_rewrite_repoints_and_collapses_edges() {
        let store = GraphStore::in_memory();
        let mut tx = Transaction::new("seed");
        tx.upsert_node(person("Alice").with_id("a1"));
        tx.upsert_node(person("Alice").with_id("a2"));
        tx.upsert_node(person("Bob").with_id("b"));
        tx.upsert_edge(Edge::new("a1", "b", RelationshipType::Met).with_id("e1"));
        tx.upsert_edge(Edge::new("a2", "b", RelationshipType::Met).with_id("e2"));
        tx.upsert_edge(Edge::new("a2", "b", RelationshipType::Invited).with_id("e3"));
        tx.upsert_edge(Edge::new("a1", "a2", RelationshipType::Knows).with_id("e4"));
        store.apply(tx).await.unwrap();

        let mut merge = Transaction::new("merge");
        merge.upsert_node(store.get_node("a1").await.unwrap());
        merge.set_rewrite("a1", vec!["a2".into()]).unwrap();
        let commit = store.apply(merge).await.unwrap();

        let mut removed = commit.removed_edge_ids.clone();
        removed.sort();
        assert_eq!(removed, vec!["e2", "e4"]);

        let snapshot = store.snapshot().await;
        assert!(snapshot.node("a2").is_none());
        assert_eq!(snapshot.resolve("a2"), Some("a1".to_string()));
        for edge in snapshot.edges() {
            assert!(snapshot.node(&edge.source_id).is_some());
            assert!(snapshot.node(&edge.target_id).is_some());
        }
        assert_eq!(snapshot.get_edge("e3").unwrap().source_id, "a1");
        assert_eq!(snapshot.list_neighbors("a1", None).unwrap().len(), 2);
        assert_eq!(
            snapshot
                .list_neighbors("a1", Some(&[RelationshipType::Invited]))
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_retired_ids_are_stale() {
        let store = GraphStore::in_memory();
        let mut tx = Transaction::new("seed");
        tx.upsert_node(person("A").with_id("a"));
        tx.upsert_node(person("B").with_id("b"));
        tx.upsert_node(person("C").with_id("c"));
        store.apply(tx).await.unwrap();

        let mut merge = Transaction::new("b into a");
        merge.set_rewrite("a", vec!["b".into()]).unwrap();
        store.apply(merge).await.unwrap();

        let mut merge = Transaction::new("a into c");
        merge.set_rewrite("c", vec!["a".into()]).unwrap();
        store.apply(merge).await.unwrap();

        // chain collapsed
        assert_eq!(store.resolve("b").await, Some("c".to_string()));

        let result = store.put_node(person("B again").with_id("b")).await;
        assert!(matches!(result, Err(Error::StaleReference(_))));

        // edges naming a retired endpoint are rewritten to the survivor
        let eid = store
            .put_edge(Edge::new("b", "c", RelationshipType::SameAs))
            .await
            .unwrap();
        let edge = store.get_edge(&eid).await.unwrap();
        assert_eq!(edge.source_id, "c");
    }

    #[tokio::test]
    async fn test_category_additions_fold_into_existing_siblings() {
        let store = GraphStore::in_memory();
        let people = TaxonomyNode::new("People", ROOT_ID);
        let mut tx = Transaction::new("first");
        tx.add_category(people.clone());
        tx.upsert_node(person("Alice"));
        store.apply(tx).await.unwrap();

        let duplicate = TaxonomyNode::new("people", ROOT_ID);
        let friends = TaxonomyNode::new("Friends", &duplicate.id);
        let mut tx = Transaction::new("second");
        tx.add_category(duplicate);
        tx.add_category(friends);
        tx.upsert_node(person("Bob").with_taxonomy_path(["People", "Friends"]));
        store.apply(tx).await.unwrap();

        let tree = store.taxonomy().await;
        assert_eq!(tree.len(), 2);
        assert!(
            tree.find_path(&["People".to_string(), "Friends".to_string()])
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_node_cannot_move_to_unknown_category() {
        let store = GraphStore::in_memory();
        let id = store.put_node(person("Alice")).await.unwrap();

        let moved = store
            .get_node(&id)
            .await
            .unwrap()
            .with_taxonomy_path(["Ghost", "Branch"]);
        let result = store.put_node(moved).await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert_eq!(store.get_node(&id).await.unwrap().taxonomy_path, vec!["People"]);

        // Moving is fine when the category commits alongside the node
        let ghost = TaxonomyNode::new("Ghost", ROOT_ID);
        let mut tx = Transaction::new("move");
        tx.add_category(ghost);
        tx.upsert_node(store.get_node(&id).await.unwrap().with_taxonomy_path(["Ghost"]));
        store.apply(tx).await.unwrap();
        assert_eq!(store.get_node(&id).await.unwrap().taxonomy_path, vec!["Ghost"]);
    }

    #[tokio::test]
    async fn test_readers_proceed_during_log_append() {
        let log = Arc::new(SlowLog {
            inner: MemoryCommitLog::new(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let store = Arc::new(GraphStore::new(log.clone()));

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.put_node(person("Alice").with_id("a")).await })
        };
        log.entered.notified().await;

        let stats = tokio::time::timeout(std::time::Duration::from_secs(1), store.stats())
            .await
            .unwrap();
        assert_eq!(stats.nodes, 0);

        log.release.notify_one();
        writer.await.unwrap().unwrap();
        assert_eq!(store.stats().await.nodes, 1);
        assert_eq!(store.stats().await.last_sequence, 1);
    }

    #[tokio::test]
    async fn test_replay_reproduces_state() {
        let log = Arc::new(MemoryCommitLog::new());
        let store = GraphStore::new(log.clone());
        let mut tx = Transaction::new("seed");
        tx.add_category(TaxonomyNode::new("People", ROOT_ID));
        tx.upsert_node(person("Alice").with_id("a1"));
        tx.upsert_node(person("Alice").with_id("a2"));
        tx.upsert_node(person("Bob").with_id("b"));
        tx.upsert_edge(Edge::new("a2", "b", RelationshipType::Met));
        store.apply(tx).await.unwrap();
        let mut merge = Transaction::new("merge");
        merge.set_rewrite("a1", vec!["a2".into()]).unwrap();
        store.apply(merge).await.unwrap();

        let replayed = GraphStore::open(log).await.unwrap();
        assert_eq!(replayed.stats().await, store.stats().await);
        let original = store.snapshot().await;
        let copy = replayed.snapshot().await;
        for node in original.nodes() {
            assert_eq!(copy.node(&node.id), Some(node));
        }
        for edge in original.edges() {
            assert_eq!(copy.get_edge(&edge.id).unwrap(), edge);
        }
    }
}
