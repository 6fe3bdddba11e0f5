//! Read-only node selection
//!
//! Seeds come from explicit ids or a full-text match; the explorer then
//! walks outward breadth-first over committed edges. A visited set plus the
//! depth and width bounds keep cyclic graphs finite.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::graph::{GraphState, GraphStore, Node, RelationshipType};
use crate::domain::taxonomy::{content_tokens, tokenize, tokens_match};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    pub text: Option<String>,
    pub seed_ids: Vec<String>,
    /// Only follow these relationship types; all when unset
    pub relationship_filter: Option<Vec<RelationshipType>>,
    pub max_depth: u32,
    /// Neighbours expanded per node
    pub max_width: usize,
    pub limit: usize,
    pub min_score: f32,
    /// Score multiplier per hop
    pub hop_decay: f32,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            text: None,
            seed_ids: Vec::new(),
            relationship_filter: None,
            max_depth: 2,
            max_width: 25,
            limit: 20,
            min_score: 0.0,
            hop_decay: 0.7,
        }
    }
}

impl SelectionCriteria {
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_seeds<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relationships(mut self, types: Vec<RelationshipType>) -> Self {
        self.relationship_filter = Some(types);
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    fn terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for token in self.text.as_deref().map(content_tokens).unwrap_or_default() {
            if !terms.contains(&token) {
                terms.push(token);
            }
        }
        terms
    }
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedNode {
    pub node: Node,
    pub reason: String,
    pub score: f32,
    /// Hops from the nearest seed
    pub distance: u32,
}

/// Share of `terms` found in the node's names, core and tags, with the first
/// term that matched
fn text_relevance<'t>(node: &Node, terms: &'t [String]) -> (f32, Option<&'t str>) {
    if terms.is_empty() {
        return (1.0, None);
    }
    let mut haystack: Vec<String> = tokenize(&node.label);
    for alias in &node.aliases {
        haystack.extend(tokenize(alias));
    }
    haystack.extend(tokenize(&node.core));
    for tag in &node.tags {
        haystack.extend(tokenize(tag));
    }

    let matched: Vec<&str> = terms
        .iter()
        .filter(|t| haystack.iter().any(|h| tokens_match(t, h)))
        .map(String::as_str)
        .collect();
    (
        matched.len() as f32 / terms.len() as f32,
        matched.first().copied(),
    )
}

fn confidence_weight(node: &Node) -> f32 {
    0.5 + 0.5 * node.confidence
}

struct Visit {
    relevance: f32,
    distance: u32,
    reason: String,
}

/// Run a selection against one consistent view of the graph
pub fn select_in(state: &GraphState, criteria: &SelectionCriteria) -> Result<Vec<SelectedNode>> {
    let terms = criteria.terms();
    if terms.is_empty() && criteria.seed_ids.is_empty() {
        return Err(Error::InvalidInput(
            "a query needs search text or seed node ids".to_string(),
        ));
    }

    let mut visits: HashMap<String, Visit> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut queue: VecDeque<String> = VecDeque::new();

    // Explicit seeds; retired ids stand for their survivors
    for raw in &criteria.seed_ids {
        let id = state
            .resolve(raw)
            .ok_or_else(|| Error::NodeNotFound(raw.clone()))?;
        if visits.contains_key(&id) {
            continue;
        }
        let node = state.get_node(&id)?;
        let relevance = if terms.is_empty() {
            1.0
        } else {
            text_relevance(node, &terms).0.max(0.5)
        };
        visits.insert(
            id.clone(),
            Visit {
                relevance,
                distance: 0,
                reason: "seed".to_string(),
            },
        );
        order.push(id.clone());
        queue.push_back(id);
    }

    // Text seeds, best matches first
    if !terms.is_empty() {
        let mut matches: Vec<(&Node, f32, &str)> = state
            .nodes()
            .filter(|n| !visits.contains_key(&n.id))
            .filter_map(|n| match text_relevance(n, &terms) {
                (relevance, Some(term)) if relevance > 0.0 => Some((n, relevance, term)),
                _ => None,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        for (node, relevance, term) in matches.into_iter().take(criteria.max_width.max(1)) {
            visits.insert(
                node.id.clone(),
                Visit {
                    relevance,
                    distance: 0,
                    reason: format!("matched \"{}\"", term),
                },
            );
            order.push(node.id.clone());
            queue.push_back(node.id.clone());
        }
    }

    let filter = criteria.relationship_filter.as_deref();
    while let Some(id) = queue.pop_front() {
        let (distance, relevance) = match visits.get(&id) {
            Some(v) => (v.distance, v.relevance),
            None => continue,
        };
        if distance >= criteria.max_depth {
            continue;
        }
        let Some(from) = state.node(&id) else {
            continue;
        };
        let mut expanded = 0;
        for edge in state.list_neighbors(&id, filter)? {
            if expanded >= criteria.max_width {
                break;
            }
            let Some(next) = edge.other_end(&id) else {
                continue;
            };
            if visits.contains_key(next) {
                continue;
            }
            let Some(node) = state.node(next) else {
                continue;
            };
            let own = text_relevance(node, &terms).0;
            visits.insert(
                next.to_string(),
                Visit {
                    relevance: own.max(relevance),
                    distance: distance + 1,
                    reason: format!(
                        "reached via {} from {} (hop {})",
                        edge.relationship_type,
                        from.label,
                        distance + 1
                    ),
                },
            );
            order.push(next.to_string());
            queue.push_back(next.to_string());
            expanded += 1;
        }
    }

    let mut selected: Vec<SelectedNode> = order
        .into_iter()
        .filter_map(|id| {
            let visit = visits.remove(&id)?;
            let node = state.node(&id)?.clone();
            let score = visit.relevance
                * criteria.hop_decay.powi(visit.distance as i32)
                * confidence_weight(&node);
            Some(SelectedNode {
                node,
                reason: visit.reason,
                score,
                distance: visit.distance,
            })
        })
        .filter(|s| s.score >= criteria.min_score)
        .collect();
    selected.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.distance.cmp(&b.distance))
            .then(a.node.id.cmp(&b.node.id))
    });
    selected.truncate(criteria.limit);
    Ok(selected)
}

/// The read entry point over committed graph state
pub struct QueryExplorer {
    store: Arc<GraphStore>,
}

impl QueryExplorer {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    /// Rank nodes for `criteria` against a snapshot taken at call time
    pub async fn select_nodes(&self, criteria: &SelectionCriteria) -> Result<Vec<SelectedNode>> {
        let snapshot = self.store.snapshot().await;
        let selected = select_in(&snapshot, criteria)?;
        debug!(
            text = criteria.text.as_deref().unwrap_or(""),
            seeds = criteria.seed_ids.len(),
            results = selected.len(),
            "Selection complete"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{Edge, Transaction};
    use std::collections::HashSet;

    fn node(id: &str, label: &str, core: &str) -> Node {
        Node::new(label, "person")
            .with_id(id)
            .with_core(core)
            .with_taxonomy_path(["People"])
            .with_confidence(1.0)
    }

    /// a -> b -> c -> a, plus d hanging off c
    async fn cyclic_store() -> Arc<GraphStore> {
        let store = Arc::new(GraphStore::in_memory());
        let mut tx = Transaction::new("fixture");
        tx.upsert_node(node("a", "Ada Lovelace", "mathematician"))
            .upsert_node(node("b", "Charles Babbage", "engineer"))
            .upsert_node(node("c", "Analytical Engine", "machine"))
            .upsert_node(node("d", "Punch Card", "input medium"))
            .upsert_edge(Edge::new("a", "b", RelationshipType::Knows).with_id("ab"))
            .upsert_edge(Edge::new("b", "c", RelationshipType::Created).with_id("bc"))
            .upsert_edge(Edge::new("c", "a", RelationshipType::RelatedTo).with_id("ca"))
            .upsert_edge(Edge::new("c", "d", RelationshipType::PartOf).with_id("cd"));
        store.apply(tx).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_text_match_ranks_first() {
        let explorer = QueryExplorer::new(cyclic_store().await);
        let results = explorer
            .select_nodes(&SelectionCriteria::default().with_text("Lovelace"))
            .await
            .unwrap();
        assert_eq!(results[0].node.id, "a");
        assert_eq!(results[0].reason, "matched \"lovelace\"");
        assert_eq!(results[0].distance, 0);
        assert!(results.iter().skip(1).all(|r| r.score < results[0].score));
    }

    #[tokio::test]
    async fn test_traversal_terminates_on_cycles() {
        let explorer = QueryExplorer::new(cyclic_store().await);
        let criteria = SelectionCriteria::default().with_seeds(["a"]).with_max_depth(10);
        let results = explorer.select_nodes(&criteria).await.unwrap();
        assert_eq!(results.len(), 4);
        let ids: HashSet<&str> = results.iter().map(|r| r.node.id.as_str()).collect();
        assert_eq!(ids.len(), 4);

        let d = results.iter().find(|r| r.node.id == "d").unwrap();
        assert_eq!(d.distance, 2);
        assert_eq!(d.reason, "reached via part_of from Analytical Engine (hop 2)");
    }

    #[tokio::test]
    async fn test_depth_and_filter_bound_the_walk() {
        let explorer = QueryExplorer::new(cyclic_store().await);
        let shallow = SelectionCriteria::default().with_seeds(["a"]).with_max_depth(1);
        let results = explorer.select_nodes(&shallow).await.unwrap();
        assert!(results.iter().all(|r| r.distance <= 1));
        assert!(!results.iter().any(|r| r.node.id == "d"));

        let knows_only = SelectionCriteria::default()
            .with_seeds(["a"])
            .with_relationships(vec![RelationshipType::Knows]);
        let results = explorer.select_nodes(&knows_only).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.node.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_bad_criteria() {
        let explorer = QueryExplorer::new(cyclic_store().await);
        assert!(matches!(
            explorer.select_nodes(&SelectionCriteria::default()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            explorer
                .select_nodes(&SelectionCriteria::default().with_seeds(["zzz"]))
                .await,
            Err(Error::NodeNotFound(_))
        ));
        let none = explorer
            .select_nodes(&SelectionCriteria::default().with_text("zeppelin"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
