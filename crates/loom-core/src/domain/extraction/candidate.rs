//! Candidate subgraphs
//!
//! Extraction proposes nodes and edges that exist only within one batch.
//! They carry batch-scoped temp ids until the consolidation engine commits
//! them and assigns stable ids.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::graph::{Node, RelationshipType, TemporalRange};
use crate::domain::taxonomy::Placement;
use crate::error::{Error, Result};

fn default_score() -> f32 {
    0.5
}

/// A proposed node, not yet committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateNode {
    pub temp_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    #[serde(default)]
    pub core: String,
    #[serde(default)]
    pub source_sentence: Option<String>,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub temporal_range: Option<TemporalRange>,
    #[serde(default)]
    pub valid_during: Option<String>,
    #[serde(default)]
    pub semantic_label: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_score")]
    pub confidence: f32,
    #[serde(default = "default_score")]
    pub importance: f32,
    /// Attached by taxonomy placement; never part of the model output
    #[serde(skip)]
    pub placement: Option<Placement>,
}

impl CandidateNode {
    pub fn new(
        temp_id: impl Into<String>,
        label: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            temp_id: temp_id.into(),
            node_type: node_type.into(),
            label: label.into(),
            core: String::new(),
            source_sentence: None,
            aliases: BTreeSet::new(),
            tags: BTreeSet::new(),
            temporal_range: None,
            valid_during: None,
            semantic_label: None,
            status: None,
            confidence: default_score(),
            importance: default_score(),
            placement: None,
        }
    }

    pub fn with_core(mut self, core: impl Into<String>) -> Self {
        self.core = core.into();
        self
    }

    pub fn with_source_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.source_sentence = Some(sentence.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Build the node to commit under `id`
    ///
    /// Fails if the candidate has not been placed in the taxonomy.
    pub fn to_node(&self, id: impl Into<String>, now: DateTime<Utc>) -> Result<Node> {
        let placement = self.placement.as_ref().ok_or_else(|| {
            Error::ValidationError(format!(
                "candidate '{}' ({}) has no taxonomy placement",
                self.temp_id, self.label
            ))
        })?;
        let mut node = Node::new(self.label.trim(), &self.node_type)
            .with_id(id)
            .with_core(&self.core)
            .with_tags(self.tags.iter().cloned())
            .with_confidence(self.confidence)
            .with_importance(self.importance)
            .with_taxonomy_path(placement.path.iter().cloned())
            .with_created_at(now);
        for alias in &self.aliases {
            node.add_alias(alias.clone());
        }
        node.source_sentence = self.source_sentence.clone();
        node.temporal_range = self.temporal_range.clone();
        node.valid_during = self.valid_during.clone();
        node.semantic_label = self.semantic_label.clone();
        node.status = self.status.clone();
        Ok(node)
    }
}

/// A proposed edge between two temp ids of the same batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateEdge {
    pub temp_id: String,
    pub relationship_type: RelationshipType,
    #[serde(default)]
    pub label: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub source_sentence: Option<String>,
    #[serde(default)]
    pub context_window: Option<String>,
}

impl CandidateEdge {
    pub fn new(
        temp_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            temp_id: temp_id.into(),
            label: relationship_type.as_str().replace('_', " "),
            relationship_type,
            source: source.into(),
            target: target.into(),
            bidirectional: false,
            source_sentence: None,
            context_window: None,
        }
    }
}

/// Everything extraction proposed for one text unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub batch_id: String,
    pub unit_id: String,
    pub nodes: Vec<CandidateNode>,
    pub edges: Vec<CandidateEdge>,
}

impl CandidateBatch {
    pub fn new(
        unit_id: impl Into<String>,
        nodes: Vec<CandidateNode>,
        edges: Vec<CandidateEdge>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            unit_id: unit_id.into(),
            nodes,
            edges,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, temp_id: &str) -> Option<&CandidateNode> {
        self.nodes.iter().find(|n| n.temp_id == temp_id)
    }

    /// Check the batch as a whole; any failure discards all of it
    pub fn validate(&self) -> Result<()> {
        let mut temp_ids: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if node.temp_id.trim().is_empty() {
                return Err(Error::ValidationError(format!(
                    "candidate node '{}' has no temp id",
                    node.label
                )));
            }
            if !temp_ids.insert(node.temp_id.as_str()) {
                return Err(Error::ValidationError(format!(
                    "temp id '{}' used by more than one candidate node",
                    node.temp_id
                )));
            }
            if node.label.trim().is_empty() {
                return Err(Error::ValidationError(format!(
                    "candidate node '{}' has an empty label",
                    node.temp_id
                )));
            }
            if node.node_type.trim().is_empty() {
                return Err(Error::ValidationError(format!(
                    "candidate node '{}' has no type",
                    node.temp_id
                )));
            }
            if !(node.confidence > 0.0 && node.confidence <= 1.0) {
                return Err(Error::ValidationError(format!(
                    "candidate node '{}' has confidence {} outside (0, 1]",
                    node.temp_id, node.confidence
                )));
            }
            if !(0.0..=1.0).contains(&node.importance) {
                return Err(Error::ValidationError(format!(
                    "candidate node '{}' has importance {} outside [0, 1]",
                    node.temp_id, node.importance
                )));
            }
            if let Some(range) = &node.temporal_range {
                for bound in [&range.start, &range.end].into_iter().flatten() {
                    if !(0.0..=1.0).contains(&bound.confidence) {
                        return Err(Error::ValidationError(format!(
                            "candidate node '{}' has a temporal bound confidence outside [0, 1]",
                            node.temp_id
                        )));
                    }
                }
            }
        }

        let mut edge_ids: HashSet<&str> = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.temp_id.as_str()) || temp_ids.contains(edge.temp_id.as_str()) {
                return Err(Error::ValidationError(format!(
                    "temp id '{}' is not unique within the batch",
                    edge.temp_id
                )));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !temp_ids.contains(endpoint.as_str()) {
                    return Err(Error::DanglingTempReference {
                        edge: edge.temp_id.clone(),
                        temp_id: endpoint.clone(),
                    });
                }
            }
            if edge.source == edge.target && !edge.relationship_type.is_reflexive_permitted() {
                return Err(Error::ValidationError(format!(
                    "edge '{}' is a self-loop on non-reflexive relationship '{}'",
                    edge.temp_id, edge.relationship_type
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::taxonomy::Placement;

    fn alice_bob() -> CandidateBatch {
        CandidateBatch::new(
            "u1",
            vec![
                CandidateNode::new("n1", "Alice", "person"),
                CandidateNode::new("n2", "Bob", "person"),
            ],
            vec![CandidateEdge::new("e1", "n1", "n2", RelationshipType::Met)],
        )
    }

    #[test]
    fn test_valid_batch() {
        assert!(alice_bob().validate().is_ok());
    }

    #[test]
    fn test_dangling_temp_reference() {
        let mut batch = alice_bob();
        batch.edges[0].target = "n9".to_string();
        match batch.validate() {
            Err(Error::DanglingTempReference { edge, temp_id }) => {
                assert_eq!(edge, "e1");
                assert_eq!(temp_id, "n9");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_temp_ids_and_self_loops() {
        let mut batch = alice_bob();
        batch.nodes[1].temp_id = "n1".to_string();
        assert!(matches!(batch.validate(), Err(Error::ValidationError(_))));

        let mut batch = alice_bob();
        batch.edges[0].target = "n1".to_string();
        assert!(matches!(batch.validate(), Err(Error::ValidationError(_))));

        batch.edges[0].relationship_type = RelationshipType::SameAs;
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_scores() {
        let mut batch = alice_bob();
        batch.nodes[0].confidence = 0.0;
        assert!(batch.validate().is_err());
        let mut batch = alice_bob();
        batch.nodes[0].importance = 1.5;
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{"temp_id": "n1", "type": "person", "label": "Alice", "mood": "happy"}"#;
        assert!(serde_json::from_str::<CandidateNode>(json).is_err());
        let json = r#"{"temp_id": "n1", "type": "person", "label": "Alice"}"#;
        let node: CandidateNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.confidence, 0.5);
    }

    #[test]
    fn test_to_node_requires_placement() {
        let mut candidate = CandidateNode::new("n1", "Alice", "person");
        assert!(candidate.to_node("a", Utc::now()).is_err());
        candidate.aliases.insert("Alice".to_string());
        candidate.aliases.insert("Ali".to_string());
        candidate.placement = Some(Placement {
            path: vec!["Person".to_string()],
            confidence: 1.0,
            keywords: vec!["alice".to_string()],
            new_category: None,
        });
        let node = candidate.to_node("a", Utc::now()).unwrap();
        assert_eq!(node.taxonomy_path, vec!["Person"]);
        assert_eq!(node.aliases.len(), 1);
        assert!(node.validate_committable().is_ok());
    }
}
