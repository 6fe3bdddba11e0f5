//! Graph nodes
//!
//! A node is a typed entity with a label, free-text core, provenance and
//! a taxonomy path. Committed nodes are owned by the graph store; every other
//! component works on clones and submits changes as transactions.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A committed (or about to be committed) graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier, assigned once on first commit
    pub id: String,
    /// Entity type as proposed by extraction (e.g. "person")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Display label
    pub label: String,
    /// Short free-text description of what the node is
    #[serde(default)]
    pub core: String,
    /// Sentence the node was extracted from
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
    /// Free-form lifecycle tag
    #[serde(default)]
    pub status: Option<String>,
    pub confidence: f32,
    pub importance: f32,
    /// Category labels from the first level below the taxonomy root
    #[serde(default)]
    pub taxonomy_path: Vec<String>,
    /// Incremented by the store on every committed change
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node with no id; the store assigns one on commit
    pub fn new(label: impl Into<String>, node_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
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
            confidence: 0.5,
            importance: 0.5,
            taxonomy_path: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_core(mut self, core: impl Into<String>) -> Self {
        self.core = core.into();
        self
    }

    pub fn with_source_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.source_sentence = Some(sentence.into());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_temporal_range(mut self, range: TemporalRange) -> Self {
        self.temporal_range = Some(range);
        self
    }

    /// Set confidence score (clamped to 0.0-1.0)
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Set importance score (clamped to 0.0-1.0)
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_taxonomy_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.taxonomy_path = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Assign a fresh v4 id if the node has none yet
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// Ranking weight used to pick merge survivors
    pub fn merge_score(&self) -> f32 {
        self.confidence * self.importance
    }

    /// Add an alias unless it canonicalizes to the label or an existing alias
    pub fn add_alias(&mut self, alias: impl Into<String>) -> bool {
        let alias = alias.into();
        let canonical = canonicalize(&alias);
        if canonical.is_empty() || canonical == canonicalize(&self.label) {
            return false;
        }
        if self.aliases.iter().any(|a| canonicalize(a) == canonical) {
            return false;
        }
        self.aliases.insert(alias)
    }

    /// Check if this node matches a name (label or any alias)
    pub fn matches_name(&self, query: &str) -> bool {
        let canonical_query = canonicalize(query);
        if canonicalize(&self.label) == canonical_query {
            return true;
        }
        self.aliases
            .iter()
            .any(|alias| canonicalize(alias) == canonical_query)
    }

    /// Canonical forms of the label and every alias
    pub fn canonical_names(&self) -> BTreeSet<String> {
        std::iter::once(&self.label)
            .chain(self.aliases.iter())
            .map(|n| canonicalize(n))
            .filter(|n| !n.is_empty())
            .collect()
    }

    /// Check the invariants every committed node must hold
    pub fn validate_committable(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(Error::ValidationError(format!(
                "node '{}' has an empty label",
                self.id
            )));
        }
        if self.taxonomy_path.is_empty() || self.taxonomy_path.iter().any(|c| c.trim().is_empty())
        {
            return Err(Error::ValidationError(format!(
                "node '{}' ({}) has no taxonomy path",
                self.id, self.label
            )));
        }
        if !(self.confidence > 0.0 && self.confidence <= 1.0) {
            return Err(Error::ValidationError(format!(
                "node '{}' ({}) has confidence {} outside (0, 1]",
                self.id, self.label, self.confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(Error::ValidationError(format!(
                "node '{}' ({}) has importance {} outside [0, 1]",
                self.id, self.label, self.importance
            )));
        }
        Ok(())
    }
}

/// Canonicalize a name for comparison
///
/// Converts to lowercase, removes special characters, and normalizes whitespace
pub fn canonicalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One end of a temporal range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemporalBound {
    pub at: DateTime<Utc>,
    pub confidence: f32,
}

impl TemporalBound {
    pub fn new(at: DateTime<Utc>, confidence: f32) -> Self {
        Self {
            at,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// When a node's facts hold, each bound carrying its own confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemporalRange {
    #[serde(default)]
    pub start: Option<TemporalBound>,
    #[serde(default)]
    pub end: Option<TemporalBound>,
}

impl TemporalRange {
    pub fn new(start: Option<TemporalBound>, end: Option<TemporalBound>) -> Self {
        Self { start, end }
    }

    /// Start strictly after end
    pub fn is_inverted(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => s.at > e.at,
            _ => false,
        }
    }

    /// Mean confidence of the bounds present
    pub fn confidence(&self) -> f32 {
        let bounds: Vec<f32> = [&self.start, &self.end]
            .into_iter()
            .flatten()
            .map(|b| b.confidence)
            .collect();
        if bounds.is_empty() {
            0.0
        } else {
            bounds.iter().sum::<f32>() / bounds.len() as f32
        }
    }

    /// True when `self` lies within `other` (open ends count as unbounded)
    pub fn is_within(&self, other: &TemporalRange) -> bool {
        let start_ok = match (&self.start, &other.start) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a.at >= b.at,
        };
        let end_ok = match (&self.end, &other.end) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a.at <= b.at,
        };
        start_ok && end_ok
    }

    /// Same instants, ignoring confidences
    pub fn same_span(&self, other: &TemporalRange) -> bool {
        self.start.as_ref().map(|b| b.at) == other.start.as_ref().map(|b| b.at)
            && self.end.as_ref().map(|b| b.at) == other.end.as_ref().map(|b| b.at)
    }

    /// Pick between two conflicting ranges: the narrower one when one
    /// contains the other, otherwise the more confident one. `current` wins ties.
    pub fn prefer<'a>(current: &'a TemporalRange, other: &'a TemporalRange) -> &'a TemporalRange {
        if current.same_span(other) {
            return if other.confidence() > current.confidence() {
                other
            } else {
                current
            };
        }
        if other.is_within(current) {
            return other;
        }
        if current.is_within(other) {
            return current;
        }
        if other.confidence() > current.confidence() {
            other
        } else {
            current
        }
    }

    /// Swap start and end
    pub fn swapped(&self) -> TemporalRange {
        TemporalRange {
            start: self.end.clone(),
            end: self.start.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_node_creation() {
        let node = Node::new("Alice", "person")
            .with_core("A person named Alice")
            .with_confidence(1.7)
            .with_importance(0.4);

        assert!(node.id.is_empty());
        assert_eq!(node.node_type, "person");
        assert_eq!(node.confidence, 1.0);
        assert!((node.merge_score() - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_add_alias_skips_label_and_duplicates() {
        let mut node = Node::new("Alice", "person");
        assert!(!node.add_alias("alice"));
        assert!(node.add_alias("Ali"));
        assert!(!node.add_alias("ALI"));
        assert_eq!(node.aliases.len(), 1);
        assert!(node.matches_name("ali"));
    }

    #[test]
    fn test_validate_committable() {
        let node = Node::new("Alice", "person");
        assert!(matches!(
            node.validate_committable(),
            Err(Error::ValidationError(_))
        ));

        let node = node.with_taxonomy_path(["People"]);
        assert!(node.validate_committable().is_ok());

        let node = node.with_confidence(0.0);
        assert!(node.validate_committable().is_err());
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("  Dr.  Alice   Smith "), "dr alice smith");
        assert_eq!(canonicalize("C++"), "c");
    }

    #[test]
    fn test_temporal_prefer_narrower() {
        let wide = TemporalRange::new(
            Some(TemporalBound::new(at(1990), 0.9)),
            Some(TemporalBound::new(at(2010), 0.9)),
        );
        let narrow = TemporalRange::new(
            Some(TemporalBound::new(at(1995), 0.3)),
            Some(TemporalBound::new(at(2000), 0.3)),
        );
        assert_eq!(TemporalRange::prefer(&wide, &narrow), &narrow);
        assert_eq!(TemporalRange::prefer(&narrow, &wide), &narrow);
    }

    #[test]
    fn test_temporal_prefer_more_confident_when_disjoint() {
        let a = TemporalRange::new(
            Some(TemporalBound::new(at(1990), 0.4)),
            Some(TemporalBound::new(at(1995), 0.4)),
        );
        let b = TemporalRange::new(
            Some(TemporalBound::new(at(2001), 0.8)),
            Some(TemporalBound::new(at(2003), 0.8)),
        );
        assert_eq!(TemporalRange::prefer(&a, &b), &b);
    }

    #[test]
    fn test_inverted_range() {
        let range = TemporalRange::new(
            Some(TemporalBound::new(at(2005), 0.8)),
            Some(TemporalBound::new(at(2001), 0.8)),
        );
        assert!(range.is_inverted());
        assert!(!range.swapped().is_inverted());
    }
}
