//! Graph edges
//!
//! Edges connect two committed nodes and describe how they relate.
//! Both endpoints must resolve to committed nodes before the edge commits.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A relationship between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub relationship_type: RelationshipType,
    /// Human-readable label, usually the verb phrase from the text
    #[serde(default)]
    pub label: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub source_sentence: Option<String>,
    #[serde(default)]
    pub context_window: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// Create a new edge with no id; the store assigns one on commit
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            id: String::new(),
            label: relationship_type.as_str().replace('_', " "),
            relationship_type,
            source_id: source_id.into(),
            target_id: target_id.into(),
            bidirectional: false,
            source_sentence: None,
            context_window: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn with_source_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.source_sentence = Some(sentence.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Assign a fresh v4 id if the edge has none yet
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    pub fn is_self_loop(&self) -> bool {
        self.source_id == self.target_id
    }

    /// Whether this edge touches the given node
    pub fn references(&self, node_id: &str) -> bool {
        self.source_id == node_id || self.target_id == node_id
    }

    /// The endpoint opposite `node_id`, if the edge touches it
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.source_id == node_id {
            Some(&self.target_id)
        } else if self.target_id == node_id {
            Some(&self.source_id)
        } else {
            None
        }
    }

    /// Repoint any endpoint equal to `from` to `to`
    pub fn repoint(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        if self.source_id == from {
            self.source_id = to.to_string();
            changed = true;
        }
        if self.target_id == from {
            self.target_id = to.to_string();
            changed = true;
        }
        changed
    }

    /// Key under which two edges are considered the same fact.
    /// Bidirectional edges ignore endpoint order.
    pub fn identity_key(&self) -> (String, String, String) {
        let (a, b) = if self.bidirectional && self.target_id < self.source_id {
            (&self.target_id, &self.source_id)
        } else {
            (&self.source_id, &self.target_id)
        };
        (a.clone(), b.clone(), self.relationship_type.as_str().to_string())
    }

    /// Reject self-loops on relationship types that do not permit them
    pub fn validate_shape(&self) -> Result<()> {
        if self.is_self_loop() && !self.relationship_type.is_reflexive_permitted() {
            return Err(Error::ValidationError(format!(
                "edge '{}' is a self-loop on '{}' which is not reflexive",
                self.id, self.relationship_type
            )));
        }
        Ok(())
    }
}

/// Types of relationships between nodes
///
/// Common relations are closed variants; anything else the extractor
/// proposes is kept as `Custom` in snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipType {
    RelatedTo,
    Knows,
    Met,
    Invited,
    WorksFor,
    MemberOf,
    PartOf,
    LocatedIn,
    Created,
    Mentions,
    /// Identity statement; the only built-in type permitting self-loops
    SameAs,
    /// Free-form relation; names prefixed `self_` permit self-loops
    Custom(String),
}

impl RelationshipType {
    /// Get the string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::RelatedTo => "related_to",
            Self::Knows => "knows",
            Self::Met => "met",
            Self::Invited => "invited",
            Self::WorksFor => "works_for",
            Self::MemberOf => "member_of",
            Self::PartOf => "part_of",
            Self::LocatedIn => "located_in",
            Self::Created => "created",
            Self::Mentions => "mentions",
            Self::SameAs => "same_as",
            Self::Custom(name) => name,
        }
    }

    /// Parse from string, normalising case and separators
    pub fn parse(s: &str) -> Self {
        let normalized = s
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        match normalized.as_str() {
            "related_to" | "relatedto" => Self::RelatedTo,
            "knows" => Self::Knows,
            "met" => Self::Met,
            "invited" => Self::Invited,
            "works_for" | "worksfor" => Self::WorksFor,
            "member_of" | "memberof" => Self::MemberOf,
            "part_of" | "partof" => Self::PartOf,
            "located_in" | "locatedin" => Self::LocatedIn,
            "created" => Self::Created,
            "mentions" => Self::Mentions,
            "same_as" | "sameas" => Self::SameAs,
            _ => Self::Custom(normalized),
        }
    }

    /// Whether an edge of this type may point a node at itself
    pub fn is_reflexive_permitted(&self) -> bool {
        match self {
            Self::SameAs => true,
            Self::Custom(name) => name.starts_with("self_"),
            _ => false,
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for RelationshipType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<RelationshipType> for String {
    fn from(t: RelationshipType) -> Self {
        t.as_str().to_string()
    }
}
