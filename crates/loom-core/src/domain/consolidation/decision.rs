//! Merge proposals and decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::dedup::DuplicateGroup;
use crate::domain::graph::{Node, TemporalRange};
use crate::error::{Error, Result};

/// Field values a proposal wants on the merged node
///
/// Applied only when the merge confidence is at least
/// [`UNIFIED_FIELDS_MIN_CONFIDENCE`]; unset fields keep the survivor's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnifiedFields {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub core: Option<String>,
    #[serde(default)]
    pub source_sentence: Option<String>,
    #[serde(default)]
    pub temporal_range: Option<TemporalRange>,
    #[serde(default)]
    pub valid_during: Option<String>,
    #[serde(default)]
    pub semantic_label: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default)]
    pub taxonomy_path: Option<Vec<String>>,
}

pub const UNIFIED_FIELDS_MIN_CONFIDENCE: f32 = 0.5;

/// Model output for the consolidation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeProposal {
    pub same_entity: bool,
    pub merge_confidence: f32,
    #[serde(default)]
    pub review_later: bool,
    #[serde(default)]
    pub unified: UnifiedFields,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl MergeProposal {
    /// A plain "same entity" verdict with no field overrides
    pub fn same(merge_confidence: f32) -> Self {
        Self {
            same_entity: true,
            merge_confidence,
            review_later: false,
            unified: UnifiedFields::default(),
            rationale: None,
        }
    }

    pub fn distinct() -> Self {
        Self {
            same_entity: false,
            ..Self::same(0.0)
        }
    }

    pub fn with_unified(mut self, unified: UnifiedFields) -> Self {
        self.unified = unified;
        self
    }

    pub fn with_review_later(mut self) -> Self {
        self.review_later = true;
        self
    }

    /// Sanity checks beyond the schema
    pub fn validate(&self) -> Result<()> {
        let reject = |reason: String| Error::ProposalRejected {
            stage: "consolidation".to_string(),
            reason,
        };
        if !(0.0..=1.0).contains(&self.merge_confidence) {
            return Err(reject(format!(
                "merge_confidence {} outside [0, 1]",
                self.merge_confidence
            )));
        }
        for (name, value) in [
            ("confidence", self.unified.confidence),
            ("importance", self.unified.importance),
        ] {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                return Err(reject(format!("unified {} {} outside [0, 1]", name, v)));
            }
        }
        if let Some(label) = &self.unified.label
            && label.trim().is_empty()
        {
            return Err(reject("unified label is empty".to_string()));
        }
        if let Some(path) = &self.unified.taxonomy_path
            && path.iter().any(|c| c.trim().is_empty())
        {
            return Err(reject("unified taxonomy path has an empty segment".to_string()));
        }
        Ok(())
    }
}

/// Outcome of consolidating one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MergeDecision {
    Merged {
        into: String,
        unified: Box<Node>,
        retired: Vec<String>,
    },
    Deferred { reason: String },
    Rejected { reason: String },
}

impl MergeDecision {
    pub fn deferred(reason: impl Into<String>) -> Self {
        Self::Deferred {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Merged { .. } => "merged",
            Self::Deferred { .. } => "deferred",
            Self::Rejected { .. } => "rejected",
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    pub fn survivor(&self) -> Option<&str> {
        match self {
            Self::Merged { into, .. } => Some(into),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Deferred { reason } | Self::Rejected { reason } => Some(reason),
            Self::Merged { .. } => None,
        }
    }
}

/// A deferred group queued for review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredMerge {
    pub group: DuplicateGroup,
    pub reason: String,
    pub proposal: Option<MergeProposal>,
    pub deferred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_schema_is_closed() {
        let ok = r#"{"same_entity": true, "merge_confidence": 0.9, "unified": {"core": "x"}}"#;
        let proposal: MergeProposal = serde_json::from_str(ok).unwrap();
        assert_eq!(proposal.unified.core.as_deref(), Some("x"));
        assert!(!proposal.review_later);

        let extra = r#"{"same_entity": true, "merge_confidence": 0.9, "verdict": "yes"}"#;
        assert!(serde_json::from_str::<MergeProposal>(extra).is_err());
    }

    #[test]
    fn test_proposal_validation() {
        assert!(MergeProposal::same(0.8).validate().is_ok());
        assert!(MergeProposal::same(1.2).validate().is_err());
        let bad = MergeProposal::same(0.8).with_unified(UnifiedFields {
            importance: Some(-0.1),
            ..UnifiedFields::default()
        });
        assert!(matches!(
            bad.validate(),
            Err(Error::ProposalRejected { .. })
        ));
    }

    #[test]
    fn test_decision_accessors() {
        let d = MergeDecision::rejected("already-merged");
        assert_eq!(d.kind(), "rejected");
        assert_eq!(d.reason(), Some("already-merged"));
        assert_eq!(d.survivor(), None);
    }
}
