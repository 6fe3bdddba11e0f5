//! Typed requests sent across the model boundary

use serde::{Deserialize, Serialize};

use crate::domain::graph::Node;

/// A request for one pipeline stage's proposal
///
/// Serialized as `{"stage": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "payload", rename_all = "snake_case")]
pub enum StageRequest {
    /// Rewrite a text unit so referring expressions name their entities
    Resolution {
        unit_id: String,
        text: String,
        /// Preceding units, oldest first
        context: Vec<String>,
    },
    /// Propose a candidate subgraph for a resolved unit
    Extraction { unit_id: String, text: String },
    /// Judge whether a duplicate group is one entity
    Consolidation {
        group_key: String,
        nodes: Vec<Node>,
        notes: Vec<String>,
    },
}

impl StageRequest {
    /// Stage name used in logs and `ProposalRejected` errors
    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Resolution { .. } => "resolution",
            Self::Extraction { .. } => "extraction",
            Self::Consolidation { .. } => "consolidation",
        }
    }

    /// Id of the text unit or group the request concerns
    pub fn subject(&self) -> &str {
        match self {
            Self::Resolution { unit_id, .. } | Self::Extraction { unit_id, .. } => unit_id,
            Self::Consolidation { group_key, .. } => group_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = StageRequest::Extraction {
            unit_id: "u1".to_string(),
            text: "Alice met Bob.".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stage"], "extraction");
        assert_eq!(json["payload"]["text"], "Alice met Bob.");
        assert_eq!(request.stage_name(), "extraction");
        assert_eq!(request.subject(), "u1");
    }
}
