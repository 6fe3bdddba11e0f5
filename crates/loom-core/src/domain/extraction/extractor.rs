//! Extraction stage
//!
//! Turns a resolved unit into a candidate batch. A proposal that decodes but
//! fails batch validation is discarded whole.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::candidate::{CandidateBatch, CandidateEdge, CandidateNode};
use super::resolution::ResolvedUnit;
use crate::error::Result;
use crate::llm::{ProposalGateway, StageRequest};

/// Model output for the extraction stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionProposal {
    #[serde(default)]
    pub nodes: Vec<CandidateNode>,
    #[serde(default)]
    pub edges: Vec<CandidateEdge>,
}

impl ExtractionProposal {
    fn into_batch(self, unit: &ResolvedUnit) -> CandidateBatch {
        let context = if unit.context.is_empty() {
            None
        } else {
            Some(unit.context.join(" "))
        };
        let mut edges = self.edges;
        for edge in &mut edges {
            if edge.source_sentence.is_none() {
                edge.source_sentence = Some(unit.text.clone());
            }
            if edge.context_window.is_none() {
                edge.context_window = context.clone();
            }
        }
        CandidateBatch::new(&unit.unit_id, self.nodes, edges)
    }
}

pub struct ExtractionStage {
    gateway: Arc<ProposalGateway>,
}

impl ExtractionStage {
    pub fn new(gateway: Arc<ProposalGateway>) -> Self {
        Self { gateway }
    }

    pub async fn extract(&self, unit: &ResolvedUnit) -> Result<CandidateBatch> {
        let request = StageRequest::Extraction {
            unit_id: unit.unit_id.clone(),
            text: unit.text.clone(),
        };
        let proposal: ExtractionProposal = self
            .gateway
            .propose_with(&request, |p: &ExtractionProposal| {
                p.clone().into_batch(unit).validate()
            })
            .await?;

        let batch = proposal.into_batch(unit);
        if batch.is_empty() {
            debug!(unit_id = %unit.unit_id, "Extraction proposed nothing");
        } else {
            info!(
                unit_id = %unit.unit_id,
                batch_id = %batch.batch_id,
                nodes = batch.nodes.len(),
                edges = batch.edges.len(),
                "Candidate batch extracted"
            );
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::GatewayConfig;
    use crate::test_support::ScriptedModelClient;
    use serde_json::json;
    use std::time::Duration;

    fn resolved() -> ResolvedUnit {
        ResolvedUnit {
            unit_id: "u2".to_string(),
            original: "She invited him.".to_string(),
            text: "Alice invited Bob.".to_string(),
            context: vec!["Alice met Bob.".to_string()],
        }
    }

    fn stage(client: Arc<ScriptedModelClient>) -> ExtractionStage {
        ExtractionStage::new(Arc::new(ProposalGateway::new(
            client,
            GatewayConfig {
                max_retries: 2,
                retry_backoff: Duration::ZERO,
            },
        )))
    }

    #[tokio::test]
    async fn test_extract_fills_provenance() {
        let client = Arc::new(ScriptedModelClient::new(|_, _| {
            Ok(json!({
                "nodes": [
                    {"temp_id": "n1", "type": "person", "label": "Alice"},
                    {"temp_id": "n2", "type": "person", "label": "Bob"}
                ],
                "edges": [
                    {"temp_id": "e1", "relationship_type": "invited", "source": "n1", "target": "n2"}
                ]
            }))
        }));
        let batch = stage(client).extract(&resolved()).await.unwrap();
        assert_eq!(batch.unit_id, "u2");
        assert_eq!(batch.nodes.len(), 2);
        let edge = &batch.edges[0];
        assert_eq!(edge.source_sentence.as_deref(), Some("Alice invited Bob."));
        assert_eq!(edge.context_window.as_deref(), Some("Alice met Bob."));
    }

    #[tokio::test]
    async fn test_dangling_batch_discarded_without_retry() {
        let client = Arc::new(ScriptedModelClient::new(|_, _| {
            Ok(json!({
                "nodes": [{"temp_id": "n1", "type": "person", "label": "Alice"}],
                "edges": [
                    {"temp_id": "e1", "relationship_type": "met", "source": "n1", "target": "n7"}
                ]
            }))
        }));
        let result = stage(client.clone()).extract(&resolved()).await;
        assert!(matches!(result, Err(Error::DanglingTempReference { .. })));
        assert_eq!(client.attempts(), 1);
    }
}
