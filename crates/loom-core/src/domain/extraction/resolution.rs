//! Resolution stage
//!
//! Rewrites a text unit so pronouns and other referring expressions name
//! their entities explicitly. The rewrite may only introduce names already
//! present in the unit or its context.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::domain::taxonomy::is_stop_word;
use crate::error::{Error, Result};
use crate::llm::{ProposalGateway, StageRequest};

/// One unit of input text with the units that precede it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    pub text: String,
    /// Preceding units, oldest first
    #[serde(default)]
    pub context: Vec<String>,
}

impl TextUnit {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }
}

/// A unit after resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedUnit {
    pub unit_id: String,
    pub original: String,
    pub text: String,
    pub context: Vec<String>,
}

/// Model output for the resolution stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolutionProposal {
    pub rewritten: String,
}

/// Case-preserving word tokens
fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

fn is_mention(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase) && !is_stop_word(word)
}

/// Reject rewrites that are empty or name entities absent from the unit and
/// its context
pub fn check_faithful(unit: &TextUnit, rewritten: &str) -> Result<()> {
    if rewritten.trim().is_empty() {
        return Err(Error::ProposalRejected {
            stage: "resolution".to_string(),
            reason: "empty rewrite".to_string(),
        });
    }

    let known: HashSet<&str> = words(&unit.text)
        .chain(unit.context.iter().flat_map(|c| words(c)))
        .collect();
    let fabricated: Vec<&str> = words(rewritten)
        .filter(|w| is_mention(w) && !known.contains(w))
        .collect();

    if fabricated.is_empty() {
        Ok(())
    } else {
        Err(Error::ProposalRejected {
            stage: "resolution".to_string(),
            reason: format!(
                "rewrite introduces {} absent from the unit and its context",
                fabricated
                    .iter()
                    .map(|w| format!("'{}'", w))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }
}

pub struct ResolutionStage {
    gateway: Arc<ProposalGateway>,
}

impl ResolutionStage {
    pub fn new(gateway: Arc<ProposalGateway>) -> Self {
        Self { gateway }
    }

    pub async fn resolve(&self, unit: &TextUnit) -> Result<ResolvedUnit> {
        let request = StageRequest::Resolution {
            unit_id: unit.id.clone(),
            text: unit.text.clone(),
            context: unit.context.clone(),
        };
        let proposal: ResolutionProposal = self
            .gateway
            .propose_with(&request, |p: &ResolutionProposal| {
                check_faithful(unit, &p.rewritten)
            })
            .await?;

        let text = proposal.rewritten.trim().to_string();
        if text != unit.text {
            debug!(unit_id = %unit.id, original = %unit.text, rewritten = %text, "Unit rewritten");
        }
        Ok(ResolvedUnit {
            unit_id: unit.id.clone(),
            original: unit.text.clone(),
            text,
            context: unit.context.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GatewayConfig;
    use crate::test_support::ScriptedModelClient;
    use serde_json::json;
    use std::time::Duration;

    fn unit() -> TextUnit {
        TextUnit::new("She invited him to the party.")
            .with_context(vec!["Alice met Bob.".to_string()])
    }

    #[test]
    fn test_faithful_rewrite_accepted() {
        assert!(check_faithful(&unit(), "Alice invited Bob to the party.").is_ok());
    }

    #[test]
    fn test_fabricated_entity_rejected() {
        let err = check_faithful(&unit(), "Alice invited Carol to the party.").unwrap_err();
        assert!(err.to_string().contains("'Carol'"));
        assert!(check_faithful(&unit(), "   ").is_err());
    }

    #[test]
    fn test_sentence_initial_stop_word_allowed() {
        let unit = TextUnit::new("it rained");
        assert!(check_faithful(&unit, "The rain fell").is_ok());
        assert!(check_faithful(&unit, "It rained").is_ok());
        assert!(check_faithful(&unit, "Rain fell").is_err());
    }

    #[tokio::test]
    async fn test_resolve_retries_fabrication() {
        let client = Arc::new(ScriptedModelClient::new(|_, attempt| {
            if attempt == 1 {
                Ok(json!({"rewritten": "Alice invited Carol to the party."}))
            } else {
                Ok(json!({"rewritten": "Alice invited Bob to the party."}))
            }
        }));
        let gateway = Arc::new(ProposalGateway::new(
            client.clone(),
            GatewayConfig {
                max_retries: 2,
                retry_backoff: Duration::ZERO,
            },
        ));
        let stage = ResolutionStage::new(gateway);
        let resolved = stage.resolve(&unit()).await.unwrap();
        assert_eq!(resolved.text, "Alice invited Bob to the party.");
        assert_eq!(resolved.original, "She invited him to the party.");
        assert_eq!(client.attempts(), 2);
    }
}
