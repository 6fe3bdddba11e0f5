//! Proposal gateway
//!
//! Sends stage requests through a [`ModelClient`], decodes the response into
//! the stage's closed output type and runs the caller's sanity checks.
//! Malformed or rejected proposals are retried a bounded number of times.
//! Validation failures of a well-formed proposal are returned at once: the
//! batch is discarded rather than re-asked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::client::ModelClient;
use super::types::StageRequest;

/// Retry policy
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Linear backoff step between attempts
    pub retry_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Counters over the gateway's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub requests: u64,
    pub attempts: u64,
    pub rejections: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    attempts: AtomicU64,
    rejections: AtomicU64,
    failures: AtomicU64,
}

pub struct ProposalGateway {
    client: Arc<dyn ModelClient>,
    config: GatewayConfig,
    counters: Counters,
}

impl ProposalGateway {
    pub fn new(client: Arc<dyn ModelClient>, config: GatewayConfig) -> Self {
        Self {
            client,
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Request a proposal with no checks beyond its schema
    pub async fn propose<T>(&self, request: &StageRequest) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.propose_with(request, |_| Ok(())).await
    }

    /// Request a proposal and accept it only once `validate` passes
    ///
    /// `validate` returning `ProposalRejected` triggers a retry; any other
    /// error is returned immediately.
    pub async fn propose_with<T, F>(&self, request: &StageRequest, validate: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<()>,
    {
        let stage = request.stage_name();
        let max_attempts = self.config.max_retries + 1;
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=max_attempts {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            match self.attempt(request, &validate).await {
                Ok(proposal) => {
                    debug!(stage, subject = request.subject(), attempt, "Proposal accepted");
                    return Ok(proposal);
                }
                Err(e) if e.is_retryable_proposal_failure() => {
                    self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        stage,
                        subject = request.subject(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "Proposal rejected"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts && !self.config.retry_backoff.is_zero() {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        info!(stage, subject = request.subject(), max_attempts, "Giving up on proposal");
        Err(Error::ProposalRejected {
            stage: stage.to_string(),
            reason: format!("gave up after {} attempts: {}", max_attempts, reason),
        })
    }

    async fn attempt<T, F>(&self, request: &StageRequest, validate: &F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<()>,
    {
        let raw = self.client.invoke(request).await?;
        let proposal: T = serde_json::from_value(raw).map_err(|e| Error::ProposalRejected {
            stage: request.stage_name().to_string(),
            reason: format!("schema violation: {}", e),
        })?;
        validate(&proposal)?;
        Ok(proposal)
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}
