//! Model client
//!
//! The core never decides what a model proposes; it only sends a typed
//! request and gets back raw JSON for the gateway to validate.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::types::StageRequest;

/// Anything that can answer a stage request
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Return the raw proposal for `request`
    async fn invoke(&self, request: &StageRequest) -> Result<Value>;
}

/// HTTP endpoint settings
#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    /// URL receiving `{"stage": ..., "payload": ...}` POSTs
    pub endpoint: String,
    /// Sent as a bearer token when present
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8700/v1/proposals".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Model client posting stage requests to a JSON endpoint
#[derive(Clone)]
pub struct HttpModelClient {
    http_client: HttpClient,
    config: HttpModelConfig,
}

impl std::fmt::Debug for HttpModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModelClient")
            .field("endpoint", &self.config.endpoint)
            .field("api_key", &self.config.api_key.is_some())
            .finish()
    }
}

impl HttpModelClient {
    pub fn new(config: HttpModelConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(Error::ConfigError(
                "proposals.endpoint must not be empty".to_string(),
            ));
        }
        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::NetworkError)?;
        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Map a non-success response to an error
    async fn handle_error_response(
        &self,
        request: &StageRequest,
        status: reqwest::StatusCode,
        response: reqwest::Response,
    ) -> Error {
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Error::ModelError(
                "Unauthorized: set LOOM_API_KEY or proposals.api_key".to_string(),
            ),
            422 => Error::ProposalRejected {
                stage: request.stage_name().to_string(),
                reason: format!("endpoint refused the request: {}", truncate(&body)),
            },
            429 => Error::ModelError("Rate limited by model endpoint".to_string()),
            code => Error::ModelError(format!("HTTP {}: {}", code, truncate(&body))),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, request: &StageRequest) -> Result<Value> {
        debug!(
            stage = request.stage_name(),
            subject = request.subject(),
            endpoint = %self.config.endpoint,
            "Sending stage request"
        );

        let mut builder = self.http_client.post(&self.config.endpoint).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            let error = self.handle_error_response(request, status, response).await;
            warn!(stage = request.stage_name(), status = status.as_u16(), error = %error, "Stage request failed");
            return Err(error);
        }

        response.json::<Value>().await.map_err(|e| Error::ProposalRejected {
            stage: request.stage_name().to_string(),
            reason: format!("response is not JSON: {}", e),
        })
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_endpoint() {
        let config = HttpModelConfig {
            endpoint: "  ".to_string(),
            ..HttpModelConfig::default()
        };
        assert!(matches!(
            HttpModelClient::new(config),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let config = HttpModelConfig {
            api_key: Some("secret-key".to_string()),
            ..HttpModelConfig::default()
        };
        let client = HttpModelClient::new(config).unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("8700"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short"), "short");
        let long = "x".repeat(300);
        assert_eq!(truncate(&long).len(), 203);
    }
}
