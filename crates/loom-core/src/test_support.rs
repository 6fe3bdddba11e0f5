//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::llm::{ModelClient, StageRequest};

type Script = dyn Fn(&StageRequest, u32) -> Result<Value> + Send + Sync;

/// A model that answers from a closure
///
/// The closure sees the request and the 1-based number of this invocation
/// across the client's lifetime.
pub struct ScriptedModelClient {
    script: Box<Script>,
    attempts: AtomicU32,
}

impl ScriptedModelClient {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&StageRequest, u32) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            attempts: AtomicU32::new(0),
        }
    }

    /// Invocations so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn invoke(&self, request: &StageRequest) -> Result<Value> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(request, attempt)
    }
}
