use crate::{ModelDescriptor, ProviderKind, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Single-turn chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            timeout,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// OpenAI-style message list.
    pub fn messages(&self) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": self.prompt }));
        messages
    }
}

/// Generated text plus the untouched provider payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub raw: serde_json::Value,
}

/// Capability contract shared by every inference backend.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// from many tasks at once.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// List the models the server currently exposes.
    async fn discover(&self) -> Result<Vec<ModelDescriptor>>;

    /// Run one completion, honouring `request.timeout` as a hard bound.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}
