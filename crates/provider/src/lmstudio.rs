//! LM Studio speaks the OpenAI-compatible `/v1` surface.

use crate::{
    Completion, CompletionRequest, ModelDescriptor, ModelProvider, ProviderError, ProviderKind,
    Result,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Used when `/v1/models` does not advertise a context length.
pub const LMSTUDIO_DEFAULT_CONTEXT_WINDOW: u32 = 4096;

pub struct LmStudioClient {
    http: Client,
    base_url: String,
}

impl LmStudioClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn models_endpoint(&self) -> String {
        format!("{}/v1/models", self.base_url)
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ModelProvider for LmStudioClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LmStudio
    }

    async fn discover(&self) -> Result<Vec<ModelDescriptor>> {
        let response = self
            .http
            .get(self.models_endpoint())
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, DISCOVERY_TIMEOUT))?;
        let body = read_json(response, DISCOVERY_TIMEOUT).await?;
        Ok(parse_models(&body))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut payload = serde_json::json!({
            "model": request.model_id,
            "messages": request.messages(),
            "stream": false,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = serde_json::json!(max_tokens);
        }

        let response = self
            .http
            .post(self.chat_endpoint())
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, request.timeout))?;
        let raw = read_json(response, request.timeout).await?;

        let text = raw
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_response("no completion choices in response"))?
            .to_string();
        Ok(Completion { text, raw })
    }
}

/// Check the status and decode the body, keeping the error taxonomy intact.
pub(crate) async fn read_json(response: reqwest::Response, bound: Duration) -> Result<Value> {
    let status = response.status();
    if status.is_server_error() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::unavailable(format!("HTTP {status}: {text}")));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::invalid_response(format!("HTTP {status}: {text}")));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::from_reqwest(e, bound))
}

fn parse_models(body: &Value) -> Vec<ModelDescriptor> {
    let Some(items) = body.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|model| {
            let id = model
                .get("id")
                .or_else(|| model.get("name"))
                .and_then(Value::as_str)?;
            let context_window = ["context_length", "context_window", "max_context_length"]
                .iter()
                .find_map(|key| model.get(*key).and_then(Value::as_u64))
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(LMSTUDIO_DEFAULT_CONTEXT_WINDOW);
            let family = model
                .get("family")
                .or_else(|| model.get("arch"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(
                ModelDescriptor::new(id, context_window, ProviderKind::LmStudio, None)
                    .with_family(family),
            )
        })
        .collect()
}
