//! Ollama's native `/api` surface.

use crate::lmstudio::read_json;
use crate::{
    parse_param_billions, Completion, CompletionRequest, ModelDescriptor, ModelProvider,
    ProviderError, ProviderKind, Result,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// `/api/tags` never reports a context length; `/api/show` usually does.
pub const OLLAMA_DEFAULT_CONTEXT_WINDOW: u32 = 8192;

pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    async fn show_context_window(&self, model: &str) -> Option<u32> {
        let response = self
            .http
            .post(format!("{}/api/show", self.base_url))
            .timeout(DISCOVERY_TIMEOUT)
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await
            .ok()?;
        let body = read_json(response, DISCOVERY_TIMEOUT).await.ok()?;
        context_window_from_show(&body)
    }
}

#[async_trait]
impl ModelProvider for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn discover(&self) -> Result<Vec<ModelDescriptor>> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, DISCOVERY_TIMEOUT))?;
        let body = read_json(response, DISCOVERY_TIMEOUT).await?;

        let Some(items) = body.get("models").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        let mut models = Vec::with_capacity(items.len());
        for item in items {
            let Some(name) = item
                .get("name")
                .or_else(|| item.get("model"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let params = item
                .pointer("/details/parameter_size")
                .and_then(Value::as_str)
                .and_then(parse_param_billions);
            let family = item
                .pointer("/details/family")
                .and_then(Value::as_str)
                .map(str::to_string);
            let context_window = match self.show_context_window(name).await {
                Some(cw) => cw,
                None => {
                    log::debug!("No context length reported for {name}; assuming {OLLAMA_DEFAULT_CONTEXT_WINDOW}");
                    OLLAMA_DEFAULT_CONTEXT_WINDOW
                }
            };
            models.push(
                ModelDescriptor::new(name, context_window, ProviderKind::Ollama, params)
                    .with_family(family),
            );
        }
        Ok(models)
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            options.insert("temperature".into(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".into(), serde_json::json!(max_tokens));
        }
        let payload = serde_json::json!({
            "model": request.model_id,
            "messages": request.messages(),
            "stream": false,
            "options": options,
        });

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, request.timeout))?;
        let raw = read_json(response, request.timeout).await?;

        let text = raw
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_response("no message in response"))?
            .to_string();
        Ok(Completion { text, raw })
    }
}

/// `model_info` carries `<arch>.context_length`; older servers only expose
/// `num_ctx` inside the `parameters` text block.
fn context_window_from_show(body: &Value) -> Option<u32> {
    if let Some(info) = body.get("model_info").and_then(Value::as_object) {
        let found = info
            .iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, v)| v.as_u64());
        if let Some(cw) = found {
            return u32::try_from(cw).ok();
        }
    }

    body.get("parameters")
        .and_then(Value::as_str)
        .and_then(|params| {
            params.lines().find_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("num_ctx"), Some(v)) => v.parse::<u32>().ok(),
                    _ => None,
                }
            })
        })
}
