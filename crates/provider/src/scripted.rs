//! In-process provider that replays canned answers.
//!
//! Used for dry runs and by the tests of every downstream crate; it records
//! each call so callers can assert on traffic.

use crate::{
    Completion, CompletionRequest, ModelDescriptor, ModelProvider, ProviderError, ProviderKind,
    Result,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

pub struct ScriptedProvider {
    kind: ProviderKind,
    models: Mutex<std::result::Result<Vec<ModelDescriptor>, ProviderError>>,
    replies: Mutex<HashMap<String, VecDeque<Result<String>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    discover_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self {
            kind: ProviderKind::LmStudio,
            models: Mutex::new(Ok(models)),
            replies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            discover_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn set_models(&self, models: Vec<ModelDescriptor>) {
        *self.models.lock().unwrap_or_else(PoisonError::into_inner) = Ok(models);
    }

    /// Make every following `discover` fail with `err`.
    pub fn fail_discovery(&self, err: ProviderError) {
        *self.models.lock().unwrap_or_else(PoisonError::into_inner) = Err(err);
    }

    /// Queue the next answer for `model_id`. Answers are consumed in order.
    pub fn push_reply(&self, model_id: &str, reply: Result<String>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model_id.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn requests_for(&self, model_id: &str) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.model_id == model_id)
            .collect()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn discover(&self) -> Result<Vec<ModelDescriptor>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&request.model_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ProviderError::unavailable(format!(
                    "no scripted reply for {}",
                    request.model_id
                )))
            });
        let text = reply?;
        let raw = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": text } }]
        });
        Ok(Completion { text, raw })
    }
}
