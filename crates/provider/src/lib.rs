//! # Broker Provider
//!
//! The capability contract every inference backend implements, plus clients
//! for the two local servers we support.
//!
//! ```text
//! ModelProvider (trait)
//!     ├──> LmStudioClient   /v1/models, /v1/chat/completions
//!     ├──> OllamaClient     /api/tags, /api/show, /api/chat
//!     └──> ScriptedProvider canned replies (dry runs, tests)
//! ```
//!
//! Failures are reported as [`ProviderError`]: `Unavailable` for transport
//! and server faults, `Timeout` when the per-request bound elapses, and
//! `InvalidResponse` when the server answers with something unusable.

mod descriptor;
mod error;
mod lmstudio;
mod ollama;
mod provider;
mod scripted;

use std::sync::Arc;

pub use descriptor::{parse_param_billions, ModelDescriptor, ParamSizeHint, ProviderKind};
pub use error::{ProviderError, Result};
pub use lmstudio::{LmStudioClient, LMSTUDIO_DEFAULT_CONTEXT_WINDOW};
pub use ollama::{OllamaClient, OLLAMA_DEFAULT_CONTEXT_WINDOW};
pub use provider::{Completion, CompletionRequest, ModelProvider};
pub use scripted::ScriptedProvider;

/// Build the client for `kind`, defaulting the base URL per backend.
pub fn build_provider(kind: ProviderKind, base_url: Option<&str>) -> Arc<dyn ModelProvider> {
    let base_url = base_url.unwrap_or_else(|| kind.default_base_url());
    match kind {
        ProviderKind::LmStudio => Arc::new(LmStudioClient::new(base_url)),
        ProviderKind::Ollama => Arc::new(OllamaClient::new(base_url)),
    }
}
