use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which inference backend a model was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    LmStudio,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LmStudio => "lmstudio",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::LmStudio => "http://localhost:1234",
            Self::Ollama => "http://localhost:11434",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse model size bucket. Drives request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamSizeHint {
    Small,
    Medium,
    Large,
}

/// Families that are slow enough locally to be treated as large when the
/// parameter count is not advertised.
const LARGE_FAMILY_MARKERS: &[&str] = &["codellama", "wizardcoder", "mistral", "llama-3", "qwen2.5"];

static PARAM_COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])(\d+(?:\.\d+)?)\s*b(?:$|[^a-z0-9])").expect("valid regex")
});

impl ParamSizeHint {
    /// Classify a model by parameter count, falling back to id markers and
    /// finally to the context window size.
    pub fn classify(model_id: &str, param_count_billions: Option<f64>, context_window: u32) -> Self {
        if let Some(billions) = param_count_billions {
            return if billions >= 7.0 {
                Self::Large
            } else if billions >= 3.0 {
                Self::Medium
            } else {
                Self::Small
            };
        }

        let lowered = model_id.to_ascii_lowercase();
        if LARGE_FAMILY_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Self::Large;
        }

        if context_window > 8000 {
            Self::Large
        } else if context_window > 4000 {
            Self::Medium
        } else {
            Self::Small
        }
    }

    /// The next bucket up; `Large` saturates.
    pub fn escalate(self) -> Self {
        match self {
            Self::Small => Self::Medium,
            Self::Medium | Self::Large => Self::Large,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for ParamSizeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract a parameter count in billions from strings like `qwen2.5-coder-7b`,
/// `deepseek-r1:14b` or Ollama's `"7.6B"`.
pub fn parse_param_billions(text: &str) -> Option<f64> {
    PARAM_COUNT_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .find(|v| *v > 0.0)
}

/// Immutable snapshot of what a provider reports about one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub context_window: u32,
    pub param_size_hint: ParamSizeHint,
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_count_billions: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        context_window: u32,
        provider: ProviderKind,
        param_count_billions: Option<f64>,
    ) -> Self {
        let id = id.into();
        let param_count_billions = param_count_billions.or_else(|| parse_param_billions(&id));
        let param_size_hint = ParamSizeHint::classify(&id, param_count_billions, context_window);
        Self {
            id,
            context_window,
            param_size_hint,
            provider,
            param_count_billions,
            family: None,
        }
    }

    pub fn with_family(mut self, family: Option<String>) -> Self {
        self.family = family.filter(|f| !f.trim().is_empty());
        self
    }

    /// Embedding models cannot answer chat prompts.
    pub fn is_embedding_model(&self) -> bool {
        let id = self.id.to_ascii_lowercase();
        id.contains("embed")
    }
}
