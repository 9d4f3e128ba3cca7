use anyhow::{Context as AnyhowContext, Result};
use broker_harness::TimeoutPolicy;
use broker_provider::ProviderKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "ROO_BROKER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "roo-broker.toml";

/// Everything the binary can be told through `roo-broker.toml`. Missing
/// sections and keys take their defaults; CLI flags win over the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub provider: ProviderConfig,
    pub proxy: ProxyConfig,
    pub harness: HarnessConfig,
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Defaults per backend: `http://localhost:1234` (LM Studio) or
    /// `http://localhost:11434` (Ollama).
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::LmStudio,
            base_url: None,
        }
    }
}

impl ProviderConfig {
    pub fn resolved_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind: String,
    pub reserve_fraction: f64,
    pub cache_ttl_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: broker_proxy::DEFAULT_PROXY_BIND.to_string(),
            reserve_fraction: broker_proxy::RESPONSE_RESERVE_FRACTION,
            cache_ttl_secs: broker_model_cache::DEFAULT_CACHE_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub state_dir: PathBuf,
    /// Model that rewrites failing prompts. The model under test by default.
    pub critic_model: Option<String>,
    pub concurrency: usize,
    /// How long the "continue with next model?" question waits. 0 disables it.
    pub continue_prompt_secs: u64,
    pub timeouts: TimeoutPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".modelstate"),
            critic_model: None,
            concurrency: 1,
            continue_prompt_secs: 5,
            timeouts: TimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub python: String,
    pub case_timeout_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            python: broker_evaluator::DEFAULT_PYTHON.to_string(),
            case_timeout_secs: broker_evaluator::DEFAULT_CASE_TIMEOUT.as_secs(),
        }
    }
}

impl BrokerConfig {
    /// Resolve the config file: `explicit`, then `$ROO_BROKER_CONFIG`, then
    /// `./roo-broker.toml` when present. Only the implicit default may be
    /// missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        match named {
            Some(path) => Self::from_file(&path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.harness.state_dir = expand_home(&config.harness.state_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let reserve = self.proxy.reserve_fraction;
        if !(0.0..1.0).contains(&reserve) {
            anyhow::bail!("proxy.reserve_fraction must be in [0, 1), got {reserve}");
        }
        if self.proxy.cache_ttl_secs == 0 {
            anyhow::bail!("proxy.cache_ttl_secs must be > 0");
        }
        if self.harness.concurrency == 0 {
            anyhow::bail!("harness.concurrency must be >= 1");
        }
        if self.evaluator.case_timeout_secs == 0 {
            anyhow::bail!("evaluator.case_timeout_secs must be > 0");
        }
        if self.evaluator.python.trim().is_empty() {
            anyhow::bail!("evaluator.python must name an interpreter");
        }
        let t = &self.harness.timeouts;
        if t.small_secs == 0 || t.medium_secs == 0 || t.large_secs == 0 {
            anyhow::bail!("harness.timeouts must all be > 0");
        }
        Ok(())
    }
}

/// `~/x` means `$HOME/x`; everything else is taken as written.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = BrokerConfig::from_toml("").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.provider.resolved_base_url(), "http://localhost:1234");
        assert_eq!(config.proxy.bind, "127.0.0.1:1235");
        assert_eq!(config.proxy.reserve_fraction, 0.25);
        assert_eq!(config.proxy.cache_ttl_secs, 300);
        assert_eq!(config.harness.timeouts.large_secs, 120);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = BrokerConfig::from_toml(
            r#"
            [provider]
            kind = "ollama"

            [harness]
            critic_model = "qwen2.5-coder-32b"

            [harness.timeouts]
            large_secs = 300
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Ollama);
        assert_eq!(config.provider.resolved_base_url(), "http://localhost:11434");
        assert_eq!(config.harness.critic_model.as_deref(), Some("qwen2.5-coder-32b"));
        assert_eq!(config.harness.timeouts.large_secs, 300);
        assert_eq!(config.harness.timeouts.small_secs, 30);
        assert_eq!(config.harness.concurrency, 1);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(BrokerConfig::from_toml("[proxy]\nreserve_fraction = 1.0").is_err());
        assert!(BrokerConfig::from_toml("[harness]\nconcurrency = 0").is_err());
        assert!(BrokerConfig::from_toml("[provider]\nkind = \"vllm\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BrokerConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn state_dir_expands_home() {
        let config = BrokerConfig::from_toml("[harness]\nstate_dir = \"~/bench/state\"").unwrap();
        match dirs::home_dir() {
            Some(home) => assert_eq!(config.harness.state_dir, home.join("bench/state")),
            None => assert_eq!(config.harness.state_dir, PathBuf::from("~/bench/state")),
        }

        let config = BrokerConfig::from_toml("[harness]\nstate_dir = \"runs/~x\"").unwrap();
        assert_eq!(config.harness.state_dir, PathBuf::from("runs/~x"));
    }
}
