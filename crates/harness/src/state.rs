use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// How the final attempt of a task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    FailedGrading,
    ProviderError,
}

/// One persisted task run. Appended to its [`ModelState`], never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub task_id: String,
    pub model_id: String,
    pub passed: bool,
    pub score: f64,
    pub elapsed_ms: u64,
    pub raw_response: String,
    pub used_prompt: String,
    pub retry_count: u32,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timeout_secs: u64,
    pub recorded_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub schema_version: u32,
    pub model_id: String,
    pub context_window: u32,
    #[serde(default)]
    pub results: Vec<BenchmarkResult>,
    /// task id -> refined prompt learned from the critic.
    #[serde(default)]
    pub prompt_strategies: BTreeMap<String, String>,
    #[serde(default)]
    pub last_updated_unix_ms: u64,
}

impl ModelState {
    pub fn new(model_id: impl Into<String>, context_window: u32) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            model_id: model_id.into(),
            context_window,
            results: Vec::new(),
            prompt_strategies: BTreeMap::new(),
            last_updated_unix_ms: 0,
        }
    }

    pub fn record(&mut self, result: BenchmarkResult) {
        self.results.push(result);
        self.touch();
    }

    pub fn learn_prompt(&mut self, task_id: impl Into<String>, prompt: impl Into<String>) {
        self.prompt_strategies.insert(task_id.into(), prompt.into());
        self.touch();
    }

    pub fn strategy_for(&self, task_id: &str) -> Option<&str> {
        self.prompt_strategies.get(task_id).map(String::as_str)
    }

    /// Most recent result recorded for `task_id`.
    pub fn latest_for(&self, task_id: &str) -> Option<&BenchmarkResult> {
        self.results.iter().rev().find(|r| r.task_id == task_id)
    }

    fn touch(&mut self) {
        self.last_updated_unix_ms = unix_now_ms();
    }
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
