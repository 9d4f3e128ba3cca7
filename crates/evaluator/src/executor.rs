use crate::task::{Bindings, CallArgs};
use crate::ExecError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// What to do after the snippet has been executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Invocation {
    /// Only run the snippet; inspect the resulting bindings.
    None,
    /// Call the function the snippet defines.
    CallSingleFunction { args: CallArgs },
    /// Instantiate the class the snippet defines and replay method calls.
    ReplayClass { sequence: Vec<String> },
    /// Value of the final expression or last assignment.
    LastValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecRequest {
    pub source: String,
    pub bindings: Bindings,
    pub invoke: Invocation,
}

impl ExecRequest {
    pub fn new(source: impl Into<String>, invoke: Invocation) -> Self {
        Self {
            source: source.into(),
            bindings: Bindings::new(),
            invoke,
        }
    }

    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }
}

/// Result of one bounded execution. `error` carries the snippet's own
/// failure (syntax error, exception); `timed_out` means the run was killed.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ExecOutcome {
    #[serde(default)]
    pub bindings_after: Bindings,
    #[serde(default)]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(skip)]
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        !self.timed_out && self.error.is_none()
    }
}

/// Narrow capability for running untrusted snippets under a wall-clock bound.
///
/// Implementations must return within roughly `timeout` and terminate any
/// work they started. `Err` is reserved for backend faults (interpreter
/// missing, broken protocol).
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: &ExecRequest, timeout: Duration) -> Result<ExecOutcome, ExecError>;
}
