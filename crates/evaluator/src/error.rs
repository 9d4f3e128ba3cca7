use thiserror::Error;

/// Malformed task or test-case definition. Surfaced to the operator at load
/// time; a task set with any of these is rejected as a whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("{source_name}: cannot read task definition: {message}")]
    Io {
        source_name: String,
        message: String,
    },

    #[error("{source_name}: invalid task definition: {message}")]
    Invalid {
        source_name: String,
        message: String,
    },

    #[error("{source_name}: unrecognized evaluation_method '{method}'")]
    UnknownMethod { source_name: String, method: String },

    #[error("{source_name}: test_cases must not be empty")]
    EmptyTestCases { source_name: String },

    #[error("{source_name}: test case {index} does not fit {method}: {message}")]
    InvalidTestCase {
        source_name: String,
        method: String,
        index: usize,
        message: String,
    },

    #[error("duplicate task id '{id}' ({first} and {second})")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },

    #[error("{0}: no task definitions found")]
    EmptyTaskSet(String),
}

/// Internal failure of the execution backend. Always folded into a failing
/// verdict by the engine; never escapes grading.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to start interpreter '{interpreter}': {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("driver protocol error: {0}")]
    Protocol(String),
}
