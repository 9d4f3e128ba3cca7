use broker_evaluator::SchemaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state for '{model_id}' has unsupported schema version {found}")]
    UnsupportedVersion { model_id: String, found: u32 },
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid task set: {0}")]
    Schema(#[from] SchemaError),

    #[error("benchmark task panicked: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
