use crate::error::StoreError;
use crate::state::{ModelState, STATE_SCHEMA_VERSION};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

/// Durable home of every [`ModelState`]. `save` replaces the whole state of
/// one model atomically.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Option<ModelState>, StoreError>;
    async fn save(&self, state: &ModelState) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per model under a directory.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(model_id)))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self, model_id: &str) -> Result<Option<ModelState>, StoreError> {
        let path = self.path_for(model_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: ModelState = serde_json::from_slice(&bytes)?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                model_id: model_id.to_string(),
                found: state.schema_version,
            });
        }
        Ok(Some(state))
    }

    async fn save(&self, state: &ModelState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&state.model_id);
        let bytes = serde_json::to_vec_pretty(state)?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("persisted state for {} ({} results)", state.model_id, state.results.len());
        Ok(())
    }
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, ModelState>>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_id: &str) -> Option<ModelState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .cloned()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, model_id: &str) -> Result<Option<ModelState>, StoreError> {
        Ok(self.get(model_id))
    }

    async fn save(&self, state: &ModelState) -> Result<(), StoreError> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.model_id.clone(), state.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

/// Filesystem-safe stem. Ids that needed escaping get a hash suffix so that
/// `org/model` and `org_model` never share a file.
fn file_stem_for(model_id: &str) -> String {
    let sanitized: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    if sanitized == model_id && !sanitized.is_empty() {
        return sanitized.to_string();
    }
    format!("{sanitized}-{:016x}", fnv1a64(model_id.as_bytes()))
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
