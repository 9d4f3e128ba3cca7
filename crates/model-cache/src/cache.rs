use crate::{CacheError, Result};
use broker_provider::{ModelDescriptor, ModelProvider, ProviderError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// One cached descriptor. Replaced wholesale on refresh, never patched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub model_id: String,
    pub descriptor: Arc<ModelDescriptor>,
    pub fetched_at: Instant,
}

impl CacheEntry {
    fn is_stale(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) > ttl
    }
}

/// A lookup result. `stale` is set when a refresh was needed but failed and
/// the previous snapshot is served instead.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDescriptor {
    pub descriptor: Arc<ModelDescriptor>,
    pub stale: bool,
}

#[derive(Debug, Default)]
struct RefreshStatus {
    last_success: Option<Instant>,
    last_error: Option<ProviderError>,
}

/// Model id → descriptor map backed by provider discovery.
///
/// Reads take a short shared lock and never wait on network I/O. Refreshes
/// are serialized by `refresh_gate`; the entry map is only write-locked for
/// the final swap.
pub struct ModelContextCache {
    provider: Arc<dyn ModelProvider>,
    ttl: Duration,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    status: RwLock<RefreshStatus>,
    refresh_gate: Mutex<()>,
    // Bumped after every refresh attempt, successful or not.
    generation: AtomicU64,
}

impl ModelContextCache {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self::with_ttl(provider, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(provider: Arc<dyn ModelProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            entries: RwLock::new(HashMap::new()),
            status: RwLock::new(RefreshStatus::default()),
            refresh_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current descriptors ordered by id. Never touches the network.
    pub fn snapshot(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut out: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Look up `model_id`, refreshing at most once if the entry is missing
    /// or expired.
    pub async fn get(&self, model_id: &str) -> Result<CachedDescriptor> {
        let now = Instant::now();
        let existing = self.peek(model_id);
        match &existing {
            Some(entry) if !entry.is_stale(self.ttl, now) => {
                return Ok(fresh(entry));
            }
            None if self.recently_refreshed(now) => {
                return Err(CacheError::UnknownModel(model_id.to_string()));
            }
            _ => {}
        }

        let seen_generation = self.generation.load(Ordering::SeqCst);
        let _gate = match self.refresh_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                return match &existing {
                    Some(entry) => {
                        log::debug!("Refresh in flight; serving stale entry for {model_id}");
                        Ok(stale(entry))
                    }
                    None => {
                        log::debug!("Refresh in flight; {model_id} not cached yet");
                        Err(CacheError::UnknownModel(model_id.to_string()))
                    }
                };
            }
        };

        // Someone else refreshed since we looked; their attempt counts as ours.
        if self.generation.load(Ordering::SeqCst) == seen_generation {
            if let Err(err) = self.refresh_locked().await {
                log::debug!("Refresh for {model_id} failed: {err}");
            }
        }

        self.resolve_after_refresh(model_id)
    }

    /// Re-populate every entry from one discovery call, bypassing the TTL.
    /// Returns the number of cached models.
    pub async fn refresh_all(&self) -> Result<usize> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<usize> {
        let outcome = self.provider.discover().await;
        let result = match outcome {
            Ok(models) => {
                let fetched_at = Instant::now();
                let fresh: HashMap<String, Arc<CacheEntry>> = models
                    .into_iter()
                    .map(|descriptor| {
                        let entry = CacheEntry {
                            model_id: descriptor.id.clone(),
                            descriptor: Arc::new(descriptor),
                            fetched_at,
                        };
                        (entry.model_id.clone(), Arc::new(entry))
                    })
                    .collect();
                let count = fresh.len();
                *self.entries.write().unwrap_or_else(PoisonError::into_inner) = fresh;
                let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
                status.last_success = Some(fetched_at);
                status.last_error = None;
                log::info!("Updated model context cache with {count} models");
                Ok(count)
            }
            Err(err) => {
                log::warn!("Error updating model context cache: {err}");
                self.status.write().unwrap_or_else(PoisonError::into_inner).last_error = Some(err.clone());
                Err(CacheError::ProviderUnavailable(err))
            }
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    fn peek(&self, model_id: &str) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .cloned()
    }

    fn recently_refreshed(&self, now: Instant) -> bool {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_success
            .is_some_and(|at| now.saturating_duration_since(at) <= self.ttl)
    }

    fn resolve_after_refresh(&self, model_id: &str) -> Result<CachedDescriptor> {
        let now = Instant::now();
        if let Some(entry) = self.peek(model_id) {
            return Ok(if entry.is_stale(self.ttl, now) {
                stale(&entry)
            } else {
                fresh(&entry)
            });
        }

        let last_error = self.status.read().unwrap_or_else(PoisonError::into_inner).last_error.clone();
        match last_error {
            Some(err) => Err(CacheError::ProviderUnavailable(err)),
            None => Err(CacheError::UnknownModel(model_id.to_string())),
        }
    }
}

fn fresh(entry: &CacheEntry) -> CachedDescriptor {
    CachedDescriptor {
        descriptor: entry.descriptor.clone(),
        stale: false,
    }
}

fn stale(entry: &CacheEntry) -> CachedDescriptor {
    CachedDescriptor {
        descriptor: entry.descriptor.clone(),
        stale: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_provider::{
        Completion, CompletionRequest, ProviderKind, ScriptedProvider,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn model(id: &str, context_window: u32) -> ModelDescriptor {
        ModelDescriptor::new(id, context_window, ProviderKind::LmStudio, None)
    }

    fn cache_with(models: Vec<ModelDescriptor>) -> (Arc<ScriptedProvider>, ModelContextCache) {
        let provider = Arc::new(ScriptedProvider::new(models));
        let cache = ModelContextCache::new(provider.clone());
        (provider, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn get_within_ttl_after_refresh_does_not_hit_network() {
        let (provider, cache) = cache_with(vec![model("a", 8192)]);
        assert_eq!(cache.refresh_all().await.unwrap(), 1);
        assert_eq!(provider.discover_calls(), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        let hit = cache.get("a").await.unwrap();
        assert!(!hit.stale);
        assert_eq!(hit.descriptor.context_window, 8192);
        assert_eq!(provider.discover_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_after_expiry_refreshes_exactly_once() {
        let (provider, cache) = cache_with(vec![model("a", 8192)]);
        cache.refresh_all().await.unwrap();

        provider.set_models(vec![model("a", 16384)]);
        tokio::time::advance(Duration::from_secs(301)).await;

        let hit = cache.get("a").await.unwrap();
        assert_eq!(provider.discover_calls(), 2);
        assert!(!hit.stale);
        assert_eq!(hit.descriptor.context_window, 16384);

        cache.get("a").await.unwrap();
        assert_eq!(provider.discover_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_serves_stale_entry() {
        let (provider, cache) = cache_with(vec![model("a", 4096)]);
        cache.refresh_all().await.unwrap();

        provider.fail_discovery(ProviderError::unavailable("connection refused"));
        tokio::time::advance(Duration::from_secs(600)).await;

        let hit = cache.get("a").await.unwrap();
        assert!(hit.stale);
        assert_eq!(hit.descriptor.context_window, 4096);
        assert_eq!(provider.discover_calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_without_entry_is_unavailable() {
        let (provider, cache) = cache_with(Vec::new());
        provider.fail_discovery(ProviderError::unavailable("connection refused"));

        let err = cache.get("a").await.unwrap_err();
        assert!(matches!(err, CacheError::ProviderUnavailable(_)), "{err:?}");
        assert_eq!(provider.discover_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_model_within_ttl_is_answered_from_memory() {
        let (provider, cache) = cache_with(vec![model("a", 4096)]);
        let err = cache.get("missing").await.unwrap_err();
        assert_eq!(err, CacheError::UnknownModel("missing".into()));
        assert_eq!(provider.discover_calls(), 1);

        cache.get("missing").await.unwrap_err();
        assert_eq!(provider.discover_calls(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.get("missing").await.unwrap_err();
        assert_eq!(provider.discover_calls(), 2);
    }

    #[tokio::test]
    async fn refresh_evicts_models_no_longer_listed() {
        let (provider, cache) = cache_with(vec![model("a", 4096), model("b", 4096)]);
        cache.refresh_all().await.unwrap();
        assert_eq!(cache.len(), 2);

        provider.set_models(vec![model("b", 4096)]);
        cache.refresh_all().await.unwrap();
        let ids: Vec<String> = cache.snapshot().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn repeated_refresh_yields_identical_descriptors() {
        let (_provider, cache) =
            cache_with(vec![model("qwen2.5-7b", 32768), model("phi-3-mini", 4096)]);
        cache.refresh_all().await.unwrap();
        let first = serde_json::to_vec(&cache.snapshot()).unwrap();
        cache.refresh_all().await.unwrap();
        let second = serde_json::to_vec(&cache.snapshot()).unwrap();
        assert_eq!(first, second);
    }

    /// Discovery that blocks until released, after a first instant answer.
    struct GatedProvider {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl ModelProvider for GatedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::LmStudio
        }

        async fn discover(&self) -> broker_provider::Result<Vec<ModelDescriptor>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                self.release.notified().await;
            }
            Ok(vec![model("a", 2048)])
        }

        async fn complete(&self, _request: &CompletionRequest) -> broker_provider::Result<Completion> {
            Err(ProviderError::unavailable("not used"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_readers_do_not_wait_for_inflight_refresh() {
        let provider = Arc::new(GatedProvider {
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let cache = Arc::new(ModelContextCache::new(provider.clone()));
        cache.refresh_all().await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        let refresher = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh_all().await })
        };
        while provider.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let hit = cache.get("a").await.unwrap();
        assert!(hit.stale);

        provider.release.notify_one();
        refresher.await.unwrap().unwrap();
        assert!(!cache.get("a").await.unwrap().stale);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_models_do_not_wait_for_inflight_refresh() {
        let provider = Arc::new(GatedProvider {
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let cache = Arc::new(ModelContextCache::new(provider.clone()));
        cache.refresh_all().await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        let refresher = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh_all().await })
        };
        while provider.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let miss = tokio::time::timeout(Duration::from_secs(1), cache.get("never-listed"))
            .await
            .expect("get waited on the in-flight refresh");
        assert!(matches!(miss, Err(CacheError::UnknownModel(id)) if id == "never-listed"));

        provider.release.notify_one();
        refresher.await.unwrap().unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
