use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cyder_tools::log::{debug, info, warn};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::controller::BaseError;
use crate::service::cache::metrics::CacheMetricsSnapshot;
use crate::service::cache::types::{CacheEntry, CachedModel};
use crate::service::cache::{AnyCacheRepo, CacheError, CacheStore};
use crate::service::catalog::DiscoveredModel;
use crate::service::chat_client::ChatClient;

const AGGREGATE_NAMESPACE: &str = "v1:models:";
const AGGREGATE_KEY: &str = "list";
const BACKEND_NAMESPACE: &str = "v1:registry:endpoint_models:";
const INDEX_NAMESPACE: &str = "v1:registry:endpoints:";
const INDEX_KEY: &str = "all";
const REVERSE_NAMESPACE: &str = "v1:registry:model_endpoints:";
const REVERSE_KEY: &str = "all";

pub type ModelToBackends = HashMap<String, Vec<String>>;

#[derive(Debug, Clone)]
pub struct ModelCacheSettings {
    pub ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for ModelCacheSettings {
    fn default() -> Self {
        ModelCacheSettings {
            ttl: Duration::from_secs(600),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

/// Derived views of "which models live on which backend".
///
/// Nothing here is a system of record: every entry can be dropped and rebuilt from
/// backend discovery. Cache failures are logged and read as misses.
#[derive(Clone)]
pub struct ModelCache {
    aggregate: AnyCacheRepo<Vec<CachedModel>>,
    backend_sets: AnyCacheRepo<Vec<String>>,
    backend_index: AnyCacheRepo<Vec<String>>,
    reverse: AnyCacheRepo<ModelToBackends>,
    platform: Option<ChatClient>,
    negative_ttl: Duration,
}

fn backend_key(backend: &str) -> String {
    URL_SAFE_NO_PAD.encode(backend.as_bytes())
}

fn same_id_set(cached: &[String], fresh: &[String]) -> bool {
    let cached: HashSet<&str> = cached.iter().map(String::as_str).collect();
    let fresh: HashSet<&str> = fresh.iter().map(String::as_str).collect();
    cached == fresh
}

pub fn cached_models(discovered: &[DiscoveredModel]) -> Vec<CachedModel> {
    discovered
        .iter()
        .map(|m| CachedModel::new(&m.id, m.created.unwrap_or(0), m.owned_by.as_deref().unwrap_or("")))
        .collect()
}

async fn read_entry<T>(repo: &AnyCacheRepo<T>, key: &str) -> Option<Arc<CacheEntry<T>>>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    match repo.get_entry(key).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!("model cache read of '{}' failed, treating as miss: {}", key, e);
            None
        }
    }
}

async fn read_positive<T>(repo: &AnyCacheRepo<T>, key: &str) -> Option<Arc<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    match repo.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!("model cache read of '{}' failed, treating as miss: {}", key, e);
            None
        }
    }
}

fn absorb(result: Result<(), CacheError>, action: &str) {
    if let Err(e) = result {
        warn!("model cache {} failed: {}", action, e);
    }
}

impl ModelCache {
    /// `platform` is the built-in backend that cold reads are rebuilt from.
    pub fn new(store: &CacheStore, settings: &ModelCacheSettings, platform: Option<ChatClient>) -> Self {
        let ttl = Some(settings.ttl);
        ModelCache {
            aggregate: store.repo(AGGREGATE_NAMESPACE, ttl),
            backend_sets: store.repo(BACKEND_NAMESPACE, ttl),
            backend_index: store.repo(INDEX_NAMESPACE, ttl),
            reverse: store.repo(REVERSE_NAMESPACE, ttl),
            platform,
            negative_ttl: settings.negative_ttl,
        }
    }

    pub fn platform_backend(&self) -> Option<&str> {
        self.platform.as_ref().map(ChatClient::base_url)
    }

    /// Aggregate model list. A cold read rebuilds it from the platform backend.
    pub async fn list_models(&self) -> Vec<CachedModel> {
        match read_entry(&self.aggregate, AGGREGATE_KEY).await.as_deref() {
            Some(CacheEntry::Positive(models)) => {
                debug!("model list served from cache ({} models)", models.len());
                return models.as_ref().clone();
            }
            Some(CacheEntry::Negative) => {
                debug!("model list is negatively cached");
                return Vec::new();
            }
            None => {}
        }
        self.rebuild_from_platform().await
    }

    /// Replaces the cached view with `models` served by `backend`.
    ///
    /// An unchanged id set is a no-op. Otherwise every derived entry is dropped and
    /// rewritten from this backend's set.
    pub async fn set_models(&self, backend: &str, models: &[CachedModel]) -> Result<(), BaseError> {
        let backend = backend.trim();
        if backend.is_empty() {
            return Err(BaseError::ParamInvalid(Some("backend id cannot be empty".to_string())));
        }
        let key = backend_key(backend);
        let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();

        if let Some(cached) = read_positive(&self.backend_sets, &key).await {
            if same_id_set(&cached, &ids) {
                debug!("model set of {} unchanged, skipping cache update", backend);
                return Ok(());
            }
        }

        absorb(self.reverse.delete(REVERSE_KEY).await, "reverse map delete");
        absorb(self.aggregate.delete(AGGREGATE_KEY).await, "model list delete");
        absorb(self.backend_sets.clear().await, "backend sets clear");

        absorb(self.backend_sets.set_positive(&key, &ids).await, "backend set write");
        absorb(
            self.backend_index.set_positive(INDEX_KEY, &vec![backend.to_string()]).await,
            "backend index write",
        );
        absorb(self.aggregate.set_positive(AGGREGATE_KEY, &models.to_vec()).await, "model list write");
        self.rebuild_reverse_map().await;
        info!("model cache updated for {} ({} models)", backend, ids.len());
        Ok(())
    }

    /// Drops `backend` from every derived view. Absent backends are a no-op.
    pub async fn remove_backend_models(&self, backend: &str) -> Result<(), BaseError> {
        let backend = backend.trim();
        if backend.is_empty() {
            return Err(BaseError::ParamInvalid(Some("backend id cannot be empty".to_string())));
        }
        let key = backend_key(backend);
        let Some(removed) = read_positive(&self.backend_sets, &key).await else {
            return Ok(());
        };
        let removed: HashSet<&str> = removed.iter().map(String::as_str).collect();

        absorb(self.backend_sets.delete(&key).await, "backend set delete");
        if let Some(index) = read_positive(&self.backend_index, INDEX_KEY).await {
            let remaining: Vec<String> = index.iter().filter(|b| b.as_str() != backend).cloned().collect();
            absorb(self.backend_index.set_positive(INDEX_KEY, &remaining).await, "backend index write");
        }
        if let Some(existing) = read_positive(&self.aggregate, AGGREGATE_KEY).await {
            let filtered: Vec<CachedModel> = existing
                .iter()
                .filter(|m| !removed.contains(m.id.as_str()))
                .cloned()
                .collect();
            absorb(self.aggregate.set_positive(AGGREGATE_KEY, &filtered).await, "model list write");
        }
        self.rebuild_reverse_map().await;
        info!("removed {} cached models of {}", removed.len(), backend);
        Ok(())
    }

    /// Model id to the backends whose cached set contains it.
    pub async fn get_model_to_backends(&self) -> ModelToBackends {
        if let Some(map) = read_positive(&self.reverse, REVERSE_KEY).await {
            return map.as_ref().clone();
        }
        if matches!(
            read_entry(&self.aggregate, AGGREGATE_KEY).await.as_deref(),
            Some(CacheEntry::Negative)
        ) {
            return ModelToBackends::new();
        }
        self.rebuild_from_platform().await;
        read_positive(&self.reverse, REVERSE_KEY)
            .await
            .map(|map| map.as_ref().clone())
            .unwrap_or_default()
    }

    /// Cached ids for one backend, if any are known.
    #[cfg(test)]
    pub async fn backend_models(&self, backend: &str) -> Option<Vec<String>> {
        read_positive(&self.backend_sets, &backend_key(backend.trim()))
            .await
            .map(|ids| ids.as_ref().clone())
            .filter(|ids| !ids.is_empty())
    }

    /// One refresh pass against the platform backend.
    pub async fn check_platform_models(&self) {
        let Some(client) = &self.platform else {
            return;
        };
        let discovered = client
            .list_models()
            .await
            .and_then(|raw| DiscoveredModel::decode_batch(&raw));
        let outcome = match discovered {
            Ok(discovered) => self.set_models(client.base_url(), &cached_models(&discovered)).await,
            Err(e) => {
                warn!("platform model discovery failed, dropping its cached models: {}", e);
                self.remove_backend_models(client.base_url()).await
            }
        };
        if let Err(e) = outcome {
            warn!("platform model refresh failed: {}", e);
        }
    }

    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.aggregate
            .metrics()
            .snapshot()
            .merge(&self.backend_sets.metrics().snapshot())
            .merge(&self.backend_index.metrics().snapshot())
            .merge(&self.reverse.metrics().snapshot())
    }

    async fn rebuild_from_platform(&self) -> Vec<CachedModel> {
        let Some(client) = &self.platform else {
            self.rebuild_reverse_map().await;
            return Vec::new();
        };
        let backend = client.base_url();
        let discovered = client
            .list_models()
            .await
            .and_then(|raw| DiscoveredModel::decode_batch(&raw));
        let models = match discovered {
            Ok(discovered) => cached_models(&discovered),
            Err(e) => {
                warn!("model discovery on {} failed: {}", backend, e);
                absorb(
                    self.aggregate.set_negative(AGGREGATE_KEY, self.negative_ttl).await,
                    "negative model list write",
                );
                return Vec::new();
            }
        };
        let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
        absorb(self.aggregate.set_positive(AGGREGATE_KEY, &models).await, "model list write");
        absorb(self.backend_sets.set_positive(&backend_key(backend), &ids).await, "backend set write");
        self.add_to_index(backend).await;
        self.rebuild_reverse_map().await;
        debug!("model list rebuilt from {} ({} models)", backend, models.len());
        models
    }

    async fn add_to_index(&self, backend: &str) {
        let mut index = read_positive(&self.backend_index, INDEX_KEY)
            .await
            .map(|index| index.as_ref().clone())
            .unwrap_or_default();
        if !index.iter().any(|b| b == backend) {
            index.push(backend.to_string());
            absorb(self.backend_index.set_positive(INDEX_KEY, &index).await, "backend index write");
        }
    }

    /// Rebuilds the reverse map from every indexed backend set. Index entries whose set
    /// has expired are pruned.
    async fn rebuild_reverse_map(&self) {
        let backends = read_positive(&self.backend_index, INDEX_KEY)
            .await
            .map(|index| index.as_ref().clone())
            .unwrap_or_default();
        let keys: Vec<String> = backends.iter().map(|b| backend_key(b)).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

        let sets = match self.backend_sets.mget(&key_refs).await {
            Ok(sets) => sets,
            Err(e) => {
                warn!("failed to read backend sets, dropping reverse map: {}", e);
                absorb(self.reverse.delete(REVERSE_KEY).await, "reverse map delete");
                return;
            }
        };

        let mut map = ModelToBackends::new();
        let mut live = Vec::with_capacity(backends.len());
        for (backend, ids) in backends.iter().zip(sets) {
            let Some(ids) = ids else { continue };
            live.push(backend.clone());
            for id in ids.iter() {
                let served_by = map.entry(id.clone()).or_default();
                if !served_by.contains(backend) {
                    served_by.push(backend.clone());
                }
            }
        }
        absorb(self.reverse.set_positive(REVERSE_KEY, &map).await, "reverse map write");
        if live.len() != backends.len() {
            absorb(self.backend_index.set_positive(INDEX_KEY, &live).await, "backend index write");
        }
    }
}
