use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{CacheBackend, metrics::CacheMetrics, types::CacheEntry};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[error("Memory cache error: {0}")]
pub struct MemoryCacheError(String);

/// Process-local cache. Each instance owns its own map, so `clear` only affects it.
#[derive(Clone)]
pub struct MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    data: Arc<DashMap<String, (Arc<CacheEntry<T>>, Option<Instant>)>>, // value + expiration
    metrics: CacheMetrics,
}

impl<T> MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        let backend = Self {
            data: Arc::new(DashMap::new()),
            metrics: CacheMetrics::new(),
        };
        backend.spawn_sweeper();
        backend
    }

    /// Expired entries are dropped lazily on read; the sweeper reclaims the rest.
    /// It holds only a weak handle so it ends once every clone of the backend is gone.
    fn spawn_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let data = Arc::downgrade(&self.data);
        handle.spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(data) = data.upgrade() else { break };
                let now = Instant::now();
                let before = data.len();
                data.retain(|_, (_, expiration)| expiration.is_none_or(|exp| now < exp));
                let removed = before.saturating_sub(data.len());
                if removed > 0 {
                    cyder_tools::log::debug!("Cleaned up {} expired cache entries", removed);
                }
            }
        });
    }

    fn is_expired(expiration: Option<Instant>) -> bool {
        expiration.is_some_and(|exp| Instant::now() >= exp)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error = MemoryCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        if let Some(entry) = self.data.get(key) {
            let (value, expiration) = entry.value();

            if Self::is_expired(*expiration) {
                drop(entry);
                self.data.remove(key);
                self.metrics.record_miss();
                return Ok(None);
            }

            self.metrics.record_hit();
            Ok(Some(value.clone()))
        } else {
            self.metrics.record_miss();
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let expiration = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), (value, expiration));
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.data.remove(key);
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.data.clear();
        self.metrics.record_delete();
        Ok(())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Arc<CacheEntry<T>>>>, Self::Error> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

impl<T> Default for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
