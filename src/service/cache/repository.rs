use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheBackend, CacheError, metrics::CacheMetrics, types::CacheEntry};

/// Typed view over a backend with a default TTL. Keys are chosen by the caller.
pub struct CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    backend: B,
    default_ttl: Option<Duration>,
    _phantom: PhantomData<T>,
}

impl<T, B> CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    pub fn new(backend: B, default_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            default_ttl,
            _phantom: PhantomData,
        }
    }

    fn backend_error(&self, e: B::Error) -> CacheError {
        self.backend.metrics().record_error();
        CacheError::Unavailable(e.to_string())
    }

    /// Get the raw cache entry (Positive or Negative)
    pub async fn get_entry(&self, cache_key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        self.backend.get(cache_key).await.map_err(|e| self.backend_error(e))
    }

    /// Returns Ok(None) for Negative entries or cache misses.
    pub async fn get(&self, cache_key: &str) -> Result<Option<Arc<T>>, CacheError> {
        match self.get_entry(cache_key).await? {
            Some(entry) => match &*entry {
                CacheEntry::Positive(value) => Ok(Some(value.clone())),
                CacheEntry::Negative => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub async fn set_positive(&self, cache_key: &str, value: &T) -> Result<(), CacheError> {
        let entry = Arc::new(CacheEntry::Positive(Arc::new(value.clone())));
        self.backend
            .set(cache_key, entry, self.default_ttl)
            .await
            .map_err(|e| self.backend_error(e))
    }

    pub async fn set_negative(&self, cache_key: &str, ttl: Duration) -> Result<(), CacheError> {
        let entry = Arc::new(CacheEntry::Negative);
        self.backend
            .set(cache_key, entry, Some(ttl))
            .await
            .map_err(|e| self.backend_error(e))
    }

    pub async fn delete(&self, cache_key: &str) -> Result<(), CacheError> {
        self.backend.delete(cache_key).await.map_err(|e| self.backend_error(e))
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear().await.map_err(|e| self.backend_error(e))
    }

    /// Batch get. Negative entries come back as `None`, like misses.
    pub async fn mget(&self, cache_keys: &[&str]) -> Result<Vec<Option<Arc<T>>>, CacheError> {
        let entries = self
            .backend
            .mget(cache_keys)
            .await
            .map_err(|e| self.backend_error(e))?;

        Ok(entries
            .into_iter()
            .map(|entry_opt| {
                entry_opt.and_then(|entry| match &*entry {
                    CacheEntry::Positive(value) => Some(value.clone()),
                    CacheEntry::Negative => None,
                })
            })
            .collect())
    }

    pub fn metrics(&self) -> &CacheMetrics {
        self.backend.metrics()
    }
}

impl<T, B> Clone for CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            default_ttl: self.default_ttl,
            _phantom: PhantomData,
        }
    }
}
