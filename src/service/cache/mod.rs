use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use self::memory::MemoryCacheBackend;
use self::metrics::CacheMetrics;
use self::redis::RedisCacheBackend;
use self::repository::CacheRepository;
use self::types::CacheEntry;
use crate::service::redis::RedisPool;

pub mod memory;
pub mod metrics;
pub mod redis;
pub mod repository;
pub mod types;

/// Failures of the volatile cache layer. Callers treat every variant as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::DeserializationError(e.to_string())
    }
}

/// Basic KV operations a cache store must offer. Single-key operations are atomic.
#[async_trait]
pub trait CacheBackend<T>: Send + Sync + Clone + 'static
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error>;
    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error>;
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;
    /// Drops every entry owned by this backend (its key prefix for shared stores).
    async fn clear(&self) -> Result<(), Self::Error>;
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Arc<CacheEntry<T>>>>, Self::Error>;

    fn metrics(&self) -> &CacheMetrics;
}

/// The store selected at startup. Each repository built from it gets its own namespace.
#[derive(Clone)]
pub enum CacheStore {
    Memory,
    Redis { pool: RedisPool, key_prefix: String },
}

impl CacheStore {
    pub fn repo<T>(&self, namespace: &str, default_ttl: Option<Duration>) -> AnyCacheRepo<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    {
        match self {
            CacheStore::Memory => {
                AnyCacheRepo::Memory(CacheRepository::new(MemoryCacheBackend::new(), default_ttl))
            }
            CacheStore::Redis { pool, key_prefix } => AnyCacheRepo::Redis(CacheRepository::new(
                RedisCacheBackend::new(pool.clone(), format!("{}{}", key_prefix, namespace)),
                default_ttl,
            )),
        }
    }
}

/// A cache repository over whichever backend the deployment selected.
#[derive(Clone)]
pub enum AnyCacheRepo<T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static> {
    Memory(CacheRepository<T, MemoryCacheBackend<T>>),
    Redis(CacheRepository<T, RedisCacheBackend<T>>),
}

impl<T> AnyCacheRepo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    pub async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.get_entry(key).await,
            AnyCacheRepo::Redis(repo) => repo.get_entry(key).await,
        }
    }

    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Arc<T>>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.mget(keys).await,
            AnyCacheRepo::Redis(repo) => repo.mget(keys).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Arc<T>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.get(key).await,
            AnyCacheRepo::Redis(repo) => repo.get(key).await,
        }
    }

    pub async fn set_positive(&self, key: &str, value: &T) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_positive(key, value).await,
            AnyCacheRepo::Redis(repo) => repo.set_positive(key, value).await,
        }
    }

    pub async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_negative(key, ttl).await,
            AnyCacheRepo::Redis(repo) => repo.set_negative(key, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.delete(key).await,
            AnyCacheRepo::Redis(repo) => repo.delete(key).await,
        }
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.clear().await,
            AnyCacheRepo::Redis(repo) => repo.clear().await,
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        match self {
            AnyCacheRepo::Memory(repo) => repo.metrics(),
            AnyCacheRepo::Redis(repo) => repo.metrics(),
        }
    }
}
