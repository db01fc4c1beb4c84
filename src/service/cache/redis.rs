use async_trait::async_trait;
use bb8_redis::bb8;
use bb8_redis::redis::{self, AsyncCommands, RedisError, cmd};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::service::redis::RedisPool;

use super::{CacheBackend, CacheError, metrics::CacheMetrics, types::CacheEntry};

#[derive(Debug, Error)]
pub enum RedisCacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Codec error: {0}")]
    Codec(#[from] CacheError),
    #[error("Pool error: {0}")]
    Pool(#[from] bb8::RunError<RedisError>),
}

fn encode<T>(entry: &CacheEntry<T>) -> Result<Vec<u8>, CacheError>
where
    T: Serialize + DeserializeOwned + Clone,
{
    Ok(bincode::serde::encode_to_vec(entry, bincode::config::standard())?)
}

fn decode<T>(bytes: &[u8]) -> Result<CacheEntry<T>, CacheError>
where
    T: Serialize + DeserializeOwned + Clone,
{
    let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(entry)
}

/// Redis cache backend. All keys live under `key_prefix`, which `clear` scans and removes.
#[derive(Clone)]
pub struct RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pool: RedisPool,
    metrics: CacheMetrics,
    key_prefix: String,
    _phantom: PhantomData<T>,
}

impl<T> RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pub fn new(pool: RedisPool, key_prefix: String) -> Self {
        Self {
            pool,
            metrics: CacheMetrics::new(),
            key_prefix,
            _phantom: PhantomData,
        }
    }

    fn get_full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    type Error = RedisCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let mut conn = self.pool.get().await?;
        let result: Option<Vec<u8>> = conn.get(self.get_full_key(key)).await?;

        match result {
            Some(bytes) => {
                self.metrics.record_hit();
                Ok(Some(Arc::new(decode(&bytes)?)))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let full_key = self.get_full_key(key);
        let bytes = encode(&value)?;

        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(full_key, bytes, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(full_key, bytes).await?;
            }
        }
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.get_full_key(key)).await?;
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{}*", self.key_prefix);

        let mut keys_to_delete: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys_to_delete.extend(keys);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        if !keys_to_delete.is_empty() {
            let mut pipe = redis::pipe();
            for key in &keys_to_delete {
                pipe.del(key);
            }
            let _: () = pipe.query_async(&mut *conn).await?;
            cyder_tools::log::debug!(
                "Cleared {} keys from Redis cache with prefix '{}'",
                keys_to_delete.len(),
                self.key_prefix
            );
        }
        self.metrics.record_delete();
        Ok(())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Arc<CacheEntry<T>>>>, Self::Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let full_keys: Vec<String> = keys.iter().map(|k| self.get_full_key(k)).collect();
        let raw: Vec<Option<Vec<u8>>> = cmd("MGET").arg(&full_keys).query_async(&mut *conn).await?;

        let mut results = Vec::with_capacity(raw.len());
        for bytes in raw {
            match bytes {
                Some(bytes) => {
                    self.metrics.record_hit();
                    results.push(Some(Arc::new(decode(&bytes)?)));
                }
                None => {
                    self.metrics.record_miss();
                    results.push(None);
                }
            }
        }
        Ok(results)
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}
