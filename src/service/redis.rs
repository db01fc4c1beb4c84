use bb8::Pool;
use bb8_redis::{RedisConnectionManager, redis};
use cyder_tools::log::{error, info};
use std::time::Duration;

use crate::config::RedisConfig;

pub type RedisPool = Pool<RedisConnectionManager>;

/// Builds and pings a pool. Any failure is logged and yields `None` so the caller can
/// fall back to the in-memory cache.
pub async fn connect(redis_config: &RedisConfig) -> Option<RedisPool> {
    let manager = match RedisConnectionManager::new(redis_config.url.as_str()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create redis manager: {}", e);
            return None;
        }
    };
    let pool = match Pool::builder()
        .max_size(redis_config.pool_size as u32)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create redis pool: {}", e);
            return None;
        }
    };

    {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to get redis connection from pool for test: {}", e);
                return None;
            }
        };
        if let Err(e) = redis::cmd("PING").query_async::<()>(&mut *conn).await {
            error!("Failed to ping redis: {}", e);
            return None;
        }
    }
    info!("Redis connection pool initialized and tested successfully");
    Some(pool)
}

/// A pool that has not dialed its server yet.
#[cfg(test)]
pub fn lazy_pool(url: &str, connection_timeout: Duration) -> Result<RedisPool, redis::RedisError> {
    let manager = RedisConnectionManager::new(url)?;
    Ok(Pool::builder()
        .max_size(1)
        .connection_timeout(connection_timeout)
        .build_unchecked(manager))
}
