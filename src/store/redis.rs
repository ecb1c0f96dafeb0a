//! Redis counter store for distributed throttling.
//!
//! Uses connection pooling; the increment path is a single Lua script so
//! that `INCR` and `EXPIRE` commit atomically.

use std::time::Duration;

use deadpool_redis::{Config, Connection, Pool, Runtime, redis::cmd};

use crate::error::{Result, StoreError};
use crate::store::CounterStore;

/// Atomic increment with TTL refresh.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return count
"#;

/// Decrement that never goes below zero.
const DECREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
  return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Key prefix for counter keys
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "gl:".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

/// Redis counter store.
///
/// TTL authority is server-side: the caller-supplied `now` is ignored and
/// Redis expires counters itself.
///
/// # Example
///
/// ```ignore
/// use gatelimit::store::{RedisConfig, RedisCounterStore};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:gl:")
///     .with_pool_size(20);
///
/// let store = RedisCounterStore::new(config).await?;
/// ```
pub struct RedisCounterStore {
    pool: Pool,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a new Redis store from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::unavailable(e.to_string(), false))?;

        // Test connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::unavailable(e.to_string(), true))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string(), true))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
        })
    }

    /// Create a new Redis store from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| StoreError::PoolExhausted.into())
    }
}

impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration, _now: u64) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        let ttl_secs = ttl.as_secs().max(1);

        let count: i64 = cmd("EVAL")
            .arg(INCREMENT_SCRIPT)
            .arg(1)
            .arg(&full_key)
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string(), true))?;

        Ok(count.max(0) as u64)
    }

    async fn get(&self, key: &str, _now: u64) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);

        let count: Option<i64> = cmd("GET")
            .arg(&full_key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string(), true))?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);

        let _: i64 = cmd("EVAL")
            .arg(DECREMENT_SCRIPT)
            .arg(1)
            .arg(&full_key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string(), true))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::new("redis://localhost:6380")
            .with_prefix("test:")
            .with_pool_size(5);

        assert_eq!(config.url, "redis://localhost:6380");
        assert_eq!(config.key_prefix, "test:");
        assert_eq!(config.pool_size, 5);
    }
}
