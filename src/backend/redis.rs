//! Redis store for [`RemoteDriver`](super::RemoteDriver).
//!
//! Registry updates are `WATCH`/`GET`/`MULTI SET EXEC` on one pooled
//! connection; an aborted `EXEC` is a lost race. Keys are enumerated with
//! `SCAN MATCH prefix.*` and a wildcard clear is `FLUSHDB`.

use super::remote::{RegistryUpdate, RemoteStore};
use crate::config::{pool_size, Options};
use crate::error::{Error, Result};
use deadpool_redis::redis;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use std::time::Duration;

/// Default Redis connection pool size.
const DEFAULT_POOL_SIZE: u32 = 16;

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 500;

/// Configuration for [`RedisStore`].
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://localhost:6379/0`.
    pub url: String,
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl RedisConfig {
    /// First entry of `Servers` as the URL; pool size from
    /// `TAGKV_POOL_SIZE`, then `PoolSize`.
    pub fn from_options(options: &Options) -> Self {
        let defaults = RedisConfig::default();
        let url = match options.servers.as_ref().and_then(|s| s.first()) {
            Some(server) if server.contains("://") => server.clone(),
            Some(server) => format!("redis://{}", server),
            None => defaults.url,
        };
        RedisConfig {
            url,
            pool_size: pool_size(options, DEFAULT_POOL_SIZE),
            ..defaults
        }
    }
}

/// Redis-backed [`RemoteStore`] over a deadpool connection pool.
///
/// # Example
///
/// ```no_run
/// # use tagkv::backend::{Driver, RedisConfig, RedisStore, RemoteConfig, RemoteDriver};
/// # async fn example() -> tagkv::Result<()> {
/// let store = RedisStore::new(RedisConfig::default())?;
/// let driver = RemoteDriver::connect(store, RemoteConfig::default().with_prefix("app")).await?;
/// driver.write("greeting", serde_json::json!("hello"), &["home"]).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// # Errors
    /// `Error::ConfigError` if the pool cannot be created from the URL.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let mut pool_config = PoolConfig::new(config.pool_size as usize);
        pool_config.timeouts.wait = Some(config.connection_timeout);
        pool_config.timeouts.create = Some(config.connection_timeout);

        let mut cfg = deadpool_redis::Config::from_url(config.url.clone());
        cfg.pool = Some(pool_config);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Redis store initialized at {} (pool size: {})",
            config.url, config.pool_size
        );
        Ok(RedisStore { pool })
    }

    pub fn from_options(options: &Options) -> Result<Self> {
        Self::new(RedisConfig::from_options(options))
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

fn redis_error(op: &str, key: &str, e: redis::RedisError) -> Error {
    Error::BackendError(format!("Redis {} failed for key {}: {}", op, key, e))
}

impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn enumerable(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("GET", key, e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| redis_error("SET", key, e))?;
        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| redis_error("DEL", key, e))?;
        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn try_update(&self, key: &str, update: &RegistryUpdate<'_>) -> Result<bool> {
        let mut conn = self.conn().await?;
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| redis_error("WATCH", key, e))?;
        let current: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("GET", key, e))?;

        let next = match update(current.as_deref()) {
            Ok(Some(next)) => next,
            other => {
                redis::cmd("UNWATCH")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| redis_error("UNWATCH", key, e))?;
                return other.map(|_| true);
            }
        };

        let committed: Option<redis::Value> = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(next)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("EXEC", key, e))?;
        Ok(committed.is_some())
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;
        warn!("⚠ Redis FLUSHDB executed - all cache cleared!");
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Option<Vec<String>>> {
        let pattern = format!("{}.*", prefix);
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_error("SCAN", &pattern, e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(Some(keys))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| Error::BackendError(format!("Redis PING failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_redis_config_from_servers() {
        let options =
            Options::from_json(r#"{"Servers": ["cache1:6380"], "PoolSize": 4}"#).expect("options");
        let config = RedisConfig::from_options(&options);
        assert_eq!(config.url, "redis://cache1:6380");
        if std::env::var(crate::config::POOL_SIZE_ENV).is_err() {
            assert_eq!(config.pool_size, 4);
        }

        let options = Options::from_json(r#"{"Servers": ["rediss://secure:6379/2"]}"#)
            .expect("options");
        assert_eq!(
            RedisConfig::from_options(&options).url,
            "rediss://secure:6379/2"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_disables_driver() {
        use super::super::{Driver, RemoteConfig, RemoteDriver};

        let store = RedisStore::new(RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(200),
            pool_size: 1,
        })
        .expect("pool");
        let driver = RemoteDriver::connect(store, RemoteConfig::default())
            .await
            .expect("driver");
        assert!(!driver.is_available());
        assert_eq!(driver.read("k").await, None);
    }
}
