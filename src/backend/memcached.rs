//! Memcached store for [`RemoteDriver`](super::RemoteDriver).
//!
//! Plain reads and writes go through a deadpool-memcached pool. The pooled
//! client has no `gets`/`cas`, so registry updates speak the ASCII protocol
//! directly over a short-lived connection:
//!
//! ```text
//! gets <key>                       -> VALUE <key> <flags> <bytes> <cas> | END
//! cas <key> 0 0 <bytes> <cas>      -> STORED | EXISTS | NOT_FOUND
//! add <key> 0 0 <bytes>            -> STORED | NOT_STORED
//! ```
//!
//! Each registry round, connect included, is bounded by the configured
//! connection timeout.
//!
//! Memcached cannot list its keys, so `read_all` is always empty and an
//! overwriting write or wildcard clear issues `flush_all`.

use super::remote::{RegistryUpdate, RemoteStore};
use crate::config::{pool_size, Options};
use crate::error::{Error, Result};
use async_memcached::AsciiProtocol;
use deadpool_memcached::{Manager, Pool};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Default Memcached connection pool size.
/// Override with the `TAGKV_POOL_SIZE` environment variable.
const DEFAULT_POOL_SIZE: u32 = 10;

const HEALTH_KEY: &str = "__health_check__";

/// Configuration for [`MemcachedStore`].
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>, // e.g., ["localhost:11211", "cache2:11211"]
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            servers: vec!["localhost:11211".to_string()],
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl MemcachedConfig {
    /// `Servers`, with pool size from `TAGKV_POOL_SIZE`, then `PoolSize`.
    pub fn from_options(options: &Options) -> Self {
        let defaults = MemcachedConfig::default();
        MemcachedConfig {
            servers: options.servers.clone().unwrap_or(defaults.servers),
            pool_size: pool_size(options, DEFAULT_POOL_SIZE),
            ..defaults
        }
    }
}

/// Memcached-backed [`RemoteStore`].
///
/// # Example
///
/// ```no_run
/// # use tagkv::backend::{Driver, MemcachedConfig, MemcachedStore, RemoteConfig, RemoteDriver};
/// # async fn example() -> tagkv::Result<()> {
/// let store = MemcachedStore::new(MemcachedConfig::default())?;
/// let driver = RemoteDriver::connect(store, RemoteConfig::default()).await?;
/// driver.write("greeting", serde_json::json!("hello"), &[]).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedStore {
    pool: Pool,
    addr: String,
    timeout: Duration,
}

impl MemcachedStore {
    /// Create the store from configuration.
    ///
    /// # Errors
    /// Returns `Err` if no server is given or pool creation fails
    pub fn new(config: MemcachedConfig) -> Result<Self> {
        // deadpool-memcached Manager takes a single server address
        let addr = config
            .servers
            .first()
            .ok_or_else(|| Error::ConfigError("No memcached servers specified".to_string()))?
            .clone();

        let pool = Pool::builder(Manager::new(addr.clone()))
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Memcached store initialized with server: {} (pool size: {})",
            addr, config.pool_size
        );

        Ok(MemcachedStore {
            pool,
            addr,
            timeout: config.connection_timeout,
        })
    }

    pub fn from_options(options: &Options) -> Result<Self> {
        Self::new(MemcachedConfig::from_options(options))
    }

    async fn cas_round(&self, key: &str, update: &RegistryUpdate<'_>) -> Result<bool> {
        let stream = TcpStream::connect(&self.addr).await?;
        let mut stream = BufReader::new(stream);

        stream.write_all(format!("gets {}\r\n", key).as_bytes()).await?;
        stream.flush().await?;
        let current = read_gets(&mut stream).await?;

        let next = match update(current.as_ref().map(|(data, _)| data.as_slice()))? {
            Some(next) => next,
            None => return Ok(true),
        };

        let command = match &current {
            Some((_, token)) => format!("cas {} 0 0 {} {}\r\n", key, next.len(), token),
            None => format!("add {} 0 0 {}\r\n", key, next.len()),
        };
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(&next).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;

        let reply = read_line(&mut stream).await?;
        store_outcome(&reply)
    }
}

fn memcached_error(op: &str, key: &str, e: impl std::fmt::Display) -> Error {
    Error::BackendError(format!("Memcached {} failed for key {}: {}", op, key, e))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::BackendError(
            "Memcached closed the connection".to_string(),
        ));
    }
    Ok(line.trim_end().to_string())
}

/// Parse the reply to a single-key `gets`.
async fn read_gets<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<(Vec<u8>, u64)>> {
    let header = read_line(reader).await?;
    if header == "END" {
        return Ok(None);
    }
    let parts: Vec<&str> = header.split_whitespace().collect();
    let (len, token) = match parts.as_slice() {
        ["VALUE", _key, _flags, len, token] => (
            len.parse::<usize>().map_err(Error::backend)?,
            token.parse::<u64>().map_err(Error::backend)?,
        ),
        _ => {
            return Err(Error::BackendError(format!(
                "unexpected gets reply: {}",
                header
            )))
        }
    };
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).await?;
    data.truncate(len);
    let end = read_line(reader).await?;
    if end != "END" {
        return Err(Error::BackendError(format!("unexpected gets trailer: {}", end)));
    }
    Ok(Some((data, token)))
}

/// Map a `cas`/`add` reply to won (`true`) or lost (`false`).
fn store_outcome(reply: &str) -> Result<bool> {
    match reply {
        "STORED" => Ok(true),
        "EXISTS" | "NOT_FOUND" | "NOT_STORED" => Ok(false),
        other => Err(Error::BackendError(format!(
            "unexpected store reply: {}",
            other
        ))),
    }
}

impl RemoteStore for MemcachedStore {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn enumerable(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;
        match conn.get(key).await {
            Ok(Some(value)) => Ok(value.data),
            Ok(None) => Ok(None),
            Err(e) => Err(memcached_error("GET", key, e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;

        // Values < 2592000 (30 days) are interpreted as seconds from now
        let expiration = ttl.map(|d| d.as_secs().max(1) as i64);

        conn.set(key, value, expiration, None)
            .await
            .map_err(|e| memcached_error("SET", key, e))?;
        debug!("✓ Memcached SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;
        match conn.delete(key).await {
            Ok(()) => {}
            Err(e) if e.to_string().to_lowercase().contains("not found") => {}
            Err(e) => return Err(memcached_error("DELETE", key, e)),
        }
        debug!("✓ Memcached DELETE {}", key);
        Ok(())
    }

    async fn try_update(&self, key: &str, update: &RegistryUpdate<'_>) -> Result<bool> {
        match tokio::time::timeout(self.timeout, self.cas_round(key, update)).await {
            Ok(result) => result,
            Err(_) => Err(memcached_error("CAS", key, "timed out")),
        }
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;
        conn.flush_all()
            .await
            .map_err(|e| Error::BackendError(format!("Memcached FLUSH_ALL failed: {}", e)))?;
        warn!("⚠ Memcached FLUSH_ALL executed - all cache cleared!");
        Ok(())
    }

    async fn scan_keys(&self, _prefix: &str) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;
        conn.get(HEALTH_KEY)
            .await
            .map(|_| ())
            .map_err(|e| memcached_error("GET", HEALTH_KEY, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcached_config_default() {
        let config = MemcachedConfig::default();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0], "localhost:11211");
        assert_eq!(config.pool_size, 10);
    }

    #[test]
    fn test_memcached_config_multiple_servers() {
        let options = Options::from_json(r#"{"Servers": ["cache1:11211", "cache2:11211"]}"#)
            .expect("options");
        let config = MemcachedConfig::from_options(&options);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0], "cache1:11211");
    }

    #[test]
    fn test_new_requires_a_server() {
        let config = MemcachedConfig {
            servers: vec![],
            ..Default::default()
        };
        assert!(matches!(
            MemcachedStore::new(config),
            Err(Error::ConfigError(_))
        ));
    }

    fn store_at(addr: std::net::SocketAddr, timeout: Duration) -> MemcachedStore {
        MemcachedStore::new(MemcachedConfig {
            servers: vec![addr.to_string()],
            connection_timeout: timeout,
            pool_size: 1,
        })
        .expect("store")
    }

    #[tokio::test]
    async fn test_registry_update_against_scripted_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut socket = BufReader::new(socket);
            assert_eq!(read_line(&mut socket).await.expect("gets"), "gets reg");
            socket.write_all(b"END\r\n").await.expect("reply");
            assert_eq!(read_line(&mut socket).await.expect("add"), "add reg 0 0 2");
            assert_eq!(read_line(&mut socket).await.expect("data"), "{}");
            socket.write_all(b"STORED\r\n").await.expect("reply");
        });

        let store = store_at(addr, Duration::from_secs(5));
        let won = store
            .try_update("reg", &|current: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
                assert!(current.is_none());
                Ok(Some(b"{}".to_vec()))
            })
            .await
            .expect("update");
        assert!(won);
        server.await.expect("server");
    }

    #[tokio::test]
    async fn test_registry_update_times_out_on_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let store = store_at(addr, Duration::from_millis(50));
        let started = std::time::Instant::now();
        let update = |_: Option<&[u8]>| -> Result<Option<Vec<u8>>> { Ok(Some(b"{}".to_vec())) };
        let result = store.try_update("reg", &update).await;
        assert!(matches!(result, Err(Error::BackendError(ref m)) if m.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[tokio::test]
    async fn test_read_gets_hit() {
        let mut reply: &[u8] = b"VALUE reg 0 5 42\r\nhello\r\nEND\r\n";
        let parsed = read_gets(&mut reply).await.expect("parse");
        assert_eq!(parsed, Some((b"hello".to_vec(), 42)));
    }

    #[tokio::test]
    async fn test_read_gets_binary_payload_with_crlf() {
        let mut reply: &[u8] = b"VALUE reg 0 4 7\r\na\r\nb\r\nEND\r\n";
        let parsed = read_gets(&mut reply).await.expect("parse");
        assert_eq!(parsed, Some((b"a\r\nb".to_vec(), 7)));
    }

    #[tokio::test]
    async fn test_read_gets_miss_and_garbage() {
        let mut miss: &[u8] = b"END\r\n";
        assert_eq!(read_gets(&mut miss).await.expect("parse"), None);

        let mut garbage: &[u8] = b"SERVER_ERROR out of memory\r\n";
        assert!(read_gets(&mut garbage).await.is_err());

        let mut closed: &[u8] = b"";
        assert!(read_gets(&mut closed).await.is_err());
    }

    #[test]
    fn test_store_outcome() {
        assert!(store_outcome("STORED").expect("stored"));
        assert!(!store_outcome("EXISTS").expect("exists"));
        assert!(!store_outcome("NOT_STORED").expect("not stored"));
        assert!(!store_outcome("NOT_FOUND").expect("not found"));
        assert!(store_outcome("ERROR").is_err());
    }
}
