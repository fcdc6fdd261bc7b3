//! Shared algorithm of the remote cache drivers.
//!
//! A remote store only offers get/set/delete on opaque blobs plus one
//! conditional update primitive. [`RemoteDriver`] builds the tag-invalidated
//! contract on top of that:
//!
//! - every entry is one blob `{created, tags, data}` under `prefix.key`, so a
//!   read costs one round trip, plus one more for the registry when the
//!   entry carries tags;
//! - the tag registry is a single blob under `prefix_TAG-REGISTRY`, updated
//!   through a bounded optimistic retry loop around [`RemoteStore::try_update`];
//! - the TTL is also handed to the store as native expiry, so abandoned
//!   entries are reaped by the server. Garbage collection is a no-op.

use super::{settle, Batch, BatchRules, Capabilities, ClearScope, Driver};
use crate::config::Options;
use crate::entry::{EntryMode, Freshness, MetaEntry, TagRegistry, Value};
use crate::error::{Error, Result};
use crate::key::{
    namespaced, registry_key, validate_key, validate_prefix, validate_tag, KEY_MAX_DEFAULT,
};
use crate::observability::{default_sink, SharedSink};
use crate::serialization::Format;
use crate::timestamp::{Clock, SystemClock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Default number of registry update attempts before giving up.
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 16;

/// Default prefix when neither `Prefix` nor `Group` is configured.
pub const DEFAULT_PREFIX: &str = "tagkv";

/// Computes the new registry blob from the current one.
///
/// Returning `Ok(None)` means nothing needs to be written.
pub type RegistryUpdate<'a> =
    dyn Fn(Option<&[u8]>) -> Result<Option<Vec<u8>>> + Send + Sync + 'a;

/// Blob store reachable over the network.
#[allow(async_fn_in_trait)]
pub trait RemoteStore: Send + Sync {
    /// Short name used in logs and error reports.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`; removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// One optimistic read-modify-write of `key`.
    ///
    /// Returns `Ok(false)` if another writer changed the key between the
    /// read and the conditional write.
    async fn try_update(&self, key: &str, update: &RegistryUpdate<'_>) -> Result<bool>;

    /// Drop everything the store holds, in the cheapest way it offers.
    async fn flush(&self) -> Result<()>;

    /// Whether [`scan_keys`](Self::scan_keys) can list the keyspace.
    fn enumerable(&self) -> bool;

    /// Keys of the form `prefix.*`, or `None` if the store cannot enumerate.
    async fn scan_keys(&self, prefix: &str) -> Result<Option<Vec<String>>>;

    /// Cheap round trip proving the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Settings of [`RemoteDriver`] shared by every store.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Namespace of every key written by the driver. Non-empty, without `.`.
    pub prefix: String,
    pub ttl: Option<Duration>,
    /// Encoding of entry blobs.
    pub format: Format,
    pub max_cas_attempts: u32,
    /// First retry delay; doubled after each conflict.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            prefix: DEFAULT_PREFIX.to_string(),
            ttl: None,
            format: Format::Json,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(64),
        }
    }
}

impl RemoteConfig {
    /// Build from `Prefix` (or `Group`), `Expire`, `Format` and `MaxCasAttempts`.
    ///
    /// # Errors
    /// `Error::ConfigError` for an unknown or metadata-incapable format.
    pub fn from_options(options: &Options) -> Result<Self> {
        let defaults = RemoteConfig::default();
        let config = RemoteConfig {
            prefix: options
                .prefix
                .clone()
                .or_else(|| options.group.clone())
                .unwrap_or(defaults.prefix),
            ttl: options.ttl(),
            format: match options.format {
                Some(_) => options.format()?,
                None => defaults.format,
            },
            max_cas_attempts: options
                .max_cas_attempts
                .unwrap_or(defaults.max_cas_attempts),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.prefix)?;
        if !self.format.supports_metadata() {
            return Err(Error::ConfigError(format!(
                "{} format cannot hold remote entries",
                self.format
            )));
        }
        if self.max_cas_attempts == 0 {
            return Err(Error::ConfigError("MaxCasAttempts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts;
        self
    }

    fn key_max(&self) -> usize {
        KEY_MAX_DEFAULT.saturating_sub(self.prefix.len() + 1)
    }
}

fn decode_registry(bytes: Option<&[u8]>) -> TagRegistry {
    match bytes {
        Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
            warn!("Unreadable tag registry replaced with an empty one: {}", e);
            TagRegistry::new()
        }),
        None => TagRegistry::new(),
    }
}

/// Tag-invalidated driver over any [`RemoteStore`].
pub struct RemoteDriver<S: RemoteStore> {
    store: S,
    config: RemoteConfig,
    registry_key: String,
    fresh: Freshness,
    sink: SharedSink,
    available: bool,
}

impl<S: RemoteStore> RemoteDriver<S> {
    /// Wrap a store, checking it is reachable.
    ///
    /// An unreachable store yields a driver that answers every call with the
    /// safe default. Configuration problems are still errors.
    ///
    /// # Errors
    /// `Error::ConfigError` for an invalid configuration.
    pub async fn connect(store: S, config: RemoteConfig) -> Result<Self> {
        Self::connect_with_clock(store, config, Arc::new(SystemClock::new())).await
    }

    pub async fn connect_with_clock(
        store: S,
        config: RemoteConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let available = match store.ping().await {
            Ok(()) => {
                info!(
                    "✓ {} driver initialized (prefix: {})",
                    store.name(),
                    config.prefix
                );
                true
            }
            Err(e) => {
                warn!(
                    "{} unreachable, driver disabled: {}",
                    store.name(),
                    e
                );
                false
            }
        };
        Ok(RemoteDriver {
            registry_key: registry_key(&config.prefix),
            fresh: Freshness::new(config.ttl, clock),
            store,
            config,
            sink: default_sink(),
            available,
        })
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn entry_key(&self, key: &str) -> String {
        namespaced(&self.config.prefix, key)
    }

    fn strip_prefix<'k>(&self, stored: &'k str) -> Option<&'k str> {
        stored
            .strip_prefix(self.config.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
    }

    /// Apply `change` to the registry with bounded optimistic retries.
    async fn update_registry<F>(&self, change: F) -> Result<()>
    where
        F: Fn(&mut TagRegistry) -> bool + Send + Sync,
    {
        let update = |current: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
            let mut registry = decode_registry(current);
            if change(&mut registry) {
                serde_json::to_vec(&registry)
                    .map(Some)
                    .map_err(Error::serialization)
            } else {
                Ok(None)
            }
        };

        let mut delay = self.config.backoff;
        for attempt in 1..=self.config.max_cas_attempts {
            if self.store.try_update(&self.registry_key, &update).await? {
                return Ok(());
            }
            debug!(
                "{} registry update conflict (attempt {}/{})",
                self.store.name(),
                attempt,
                self.config.max_cas_attempts
            );
            if attempt < self.config.max_cas_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.max_backoff);
            }
        }
        Err(Error::CasExhausted {
            attempts: self.config.max_cas_attempts,
        })
    }

    async fn registry(&self) -> Result<TagRegistry> {
        let bytes = self.store.get(&self.registry_key).await?;
        Ok(decode_registry(bytes.as_deref()))
    }

    async fn load(&self, key: &str) -> Result<Option<MetaEntry>> {
        match self.store.get(&self.entry_key(key)).await? {
            Some(bytes) => self.config.format.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn is_valid(&self, entry: &MetaEntry, registry: Option<&TagRegistry>) -> bool {
        if !self.fresh.is_fresh(&entry.created) {
            return false;
        }
        match registry {
            Some(registry) => registry.validates(entry),
            None => entry.tags.is_empty(),
        }
    }

    async fn try_read(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key, self.config.key_max())?;
        let Some(entry) = self.load(key).await? else {
            debug!("✓ {} GET {} -> MISS", self.store.name(), key);
            return Ok(None);
        };
        let registry = if entry.tags.is_empty() {
            None
        } else {
            Some(self.registry().await?)
        };
        if self.is_valid(&entry, registry.as_ref()) {
            debug!("✓ {} GET {} -> HIT", self.store.name(), key);
            Ok(Some(entry.data))
        } else {
            debug!("✓ {} GET {} -> STALE", self.store.name(), key);
            self.store.delete(&self.entry_key(key)).await?;
            Ok(None)
        }
    }

    async fn try_read_all(&self) -> Result<BTreeMap<String, Value>> {
        let Some(stored) = self.store.scan_keys(&self.config.prefix).await? else {
            return Ok(BTreeMap::new());
        };
        let registry = self.registry().await?;
        let mut out = BTreeMap::new();
        for stored_key in stored {
            if stored_key == self.registry_key {
                continue;
            }
            let Some(key) = self.strip_prefix(&stored_key) else {
                continue;
            };
            let entry = match self.load(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) if e.is_corruption() => continue,
                Err(e) => return Err(e),
            };
            if self.is_valid(&entry, Some(&registry)) {
                out.insert(key.to_string(), entry.data);
            } else {
                self.store.delete(&stored_key).await?;
            }
        }
        Ok(out)
    }

    async fn try_write(&self, batch: Batch, overwrite: bool) -> Result<bool> {
        let enumerable = if overwrite {
            match self.store.scan_keys(&self.config.prefix).await? {
                Some(existing) => {
                    let keep: BTreeSet<String> = batch
                        .entries
                        .iter()
                        .map(|(k, _)| self.entry_key(k))
                        .collect();
                    for stored_key in existing {
                        let ours = self.strip_prefix(&stored_key).is_some();
                        if ours && !keep.contains(&stored_key) {
                            self.store.delete(&stored_key).await?;
                        }
                    }
                    true
                }
                None => {
                    self.store.flush().await?;
                    false
                }
            }
        } else {
            true
        };

        if overwrite && enumerable {
            let tags = batch.tags.clone();
            let created = batch.created.clone();
            self.update_registry(move |registry| {
                registry.clear();
                registry.register(&tags, &created);
                true
            })
            .await?;
        } else if !batch.tags.is_empty() {
            self.update_registry(|registry| registry.register(&batch.tags, &batch.created))
                .await?;
        }

        let mut complete = batch.is_complete();
        for (key, value) in batch.entries {
            let entry = MetaEntry::new(batch.created.clone(), batch.tags.clone(), value);
            let result = match self.config.format.encode(&entry) {
                Ok(bytes) => {
                    self.store
                        .set(&self.entry_key(&key), &bytes, self.config.ttl)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.sink.report(self.store.name(), "write", &e);
                complete = false;
            }
        }
        Ok(complete)
    }

    async fn try_delete(&self, key: &str) -> Result<bool> {
        validate_key(key, self.config.key_max())?;
        self.store.delete(&self.entry_key(key)).await?;
        Ok(true)
    }

    async fn try_clear(&self, scope: ClearScope<'_>) -> Result<()> {
        match scope {
            ClearScope::All => self.store.flush().await,
            ClearScope::Tags(tags) => {
                let tags: Vec<&str> = tags
                    .iter()
                    .copied()
                    .filter(|t| validate_tag(t).is_ok())
                    .collect();
                if tags.is_empty() {
                    return Ok(());
                }
                self.update_registry(|registry| registry.remove(&tags)).await
            }
        }
    }
}

impl<S: RemoteStore> Driver for RemoteDriver<S> {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multi_value: true,
            non_volatile: false,
            enumerable: self.store.enumerable(),
        }
    }

    async fn exist(&self, key: &str) -> bool {
        if !self.available {
            return false;
        }
        let result = self.try_read(key).await.map(|v| v.is_some());
        settle(&*self.sink, self.store.name(), "exist", result, false)
    }

    async fn read(&self, key: &str) -> Option<Value> {
        if !self.available {
            return None;
        }
        settle(&*self.sink, self.store.name(), "read", self.try_read(key).await, None)
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        if !self.available {
            return BTreeMap::new();
        }
        settle(
            &*self.sink,
            self.store.name(),
            "read_all",
            self.try_read_all().await,
            BTreeMap::new(),
        )
    }

    async fn write_all(
        &self,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        overwrite: bool,
    ) -> bool {
        if !self.available {
            return false;
        }
        let rules = BatchRules {
            key_max: self.config.key_max(),
            mode: EntryMode::Metadata,
            multi_value: true,
        };
        let name = self.store.name();
        let result = match rules.prepare(name, &*self.sink, values, tags, self.fresh.now()) {
            Ok(batch) => self.try_write(batch, overwrite).await,
            Err(e) => Err(e),
        };
        settle(&*self.sink, name, "write", result, false)
    }

    async fn delete(&self, key: &str) -> bool {
        if !self.available {
            return false;
        }
        settle(&*self.sink, self.store.name(), "delete", self.try_delete(key).await, false)
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        if !self.available {
            return;
        }
        settle(&*self.sink, self.store.name(), "clear", self.try_clear(scope).await, ());
    }

    async fn garbage_collection(&self) {
        debug!("{} GC skipped, entries expire natively", self.store.name());
    }
}
