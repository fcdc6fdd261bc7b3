//! Storage drivers.
//!
//! Every backend implements [`Driver`]: the same tag-invalidated contract on
//! top of a storage medium with its own atomicity and persistence
//! guarantees.
//!
//! # Available drivers
//!
//! - [`MemoryDriver`]: process-local maps (feature `inmemory`)
//! - [`SessionDriver`]: maps inside a request-spanning [`Session`] (feature `inmemory`)
//! - [`CompactFileDriver`]: whole keyspace in one file (feature `file`)
//! - [`DistributedFileDriver`]: one file per key and per tag (feature `file`)
//! - [`DatabaseDriver`]: keyspace and tag tables over SQLite (feature `database`)
//! - [`RemoteDriver`] over [`RedisStore`] or [`MemcachedStore`] (features `redis`, `memcached`)
//!
//! # Failure model
//!
//! Drivers never return errors. Misses, stale entries, invalid keys and
//! backend failures all surface as the sentinel of the operation (`None`,
//! `false`, an empty map); failures are additionally reported to the
//! driver's [`ErrorSink`](crate::observability::ErrorSink).

use crate::entry::{normalize_tags, EntryMode, Value};
use crate::error::{Error, Result};
use crate::key::{validate_key, validate_tags, WILDCARD};
use crate::observability::ErrorSink;
use crate::timestamp::Timestamp;
use std::collections::BTreeMap;

#[cfg(feature = "inmemory")]
pub mod map;
#[cfg(feature = "inmemory")]
pub mod memory;
#[cfg(feature = "inmemory")]
pub mod session;

#[cfg(feature = "file")]
pub mod compact_file;
#[cfg(feature = "file")]
pub mod distributed_file;
#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "database")]
pub mod database;

#[cfg(any(feature = "redis", feature = "memcached"))]
pub mod remote;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "memcached")]
pub mod memcached;

#[cfg(feature = "inmemory")]
pub use memory::MemoryDriver;
#[cfg(feature = "inmemory")]
pub use session::{Session, SessionDriver};

#[cfg(feature = "file")]
pub use compact_file::CompactFileDriver;
#[cfg(feature = "file")]
pub use distributed_file::DistributedFileDriver;
#[cfg(feature = "file")]
pub use file::{FileConfig, FileDriver};

#[cfg(feature = "database")]
pub use database::{DatabaseConfig, DatabaseDriver};

#[cfg(any(feature = "redis", feature = "memcached"))]
pub use remote::{RemoteConfig, RemoteDriver, RemoteStore};

#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisStore};

#[cfg(feature = "memcached")]
pub use memcached::{MemcachedConfig, MemcachedStore};

/// What a driver can natively do.
///
/// Queried by the layer above instead of probing for methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Structured values are stored as-is; otherwise only `Value::String` is accepted.
    pub multi_value: bool,
    /// Content survives a process restart.
    pub non_volatile: bool,
    /// `read_all` enumerates the keyspace; otherwise it always returns an empty map.
    pub enumerable: bool,
}

/// Target of [`Driver::clear`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearScope<'a> {
    /// Destroy the whole backend-local dataset.
    All,
    /// Delete the registry rows of these tags.
    Tags(&'a [&'a str]),
}

impl<'a> ClearScope<'a> {
    /// Map a tag list to a scope; a `"*"` anywhere in the list means everything.
    pub fn parse(tags: &'a [&'a str]) -> Self {
        if tags.iter().any(|t| *t == WILDCARD) {
            ClearScope::All
        } else {
            ClearScope::Tags(tags)
        }
    }
}

/// Uniform storage contract.
///
/// Each call finishes all of its backend I/O before the returned future
/// resolves; drivers spawn no tasks and keep no timers.
#[allow(async_fn_in_trait)]
pub trait Driver: Send + Sync {
    /// Short name used in logs and error reports.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// True iff a valid entry exists under `key`.
    async fn exist(&self, key: &str) -> bool;

    /// Value of a valid entry, `None` for missing, stale or unreadable entries.
    async fn read(&self, key: &str) -> Option<Value>;

    /// Every valid entry. Empty for drivers that cannot enumerate.
    async fn read_all(&self) -> BTreeMap<String, Value>;

    /// Single-entry form of [`write_all`](Self::write_all).
    async fn write(&self, key: &str, value: Value, tags: &[&str]) -> bool {
        let mut values = BTreeMap::new();
        values.insert(key.to_string(), value);
        self.write_all(values, tags, false).await
    }

    /// Write a batch sharing one timestamp and one tag set.
    ///
    /// With `overwrite` every key absent from `values` is removed. Returns
    /// true only if every entry of the batch was stored.
    async fn write_all(&self, values: BTreeMap<String, Value>, tags: &[&str], overwrite: bool)
        -> bool;

    /// Remove `key` unconditionally. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> bool;

    async fn clear(&self, scope: ClearScope<'_>);

    /// Physically drop invalid entries and unreferenced tag rows.
    async fn garbage_collection(&self);
}

/// Write batch after validation, ready for a backend.
#[derive(Clone, Debug)]
pub struct Batch {
    pub created: Timestamp,
    pub tags: Vec<String>,
    pub entries: Vec<(String, Value)>,
    /// Entries dropped because of an invalid key or unsupported value.
    pub rejected: usize,
}

impl Batch {
    pub fn is_complete(&self) -> bool {
        self.rejected == 0
    }
}

/// Limits a driver applies when validating a batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchRules {
    pub key_max: usize,
    pub mode: EntryMode,
    pub multi_value: bool,
}

impl BatchRules {
    /// Validate keys, tags and values of a write.
    ///
    /// Invalid tags, or tags in raw mode, fail the batch. Invalid keys and
    /// values the driver cannot store are dropped and reported individually.
    ///
    /// # Errors
    /// `Error::InvalidTag` or `Error::Unsupported` for batch-wide problems.
    pub fn prepare(
        &self,
        driver: &'static str,
        sink: &dyn ErrorSink,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        created: Timestamp,
    ) -> Result<Batch> {
        let tags = normalize_tags(tags);
        validate_tags(&tags)?;
        if self.mode == EntryMode::Raw && !tags.is_empty() {
            return Err(Error::Unsupported(
                "tags require metadata storage".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(values.len());
        let mut rejected = 0;
        for (key, value) in values {
            if let Err(e) = validate_key(&key, self.key_max) {
                sink.report(driver, "write", &e);
                rejected += 1;
                continue;
            }
            if !self.multi_value && !value.is_string() {
                sink.report(
                    driver,
                    "write",
                    &Error::Unsupported(format!("{} stores string values only", driver)),
                );
                rejected += 1;
                continue;
            }
            entries.push((key, value));
        }

        Ok(Batch {
            created,
            tags,
            entries,
            rejected,
        })
    }
}

/// Collapse an internal result into the contract's sentinel.
pub(crate) fn settle<T>(
    sink: &dyn ErrorSink,
    driver: &'static str,
    operation: &'static str,
    result: Result<T>,
    fallback: T,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) if e.is_corruption() => {
            debug!("{} {}: unreadable data treated as empty: {}", driver, operation, e);
            fallback
        }
        Err(e) => {
            sink.report(driver, operation, &e);
            fallback
        }
    }
}
