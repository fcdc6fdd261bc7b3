//! Shared configuration and helpers of the two file layouts.

use super::compact_file::CompactFileDriver;
use super::distributed_file::DistributedFileDriver;
use super::{Capabilities, ClearScope, Driver};
use crate::config::{FileLayout, Options};
use crate::entry::{EntryMode, Value};
use crate::error::{Error, Result};
use crate::serialization::Format;
use crate::timestamp::Timestamp;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Deepest supported directory sharding.
pub const MAX_SPREAD: u8 = 3;

/// Configuration of the file drivers.
///
/// For the compact layout `path` names the storage file; for the
/// distributed layout it names the storage directory.
#[derive(Clone, Debug)]
pub struct FileConfig {
    pub path: PathBuf,
    pub layout: FileLayout,
    pub format: Format,
    pub mode: EntryMode,
    /// Take an exclusive advisory lock around compact writes.
    pub lock: bool,
    /// Levels of two-character hashed subdirectories (distributed layout).
    pub spread: u8,
    /// Name value files after the MD5 of the key (distributed layout).
    pub hash_file_name: bool,
    pub ttl: Option<Duration>,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>, layout: FileLayout) -> Self {
        FileConfig {
            path: path.into(),
            layout,
            format: Format::default(),
            mode: EntryMode::Metadata,
            lock: true,
            spread: 0,
            hash_file_name: false,
            ttl: None,
        }
    }

    /// Build from the recognized options.
    ///
    /// # Errors
    /// `Error::ConfigError` if `Path` is missing or an option is out of range.
    pub fn from_options(options: &Options) -> Result<Self> {
        let path = Options::require(&options.path, "Path")?.clone();
        let config = FileConfig {
            path,
            layout: options.mode.unwrap_or_default(),
            format: options.format()?,
            mode: options.entry_mode(),
            lock: options.lock_file.unwrap_or(true),
            spread: options.spread.unwrap_or(0),
            hash_file_name: options.hash_file_name.unwrap_or(false),
            ttl: options.ttl(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations no file driver can serve.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::ConfigError("empty Path".to_string()));
        }
        if self.spread > MAX_SPREAD {
            return Err(Error::ConfigError(format!(
                "Spread must be 0..={}, got {}",
                MAX_SPREAD, self.spread
            )));
        }
        if self.mode == EntryMode::Metadata && !self.format.supports_metadata() {
            return Err(Error::ConfigError(format!(
                "{} format cannot hold metadata entries",
                self.format
            )));
        }
        Ok(())
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_mode(mut self, mode: EntryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_spread(mut self, spread: u8) -> Self {
        self.spread = spread;
        self
    }

    pub fn with_hash_file_name(mut self, hash: bool) -> Self {
        self.hash_file_name = hash;
        self
    }
}

/// File modification time matching a driver timestamp.
pub(crate) fn mtime_of(ts: &Timestamp) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(ts.to_micros().unwrap_or(0))
}

/// Microseconds since the epoch of a file modification time.
pub(crate) fn micros_of(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

async fn write_stamped(path: &Path, bytes: &[u8], modified: SystemTime) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.into_std().await.set_modified(modified)?;
    Ok(())
}

/// Write through a sibling temp file and rename into place.
///
/// The file's modification time is set to `created`, so ages measured from
/// it follow the driver clock.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8], created: &Timestamp) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::ConfigError(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(".tmp-{}", Uuid::now_v7()));
    if let Err(e) = write_stamped(&tmp, bytes, mtime_of(created)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Either file layout, picked from the `Mode` option.
#[derive(Clone)]
pub enum FileDriver {
    Compact(CompactFileDriver),
    Distributed(DistributedFileDriver),
}

impl FileDriver {
    /// Build the driver named by `Mode` from the recognized options.
    ///
    /// # Errors
    /// `Error::ConfigError` for missing or inconsistent options.
    pub fn from_options(options: &Options) -> Result<Self> {
        Self::new(FileConfig::from_options(options)?)
    }

    pub fn new(config: FileConfig) -> Result<Self> {
        match config.layout {
            FileLayout::Compact => CompactFileDriver::new(config).map(FileDriver::Compact),
            FileLayout::Distributed => {
                DistributedFileDriver::new(config).map(FileDriver::Distributed)
            }
        }
    }
}

impl Driver for FileDriver {
    fn name(&self) -> &'static str {
        match self {
            FileDriver::Compact(d) => d.name(),
            FileDriver::Distributed(d) => d.name(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self {
            FileDriver::Compact(d) => d.capabilities(),
            FileDriver::Distributed(d) => d.capabilities(),
        }
    }

    async fn exist(&self, key: &str) -> bool {
        match self {
            FileDriver::Compact(d) => d.exist(key).await,
            FileDriver::Distributed(d) => d.exist(key).await,
        }
    }

    async fn read(&self, key: &str) -> Option<Value> {
        match self {
            FileDriver::Compact(d) => d.read(key).await,
            FileDriver::Distributed(d) => d.read(key).await,
        }
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        match self {
            FileDriver::Compact(d) => d.read_all().await,
            FileDriver::Distributed(d) => d.read_all().await,
        }
    }

    async fn write_all(
        &self,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        overwrite: bool,
    ) -> bool {
        match self {
            FileDriver::Compact(d) => d.write_all(values, tags, overwrite).await,
            FileDriver::Distributed(d) => d.write_all(values, tags, overwrite).await,
        }
    }

    async fn delete(&self, key: &str) -> bool {
        match self {
            FileDriver::Compact(d) => d.delete(key).await,
            FileDriver::Distributed(d) => d.delete(key).await,
        }
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        match self {
            FileDriver::Compact(d) => d.clear(scope).await,
            FileDriver::Distributed(d) => d.clear(scope).await,
        }
    }

    async fn garbage_collection(&self) {
        match self {
            FileDriver::Compact(d) => d.garbage_collection().await,
            FileDriver::Distributed(d) => d.garbage_collection().await,
        }
    }
}
