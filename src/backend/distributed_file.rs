//! Distributed file driver: one file per key, one file per tag.
//!
//! ```text
//! <root>/<s1>/<s2>/<key-or-md5>.<ext>     value files, `Spread` shard levels
//! <root>/Tags/<tag>.tag                   bare creation timestamp of the tag
//! ```
//!
//! Shard directories are the first two, four or six hex digits of the MD5 of
//! the key, which keeps directory fan-out bounded without an index. Tag
//! files are created before any value file that references them and are
//! never rewritten while they exist, so the first writer of a tag fixes its
//! timestamp until the tag is cleared.

use super::file::{micros_of, remove_if_exists, write_atomic, FileConfig};
use super::{settle, Batch, BatchRules, Capabilities, ClearScope, Driver};
use crate::entry::{tags_valid, EntryMode, Freshness, MetaEntry, Value};
use crate::error::{Error, Result};
use crate::key::{validate_key, validate_tag, KEY_MAX_FILE};
use crate::observability::{default_sink, SharedSink};
use crate::serialization::Format;
use crate::timestamp::{Clock, SystemClock, Timestamp};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const NAME: &str = "distributed_file";

/// Directory holding tag files, directly under the storage root.
pub const TAGS_DIR: &str = "Tags";

const TAG_EXT: &str = "tag";
const RAW_EXT: &str = "cache";

/// Metadata value file. The key is kept so hashed names can be enumerated.
#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: String,
    #[serde(flatten)]
    entry: MetaEntry,
}

/// A value file as loaded from disk.
enum Stored {
    Meta(FileRecord),
    Raw { data: Value, age: Duration },
}

struct Layout {
    root: PathBuf,
    tags_dir: PathBuf,
    format: Format,
    mode: EntryMode,
    spread: u8,
    hash_file_name: bool,
}

impl Layout {
    fn extension(&self) -> &'static str {
        match self.mode {
            EntryMode::Metadata => self.format.extension(),
            EntryMode::Raw => RAW_EXT,
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Md5::digest(key.as_bytes()));
        let mut path = self.root.clone();
        for level in 0..self.spread as usize {
            path.push(&digest[level * 2..level * 2 + 2]);
        }
        let stem = if self.hash_file_name {
            digest.as_str()
        } else {
            key
        };
        path.push(format!("{}.{}", stem, self.extension()));
        path
    }

    fn tag_path(&self, tag: &str) -> PathBuf {
        self.tags_dir.join(format!("{}.{}", tag, TAG_EXT))
    }

    fn encode(&self, key: &str, created: &Timestamp, tags: &[String], data: &Value) -> Result<Vec<u8>> {
        match self.mode {
            EntryMode::Metadata => self.format.encode(&FileRecord {
                key: key.to_string(),
                entry: MetaEntry::new(created.clone(), tags.to_vec(), data.clone()),
            }),
            EntryMode::Raw => data
                .as_str()
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| Error::Unsupported("raw files hold strings only".to_string())),
        }
    }

    async fn load(&self, path: &Path, now_micros: u64) -> Result<Option<Stored>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.mode {
            EntryMode::Metadata => self.format.decode(&bytes).map(|r| Some(Stored::Meta(r))),
            EntryMode::Raw => {
                let age = file_age(path, now_micros).await?;
                let text = String::from_utf8(bytes).map_err(Error::deserialization)?;
                Ok(Some(Stored::Raw {
                    data: Value::String(text),
                    age,
                }))
            }
        }
    }

    async fn read_tag(&self, tag: &str) -> Result<Option<Timestamp>> {
        match tokio::fs::read_to_string(self.tag_path(tag)).await {
            Ok(text) => Ok(Timestamp::parse(text.trim())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create tag files that do not exist yet; existing ones are left alone.
    async fn register_tag(&self, tag: &str, created: &Timestamp) -> Result<()> {
        tokio::fs::create_dir_all(&self.tags_dir).await?;
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.tag_path(tag))
            .await;
        match opened {
            Ok(mut file) => {
                file.write_all(created.as_str().as_bytes()).await?;
                file.flush().await?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every value file under the root, skipping the tag directory and temp files.
    async fn value_files(&self) -> Result<Vec<PathBuf>> {
        let ext = self.extension();
        let mut files = Vec::new();
        let mut pending = vec![(self.root.clone(), 0u8)];
        while let Some((dir, depth)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let kind = entry.file_type().await?;
                if kind.is_dir() {
                    if depth == 0 && name == TAGS_DIR {
                        continue;
                    }
                    if depth < self.spread {
                        pending.push((path, depth + 1));
                    }
                } else if kind.is_file() && path.extension().map_or(false, |e| e == ext) {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    async fn tag_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut tags = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.tags_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(tags),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |e| e == TAG_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    tags.push((stem.to_string(), path.clone()));
                }
            }
        }
        Ok(tags)
    }
}

/// Age of a file's content measured on the driver clock.
async fn file_age(path: &Path, now_micros: u64) -> Result<Duration> {
    let modified = tokio::fs::metadata(path).await?.modified()?;
    Ok(Duration::from_micros(
        now_micros.saturating_sub(micros_of(modified)),
    ))
}

/// Registry lookups memoized for the duration of one operation.
type TagCache = HashMap<String, Option<Timestamp>>;

/// Driver spreading entries over one file per key.
#[derive(Clone)]
pub struct DistributedFileDriver {
    layout: Arc<Layout>,
    fresh: Freshness,
    sink: SharedSink,
}

impl DistributedFileDriver {
    /// # Errors
    /// `Error::ConfigError` when the configuration is inconsistent.
    pub fn new(config: FileConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: FileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        info!(
            "✓ Distributed file driver initialized at {} (spread: {}, hashed names: {})",
            config.path.display(),
            config.spread,
            config.hash_file_name
        );
        Ok(DistributedFileDriver {
            layout: Arc::new(Layout {
                tags_dir: config.path.join(TAGS_DIR),
                root: config.path,
                format: config.format,
                mode: config.mode,
                spread: config.spread,
                hash_file_name: config.hash_file_name,
            }),
            fresh: Freshness::new(config.ttl, clock),
            sink: default_sink(),
        })
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Location of the value file for `key`.
    pub fn key_path(&self, key: &str) -> PathBuf {
        self.layout.key_path(key)
    }

    pub fn tag_path(&self, tag: &str) -> PathBuf {
        self.layout.tag_path(tag)
    }

    async fn tags_hold(&self, entry: &MetaEntry, cache: &mut TagCache) -> Result<bool> {
        for tag in &entry.tags {
            if !cache.contains_key(tag) {
                let row = self.layout.read_tag(tag).await?;
                cache.insert(tag.clone(), row);
            }
        }
        Ok(tags_valid(&entry.tags, &entry.created, |tag| {
            cache.get(tag).cloned().flatten()
        }))
    }

    /// Validate a loaded file; returns its key and value if it is still valid.
    async fn check(
        &self,
        path: &Path,
        stored: Stored,
        cache: &mut TagCache,
    ) -> Result<Option<(Option<String>, Value)>> {
        match stored {
            Stored::Meta(record) => {
                let valid = self.fresh.is_fresh(&record.entry.created)
                    && self.tags_hold(&record.entry, cache).await?;
                Ok(valid.then_some((Some(record.key), record.entry.data)))
            }
            Stored::Raw { data, age } => {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|_| !self.layout.hash_file_name)
                    .map(str::to_string);
                Ok(self.fresh.is_fresh_age(age).then_some((key, data)))
            }
        }
    }

    async fn try_read(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key, KEY_MAX_FILE)?;
        let path = self.layout.key_path(key);
        let Some(stored) = self.layout.load(&path, self.fresh.now_micros()).await? else {
            debug!("✓ File GET {} -> MISS", key);
            return Ok(None);
        };
        if let Stored::Meta(record) = &stored {
            if record.key != key {
                return Ok(None);
            }
        }
        match self.check(&path, stored, &mut TagCache::new()).await? {
            Some((_, value)) => {
                debug!("✓ File GET {} -> HIT", key);
                Ok(Some(value))
            }
            None => {
                debug!("✓ File GET {} -> STALE", key);
                remove_if_exists(&path).await?;
                Ok(None)
            }
        }
    }

    async fn try_exist(&self, key: &str) -> Result<bool> {
        validate_key(key, KEY_MAX_FILE)?;
        if self.layout.mode == EntryMode::Raw {
            let path = self.layout.key_path(key);
            return match file_age(&path, self.fresh.now_micros()).await {
                Ok(age) => Ok(self.fresh.is_fresh_age(age)),
                Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            };
        }
        self.try_read(key).await.map(|v| v.is_some())
    }

    async fn try_read_all(&self) -> Result<BTreeMap<String, Value>> {
        let mut cache = TagCache::new();
        let mut out = BTreeMap::new();
        for path in self.layout.value_files().await? {
            let stored = match self.layout.load(&path, self.fresh.now_micros()).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) if e.is_corruption() => continue,
                Err(e) => return Err(e),
            };
            match self.check(&path, stored, &mut cache).await? {
                Some((Some(key), value)) => {
                    out.insert(key, value);
                }
                Some((None, _)) => {}
                None => remove_if_exists(&path).await?,
            }
        }
        Ok(out)
    }

    async fn try_write(&self, batch: Batch, overwrite: bool) -> Result<bool> {
        let mut complete = batch.is_complete();

        futures::future::try_join_all(
            batch
                .tags
                .iter()
                .map(|tag| self.layout.register_tag(tag, &batch.created)),
        )
        .await?;

        let mut written = HashSet::new();
        for (key, value) in &batch.entries {
            let path = self.layout.key_path(key);
            let stored = match self.layout.encode(key, &batch.created, &batch.tags, value) {
                Ok(bytes) => write_atomic(&path, &bytes, &batch.created).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => {
                    written.insert(path);
                }
                Err(e) => {
                    self.sink.report(NAME, "write", &e);
                    complete = false;
                }
            }
        }
        debug!("✓ File SET {} keys", written.len());

        if overwrite {
            for path in self.layout.value_files().await? {
                if !written.contains(&path) {
                    remove_if_exists(&path).await?;
                }
            }
            for (tag, path) in self.layout.tag_files().await? {
                if !batch.tags.contains(&tag) {
                    remove_if_exists(&path).await?;
                }
            }
        }
        Ok(complete)
    }

    async fn try_delete(&self, key: &str) -> Result<bool> {
        validate_key(key, KEY_MAX_FILE)?;
        remove_if_exists(&self.layout.key_path(key)).await?;
        debug!("✓ File DELETE {}", key);
        Ok(true)
    }

    async fn try_clear(&self, scope: ClearScope<'_>) -> Result<()> {
        match scope {
            ClearScope::All => {
                match tokio::fs::remove_dir_all(&self.layout.root).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                tokio::fs::create_dir_all(&self.layout.root).await?;
            }
            ClearScope::Tags(tags) => {
                for tag in tags {
                    if validate_tag(tag).is_ok() {
                        remove_if_exists(&self.layout.tag_path(tag)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn try_collect_garbage(&self) -> Result<usize> {
        let mut cache = TagCache::new();
        let mut referenced = BTreeSet::new();
        let mut removed = 0;
        for path in self.layout.value_files().await? {
            let keep = match self.layout.load(&path, self.fresh.now_micros()).await {
                Ok(Some(Stored::Meta(record))) => {
                    let tags = record.entry.tags.clone();
                    let valid = self
                        .check(&path, Stored::Meta(record), &mut cache)
                        .await?
                        .is_some();
                    if valid {
                        referenced.extend(tags);
                    }
                    valid
                }
                Ok(Some(stored)) => self.check(&path, stored, &mut cache).await?.is_some(),
                Ok(None) => continue,
                Err(e) if e.is_corruption() => false,
                Err(e) => return Err(e),
            };
            if !keep {
                remove_if_exists(&path).await?;
                removed += 1;
            }
        }
        if self.layout.mode == EntryMode::Metadata {
            for (tag, path) in self.layout.tag_files().await? {
                if !referenced.contains(&tag) {
                    remove_if_exists(&path).await?;
                }
            }
        }
        Ok(removed)
    }
}

impl Driver for DistributedFileDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        let meta = self.layout.mode == EntryMode::Metadata;
        Capabilities {
            multi_value: meta && self.layout.format.supports_metadata(),
            non_volatile: true,
            enumerable: meta || !self.layout.hash_file_name,
        }
    }

    async fn exist(&self, key: &str) -> bool {
        settle(&*self.sink, NAME, "exist", self.try_exist(key).await, false)
    }

    async fn read(&self, key: &str) -> Option<Value> {
        settle(&*self.sink, NAME, "read", self.try_read(key).await, None)
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        settle(
            &*self.sink,
            NAME,
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
        let rules = BatchRules {
            key_max: KEY_MAX_FILE,
            mode: self.layout.mode,
            multi_value: self.capabilities().multi_value,
        };
        let result = match rules.prepare(NAME, &*self.sink, values, tags, self.fresh.now()) {
            Ok(batch) => self.try_write(batch, overwrite).await,
            Err(e) => Err(e),
        };
        settle(&*self.sink, NAME, "write", result, false)
    }

    async fn delete(&self, key: &str) -> bool {
        settle(&*self.sink, NAME, "delete", self.try_delete(key).await, false)
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        settle(&*self.sink, NAME, "clear", self.try_clear(scope).await, ());
    }

    async fn garbage_collection(&self) {
        let result = self.try_collect_garbage().await;
        if let Ok(removed) = &result {
            debug!("✓ File GC removed {} files", removed);
        }
        settle(&*self.sink, NAME, "garbage_collection", result.map(|_| ()), ());
    }
}
