//! Compact file driver: the whole keyspace and tag registry in one file.
//!
//! Every write is a read-modify-write of the complete document. With
//! locking enabled the cycle runs under an exclusive advisory lock on the
//! storage file (open, lock, read, truncate, write, release), so writers
//! using the same path take turns. Readers never lock; without locking an
//! interrupted flush can leave a half-written document, which later reads
//! treat as empty storage.
//!
//! In raw mode the document holds bare values and every entry's age is the
//! age of the file itself.

use super::file::{micros_of, mtime_of, FileConfig};
use super::map::MapState;
use super::{settle, BatchRules, Capabilities, ClearScope, Driver};
use crate::entry::{EntryMode, Freshness, MetaEntry, TagRegistry, Value};
use crate::error::{Error, Result};
use crate::key::KEY_MAX_FILE;
use crate::observability::{default_sink, SharedSink};
use crate::serialization::Format;
use crate::timestamp::{Clock, SystemClock, Timestamp};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const NAME: &str = "compact_file";

/// Raw-mode document: values without metadata.
#[derive(Default, Serialize, Deserialize)]
struct RawDocument {
    #[serde(default)]
    tags: TagRegistry,
    #[serde(default)]
    keys: BTreeMap<String, Value>,
}

/// How the document is read from and written to disk.
#[derive(Clone, Debug)]
struct Codec {
    path: PathBuf,
    format: Format,
    mode: EntryMode,
    lock: bool,
}

impl Codec {
    fn decode(&self, bytes: &[u8], modified: Timestamp) -> Result<MapState> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(MapState::new());
        }
        match self.mode {
            EntryMode::Metadata => self.format.decode(bytes),
            EntryMode::Raw => {
                let raw: RawDocument = self.format.decode(bytes)?;
                Ok(MapState {
                    tags: raw.tags,
                    entries: raw
                        .keys
                        .into_iter()
                        .map(|(k, v)| (k, MetaEntry::new(modified.clone(), Vec::new(), v)))
                        .collect(),
                })
            }
        }
    }

    fn encode(&self, state: &MapState) -> Result<Vec<u8>> {
        match self.mode {
            EntryMode::Metadata => self.format.encode(state),
            EntryMode::Raw => {
                let raw = RawDocument {
                    tags: TagRegistry::new(),
                    keys: state
                        .entries
                        .iter()
                        .map(|(k, e)| (k.clone(), e.data.clone()))
                        .collect(),
                };
                self.format.encode(&raw)
            }
        }
    }

    /// Decode, degrading unreadable content to empty storage.
    fn decode_lenient(&self, bytes: &[u8], modified: Timestamp) -> MapState {
        match self.decode(bytes, modified) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "⚠ {} unreadable, treating as empty: {}",
                    self.path.display(),
                    e
                );
                MapState::new()
            }
        }
    }

    fn load(&self) -> Result<MapState> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(self.decode_lenient(&bytes, modified_at(&self.path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MapState::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write cycle, under the file lock when enabled.
    fn modify<R>(&self, now: Timestamp, f: impl FnOnce(&mut MapState) -> R) -> Result<R> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if self.lock {
            FileExt::lock_exclusive(&file)?;
        }
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut state = self.decode_lenient(&bytes, modified_at(&self.path));
        let result = f(&mut state);
        let encoded = self.encode(&state)?;
        if self.lock {
            rewrite(&mut file, &encoded)?;
        } else {
            drop(file);
            std::fs::write(&self.path, &encoded)?;
            file = OpenOptions::new().write(true).open(&self.path)?;
        }
        file.set_modified(mtime_of(&now))?;
        debug!("✓ Compact flush {} ({} bytes, at {})", self.path.display(), encoded.len(), now);
        Ok(result)
    }
}

fn rewrite(file: &mut File, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}

/// Last flush time of the document, stamped from the driver clock.
fn modified_at(path: &Path) -> Timestamp {
    let micros = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(micros_of)
        .unwrap_or(0);
    Timestamp::from_micros(micros)
}

/// Driver keeping the whole storage in a single serialized document.
#[derive(Clone)]
pub struct CompactFileDriver {
    codec: Arc<Codec>,
    fresh: Freshness,
    sink: SharedSink,
}

impl CompactFileDriver {
    /// # Errors
    /// `Error::ConfigError` when the configuration is inconsistent.
    pub fn new(config: FileConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: FileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        info!(
            "✓ Compact file driver initialized at {} (format: {}, lock: {})",
            config.path.display(),
            config.format,
            config.lock
        );
        Ok(CompactFileDriver {
            codec: Arc::new(Codec {
                path: config.path,
                format: config.format,
                mode: config.mode,
                lock: config.lock,
            }),
            fresh: Freshness::new(config.ttl, clock),
            sink: default_sink(),
        })
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn path(&self) -> &Path {
        &self.codec.path
    }

    fn rules(&self) -> BatchRules {
        BatchRules {
            key_max: KEY_MAX_FILE,
            mode: self.codec.mode,
            multi_value: self.capabilities().multi_value,
        }
    }

    async fn load(&self) -> Result<MapState> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || codec.load())
            .await
            .map_err(Error::backend)?
    }

    async fn modify<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MapState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let codec = self.codec.clone();
        let now = self.fresh.now();
        tokio::task::spawn_blocking(move || codec.modify(now, f))
            .await
            .map_err(Error::backend)?
    }
}

impl Driver for CompactFileDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multi_value: self.codec.format != Format::Ini,
            non_volatile: true,
            enumerable: true,
        }
    }

    async fn exist(&self, key: &str) -> bool {
        let result = self
            .load()
            .await
            .map(|state| state.peek(key, &self.fresh).is_some());
        settle(&*self.sink, NAME, "exist", result, false)
    }

    async fn read(&self, key: &str) -> Option<Value> {
        let result = self
            .load()
            .await
            .map(|state| state.peek(key, &self.fresh).map(|e| e.data.clone()));
        settle(&*self.sink, NAME, "read", result, None)
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        let result = match self.load().await {
            Ok(mut state) => {
                if state.prune(&self.fresh) > 0 {
                    let fresh = self.fresh.clone();
                    self.modify(move |state| state.read_all(&fresh)).await
                } else {
                    Ok(state.read_all(&self.fresh))
                }
            }
            Err(e) => Err(e),
        };
        settle(&*self.sink, NAME, "read_all", result, BTreeMap::new())
    }

    async fn write_all(
        &self,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        overwrite: bool,
    ) -> bool {
        let batch = match self
            .rules()
            .prepare(NAME, &*self.sink, values, tags, self.fresh.now())
        {
            Ok(batch) => batch,
            Err(e) => return settle(&*self.sink, NAME, "write", Err(e), false),
        };
        let complete = batch.is_complete();
        let count = batch.entries.len();
        let result = self.modify(move |state| state.apply(batch, overwrite)).await;
        if result.is_ok() {
            debug!("✓ Compact SET {} keys", count);
        }
        settle(&*self.sink, NAME, "write", result.map(|()| complete), false)
    }

    async fn delete(&self, key: &str) -> bool {
        let key = key.to_string();
        let result = self.modify(move |state| {
            state.delete(&key);
        });
        settle(&*self.sink, NAME, "delete", result.await.map(|()| true), false)
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        let result = match scope {
            ClearScope::All => self.modify(|state| state.clear(ClearScope::All)).await,
            ClearScope::Tags(tags) => {
                let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
                self.modify(move |state| {
                    state.tags.remove(&tags);
                })
                .await
            }
        };
        settle(&*self.sink, NAME, "clear", result, ());
    }

    async fn garbage_collection(&self) {
        let fresh = self.fresh.clone();
        let result = self
            .modify(move |state| state.collect_garbage(&fresh))
            .await
            .map(|removed| debug!("✓ Compact GC removed {} entries", removed));
        settle(&*self.sink, NAME, "garbage_collection", result, ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileLayout;
    use crate::timestamp::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> FileConfig {
        FileConfig::new(dir.path().join("storage.bin"), FileLayout::Compact)
    }

    #[tokio::test]
    async fn test_round_trip_in_every_metadata_format() {
        for format in [Format::Native, Format::Json, Format::Yaml, Format::Xml] {
            let dir = tempfile::tempdir().expect("tempdir");
            let driver =
                CompactFileDriver::new(config(&dir).with_format(format)).expect("driver");
            let value = json!({"n": 1, "s": "two", "l": [3.5]});
            assert!(driver.write("k", value.clone(), &["t"]).await, "{}", format);
            assert_eq!(driver.read("k").await, Some(value), "{}", format);
        }
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        CompactFileDriver::new(config(&dir))
            .expect("driver")
            .write("k", json!("v"), &["t"])
            .await;
        let reopened = CompactFileDriver::new(config(&dir)).expect("driver");
        assert_eq!(reopened.read("k").await, Some(json!("v")));
        assert!(reopened.capabilities().non_volatile);
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config(&dir).with_format(Format::Json);
        std::fs::write(&cfg.path, b"{ not json").expect("write");
        let driver = CompactFileDriver::new(cfg).expect("driver");
        assert_eq!(driver.read("k").await, None);
        assert!(driver.read_all().await.is_empty());
        assert!(driver.write("k", json!(1), &[]).await);
        assert_eq!(driver.read("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_clear_all_keeps_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CompactFileDriver::new(config(&dir).with_format(Format::Json)).expect("driver");
        driver.write("a", json!(1), &["t"]).await;
        driver.clear(ClearScope::All).await;
        assert!(driver.path().exists());
        let text = std::fs::read_to_string(driver.path()).expect("read");
        assert_eq!(text, r#"{"keys":{},"tags":{}}"#);
    }

    #[tokio::test]
    async fn test_read_all_prunes_stale_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        let driver = CompactFileDriver::with_clock(
            config(&dir).with_ttl(Some(Duration::from_secs(10))),
            clock.clone(),
        )
        .expect("driver");
        driver.write("old", json!(1), &[]).await;
        clock.advance(Duration::from_secs(11));
        driver.write("new", json!(2), &[]).await;

        let all = driver.read_all().await;
        assert_eq!(all.len(), 1);
        let state = driver.load().await.expect("load");
        assert_eq!(state.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_raw_ini_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = FileConfig::new(dir.path().join("storage.ini"), FileLayout::Compact)
            .with_format(Format::Ini)
            .with_mode(EntryMode::Raw);
        let driver = CompactFileDriver::new(cfg).expect("driver");
        assert!(!driver.capabilities().multi_value);
        assert!(driver.write("greeting", json!("hello"), &[]).await);
        assert!(!driver.write("tagged", json!("x"), &["t"]).await);
        assert!(!driver.write("nested", json!({"a": 1}), &[]).await);

        let text = std::fs::read_to_string(driver.path()).expect("read");
        assert_eq!(text, "[keys]\ngreeting = \"hello\"\n[tags]\n");
        assert_eq!(driver.read("greeting").await, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_raw_document_age_follows_clock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        let cfg = FileConfig::new(dir.path().join("storage.json"), FileLayout::Compact)
            .with_format(Format::Json)
            .with_mode(EntryMode::Raw)
            .with_ttl(Some(Duration::from_secs(60)));
        let driver = CompactFileDriver::with_clock(cfg, clock.clone()).expect("driver");
        assert!(driver.write("greeting", json!("hello"), &[]).await);

        clock.advance(Duration::from_secs(30));
        assert_eq!(driver.read("greeting").await, Some(json!("hello")));

        clock.advance(Duration::from_secs(31));
        assert!(!driver.exist("greeting").await);
        assert_eq!(driver.read("greeting").await, None);
    }

    #[tokio::test]
    async fn test_unlocked_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CompactFileDriver::new(config(&dir).with_lock(false)).expect("driver");
        assert!(driver.write("a", json!(1), &[]).await);
        assert!(driver.delete("a").await);
        assert!(driver.delete("a").await);
        assert_eq!(driver.read("a").await, None);
    }
}
