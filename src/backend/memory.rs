//! In-process driver.

use super::map::{Lookup, MapState};
use super::{settle, BatchRules, Capabilities, ClearScope, Driver};
use crate::config::Options;
use crate::entry::{EntryMode, Freshness, Value};
use crate::key::KEY_MAX_DEFAULT;
use crate::observability::{default_sink, SharedSink, Stats, StatsSnapshot};
use crate::timestamp::{Clock, SystemClock};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "memory";

/// Volatile driver holding the keyspace and tag registry in process memory.
///
/// Cloning shares the underlying maps.
///
/// # Example
///
/// ```
/// # use tagkv::backend::{Driver, MemoryDriver, ClearScope};
/// # use serde_json::json;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let driver = MemoryDriver::new();
/// driver.write("user_1", json!({"name": "Ada"}), &["users"]).await;
/// assert!(driver.exist("user_1").await);
///
/// driver.clear(ClearScope::Tags(&["users"])).await;
/// assert_eq!(driver.read("user_1").await, None);
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<MapState>>,
    fresh: Freshness,
    sink: SharedSink,
    stats: Arc<Stats>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_ttl(None)
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        MemoryDriver {
            state: Arc::new(Mutex::new(MapState::new())),
            fresh: Freshness::new(ttl, clock),
            sink: default_sink(),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Build from the recognized options (`Expire`).
    pub fn from_options(options: &Options) -> Self {
        Self::with_ttl(options.ttl())
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of physically stored entries, valid or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tag registry rows.
    pub fn tag_count(&self) -> usize {
        self.state.lock().tags.len()
    }

    fn rules() -> BatchRules {
        BatchRules {
            key_max: KEY_MAX_DEFAULT,
            mode: EntryMode::Metadata,
            multi_value: true,
        }
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multi_value: true,
            non_volatile: false,
            enumerable: true,
        }
    }

    async fn exist(&self, key: &str) -> bool {
        self.state.lock().peek(key, &self.fresh).is_some()
    }

    async fn read(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock();
        match state.lookup(key, &self.fresh) {
            Lookup::Hit(entry) => {
                debug!("✓ Memory GET {} -> HIT", key);
                self.stats.record_hit();
                Some(entry.data.clone())
            }
            Lookup::Stale => {
                debug!("✓ Memory GET {} -> STALE", key);
                self.stats.record_stale();
                self.stats.record_miss();
                None
            }
            Lookup::Miss => {
                debug!("✓ Memory GET {} -> MISS", key);
                self.stats.record_miss();
                None
            }
        }
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        self.state.lock().read_all(&self.fresh)
    }

    async fn write_all(
        &self,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        overwrite: bool,
    ) -> bool {
        let batch = Self::rules().prepare(NAME, &*self.sink, values, tags, self.fresh.now());
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_write_failure();
                return settle(&*self.sink, NAME, "write", Err(e), false);
            }
        };
        let complete = batch.is_complete();
        self.stats.record_writes(batch.entries.len());
        debug!(
            "✓ Memory SET {} keys (tags: {:?}, overwrite: {})",
            batch.entries.len(),
            batch.tags,
            overwrite
        );
        self.state.lock().apply(batch, overwrite);
        complete
    }

    async fn delete(&self, key: &str) -> bool {
        self.state.lock().delete(key);
        debug!("✓ Memory DELETE {}", key);
        true
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        self.state.lock().clear(scope);
        debug!("✓ Memory CLEAR {:?}", scope);
    }

    async fn garbage_collection(&self) {
        let removed = self.state.lock().collect_garbage(&self.fresh);
        debug!("✓ Memory GC removed {} entries", removed);
    }
}
