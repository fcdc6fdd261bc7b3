//! Session-scoped driver.
//!
//! Same algorithm as [`MemoryDriver`](super::MemoryDriver), but the two maps
//! live in a named section of a [`Session`] owned by whoever manages the
//! request lifecycle. Several drivers can share one session under different
//! section names.

use super::map::{Lookup, MapState};
use super::{settle, BatchRules, Capabilities, ClearScope, Driver};
use crate::config::Options;
use crate::entry::{EntryMode, Freshness, Value};
use crate::key::KEY_MAX_DEFAULT;
use crate::observability::{default_sink, SharedSink, Stats, StatsSnapshot};
use crate::timestamp::{Clock, SystemClock};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "session";

/// Default section name when no `Group` option is given.
pub const DEFAULT_SECTION: &str = "tagkv";

#[derive(Default)]
struct SessionData {
    started: bool,
    sections: HashMap<String, MapState>,
}

/// Request-spanning key/value context.
///
/// Owned by the session layer of the host application; cloning yields
/// another handle to the same session.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<SessionData>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the session. Starting twice is harmless.
    pub fn start(&self) {
        self.inner.lock().started = true;
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// End the session and drop every section.
    pub fn destroy(&self) {
        let mut data = self.inner.lock();
        data.started = false;
        data.sections.clear();
    }

    pub fn section_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().sections.keys().cloned().collect();
        names.sort();
        names
    }

    fn with_section<R>(&self, name: &str, f: impl FnOnce(&mut MapState) -> R) -> R {
        let mut data = self.inner.lock();
        if !data.started {
            info!("Session not started before first storage access, starting it");
            data.started = true;
        }
        let section = data.sections.entry(name.to_string()).or_default();
        f(section)
    }
}

/// Driver storing its maps in a [`Session`] section.
#[derive(Clone)]
pub struct SessionDriver {
    session: Session,
    section: String,
    fresh: Freshness,
    sink: SharedSink,
    stats: Arc<Stats>,
}

impl SessionDriver {
    pub fn new(session: Session, section: impl Into<String>) -> Self {
        Self::with_clock(session, section, None, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        session: Session,
        section: impl Into<String>,
        ttl: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SessionDriver {
            session,
            section: section.into(),
            fresh: Freshness::new(ttl, clock),
            sink: default_sink(),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Build from the recognized options (`Expire`, `Group` as section name).
    pub fn from_options(session: Session, options: &Options) -> Self {
        let section = options
            .group
            .clone()
            .unwrap_or_else(|| DEFAULT_SECTION.to_string());
        Self::with_clock(session, section, options.ttl(), Arc::new(SystemClock::new()))
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Driver for SessionDriver {
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
        self.session
            .with_section(&self.section, |state| state.peek(key, &self.fresh).is_some())
    }

    async fn read(&self, key: &str) -> Option<Value> {
        self.session
            .with_section(&self.section, |state| match state.lookup(key, &self.fresh) {
                Lookup::Hit(entry) => {
                    self.stats.record_hit();
                    Some(entry.data.clone())
                }
                Lookup::Stale => {
                    debug!("Session GET {} -> invalidated", key);
                    self.stats.record_stale();
                    self.stats.record_miss();
                    None
                }
                Lookup::Miss => {
                    self.stats.record_miss();
                    None
                }
            })
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        self.session
            .with_section(&self.section, |state| state.read_all(&self.fresh))
    }

    async fn write_all(
        &self,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        overwrite: bool,
    ) -> bool {
        let rules = BatchRules {
            key_max: KEY_MAX_DEFAULT,
            mode: EntryMode::Metadata,
            multi_value: true,
        };
        match rules.prepare(NAME, &*self.sink, values, tags, self.fresh.now()) {
            Ok(batch) => {
                let complete = batch.is_complete();
                let written = batch.entries.len();
                self.session
                    .with_section(&self.section, |state| state.apply(batch, overwrite));
                self.stats.record_writes(written);
                complete
            }
            Err(e) => {
                self.stats.record_write_failure();
                settle(&*self.sink, NAME, "write", Err(e), false)
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        self.session
            .with_section(&self.section, |state| state.delete(key));
        true
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        self.session
            .with_section(&self.section, |state| state.clear(scope));
    }

    async fn garbage_collection(&self) {
        self.session
            .with_section(&self.section, |state| state.collect_garbage(&self.fresh));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_access_starts_session() {
        let session = Session::new();
        assert!(!session.is_started());
        let driver = SessionDriver::new(session.clone(), "cache");
        assert!(!driver.exist("k").await);
        assert!(session.is_started());
        assert_eq!(session.section_names(), vec!["cache"]);
    }

    #[tokio::test]
    async fn test_stats() {
        let driver = SessionDriver::new(Session::new(), "cache");
        driver.write("a", json!(1), &["t"]).await;
        driver.read("a").await;
        driver.read("missing").await;
        driver.clear(ClearScope::Tags(&["t"])).await;
        driver.read("a").await;

        let stats = driver.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.stale_evictions, 1);
    }

    #[tokio::test]
    async fn test_state_survives_driver_instances() {
        let session = Session::new();
        session.start();
        SessionDriver::new(session.clone(), "cache")
            .write("k", json!([1, 2]), &["t"])
            .await;

        let later = SessionDriver::new(session.clone(), "cache");
        assert_eq!(later.read("k").await, Some(json!([1, 2])));

        let other_section = SessionDriver::new(session, "other");
        assert_eq!(other_section.read("k").await, None);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let driver = SessionDriver::new(Session::new(), "cache");
        driver.write("a", json!(1), &["T1"]).await;
        driver.write("b", json!(2), &["T2"]).await;
        driver.clear(ClearScope::Tags(&["T1"])).await;
        assert_eq!(driver.read("a").await, None);
        assert_eq!(driver.read("b").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_destroy_drops_sections() {
        let session = Session::new();
        let driver = SessionDriver::new(session.clone(), "cache");
        driver.write("a", json!(1), &[]).await;
        session.destroy();
        assert!(driver.read_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_option_names_section() {
        let options = Options::from_json(r#"{"Group": "forms"}"#).expect("options");
        let driver = SessionDriver::from_options(Session::new(), &options);
        assert_eq!(driver.section(), "forms");
    }
}
