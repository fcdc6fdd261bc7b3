//! Error reporting and per-driver counters.
//!
//! Drivers never return errors to their callers; they report them here and
//! degrade to the "absent"/`false` sentinel. The sink is handed to each
//! driver explicitly when it is built.

use crate::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives non-fatal operational errors.
pub trait ErrorSink: Send + Sync {
    /// Report a failed or degraded operation.
    fn report(&self, driver: &'static str, operation: &'static str, error: &Error);
}

/// Default sink: logs through the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, driver: &'static str, operation: &'static str, error: &Error) {
        warn!("⚠ {} {} failed: {}", driver, operation, error);
    }
}

/// Sink that drops every report.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpSink;

impl ErrorSink for NoOpSink {
    fn report(&self, _driver: &'static str, _operation: &'static str, _error: &Error) {}
}

/// Shared handle used by drivers.
pub type SharedSink = Arc<dyn ErrorSink>;

pub fn default_sink() -> SharedSink {
    Arc::new(LogSink)
}

/// Running counters for one driver instance.
#[derive(Debug, Default)]
pub struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    stale_evictions: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub stale_evictions: u64,
}

impl Stats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writes(&self, count: usize) {
        self.writes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<String>>);

    impl ErrorSink for Collecting {
        fn report(&self, driver: &'static str, operation: &'static str, error: &Error) {
            self.0.lock().push(format!("{}:{}:{}", driver, operation, error));
        }
    }

    #[test]
    fn test_custom_sink_receives_reports() {
        let sink = Collecting::default();
        sink.report("memory", "write", &Error::Unsupported("x".into()));
        assert_eq!(sink.0.lock().as_slice(), ["memory:write:unsupported: x"]);
        NoOpSink.report("memory", "write", &Error::Unsupported("x".into()));
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = Stats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_writes(3);
        stats.record_write_failure();
        stats.record_stale();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                hits: 2,
                misses: 1,
                writes: 3,
                write_failures: 1,
                stale_evictions: 1,
            }
        );
    }
}
