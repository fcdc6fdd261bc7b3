//! Write timestamps and clocks.
//!
//! Several backends compare timestamps as plain strings (database columns,
//! tag files, serialized registries), so a [`Timestamp`] is always rendered
//! as `SSSSSSSSSS.uuuuuu`: ten zero-padded second digits, a dot and exactly
//! six microsecond digits. Lexicographic order of that text is
//! chronological order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS: u64 = 1_000_000;

/// Fixed-width write timestamp.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Build from microseconds since the Unix epoch.
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(format!("{:010}.{:06}", micros / MICROS, micros % MICROS))
    }

    /// Parse the fixed-width form back into microseconds.
    ///
    /// Returns `None` for text that is not in the fixed-width form.
    pub fn to_micros(&self) -> Option<u64> {
        let (secs, frac) = self.0.split_once('.')?;
        if secs.len() != 10 || frac.len() != 6 {
            return None;
        }
        let secs: u64 = secs.parse().ok()?;
        let frac: u64 = frac.parse().ok()?;
        Some(secs * MICROS + frac)
    }

    /// Accept stored text only when it is in the fixed-width form.
    pub fn parse(text: &str) -> Option<Self> {
        let ts = Timestamp(text.trim().to_string());
        ts.to_micros().map(|_| ts)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Age relative to `now_micros`; zero if the timestamp is in the future.
    pub fn age(&self, now_micros: u64) -> Option<Duration> {
        self.to_micros()
            .map(|created| Duration::from_micros(now_micros.saturating_sub(created)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of "now" for drivers.
///
/// Passed explicitly to every driver so tests can inject time.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;

    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.now_micros())
    }
}

/// Wall clock that never goes backwards for a given instance.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        ManualClock {
            micros: AtomicU64::new(start_micros),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::Acquire)
    }
}
