//! Stored entry shapes and the validity rule shared by every driver.
//!
//! An entry is valid when it is younger than the configured TTL and every tag
//! it carries still has a registry row that is not newer than the entry.
//! Invalid entries are only detected when read; nothing fans out deletes
//! when a tag is cleared.

use crate::timestamp::{Clock, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Opaque payload stored under a key.
pub type Value = serde_json::Value;

/// Physical shape of stored entries, fixed when a driver is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntryMode {
    /// Bare value, no timestamp or tags. Tags are unavailable in this mode.
    Raw,
    /// Value together with its write timestamp and tags.
    #[default]
    Metadata,
}

/// Value plus the metadata needed to validate it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub created: Timestamp,
    #[serde(default)]
    pub tags: Vec<String>,
    pub data: Value,
}

impl MetaEntry {
    pub fn new(created: Timestamp, tags: Vec<String>, data: Value) -> Self {
        MetaEntry {
            created,
            tags,
            data,
        }
    }
}

/// Remove duplicate tags, keeping first-seen order.
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tags.iter()
        .map(AsRef::as_ref)
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

/// Backend-local map of tag name to the timestamp its row was created at.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagRegistry(BTreeMap<String, Timestamp>);

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create rows for tags that have none. Existing rows keep their timestamp.
    ///
    /// Returns true if any row was created.
    pub fn register<S: AsRef<str>>(&mut self, tags: &[S], at: &Timestamp) -> bool {
        let mut changed = false;
        for tag in tags {
            if !self.0.contains_key(tag.as_ref()) {
                self.0.insert(tag.as_ref().to_string(), at.clone());
                changed = true;
            }
        }
        changed
    }

    /// Delete rows, making every entry that references them invalid.
    pub fn remove<S: AsRef<str>>(&mut self, tags: &[S]) -> bool {
        let mut changed = false;
        for tag in tags {
            changed |= self.0.remove(tag.as_ref()).is_some();
        }
        changed
    }

    pub fn get(&self, tag: &str) -> Option<&Timestamp> {
        self.0.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// True if every tag of `entry` has a row no newer than the entry.
    pub fn validates(&self, entry: &MetaEntry) -> bool {
        tags_valid(&entry.tags, &entry.created, |tag| self.0.get(tag).cloned())
    }

    /// Drop rows that no entry in `live` references.
    pub fn retain_referenced<'a>(&mut self, live: impl IntoIterator<Item = &'a MetaEntry>) {
        let referenced: BTreeSet<&str> = live
            .into_iter()
            .flat_map(|e| e.tags.iter().map(String::as_str))
            .collect();
        self.0.retain(|tag, _| referenced.contains(tag.as_str()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Timestamp)> {
        self.0.iter()
    }
}

/// Tag half of the validity rule, with the registry lookup supplied by the caller.
///
/// A missing row invalidates the entry, as does a row newer than `created`.
pub fn tags_valid<F>(tags: &[String], created: &Timestamp, mut lookup: F) -> bool
where
    F: FnMut(&str) -> Option<Timestamp>,
{
    tags.iter().all(|tag| match lookup(tag) {
        Some(row) => row <= *created,
        None => false,
    })
}

/// TTL half of the validity rule.
#[derive(Clone)]
pub struct Freshness {
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl Freshness {
    pub fn new(ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Freshness { ttl, clock }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn now_micros(&self) -> u64 {
        self.clock.now_micros()
    }

    /// True if an entry written at `created` has not outlived the TTL.
    ///
    /// Unparseable timestamps count as expired.
    pub fn is_fresh(&self, created: &Timestamp) -> bool {
        match self.ttl {
            None => created.to_micros().is_some(),
            Some(ttl) => match created.age(self.clock.now_micros()) {
                Some(age) => age <= ttl,
                None => false,
            },
        }
    }

    /// Same as [`is_fresh`](Self::is_fresh) for an age measured elsewhere
    /// (file modification times in raw mode).
    pub fn is_fresh_age(&self, age: Duration) -> bool {
        self.ttl.map_or(true, |ttl| age <= ttl)
    }

    /// Oldest timestamp that is still fresh, if a TTL is configured.
    pub fn cutoff(&self) -> Option<Timestamp> {
        self.ttl.map(|ttl| {
            Timestamp::from_micros(
                self.clock
                    .now_micros()
                    .saturating_sub(ttl.as_micros() as u64),
            )
        })
    }
}

impl std::fmt::Debug for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Freshness").field("ttl", &self.ttl).finish()
    }
}
