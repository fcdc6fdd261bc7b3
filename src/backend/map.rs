//! Keyspace plus tag registry held as two maps.
//!
//! This is the reference form of the invalidation algorithm. The in-process
//! driver keeps one [`MapState`] behind a mutex, the session driver keeps
//! one inside a session section and the compact file driver loads and saves
//! one per operation.

use super::{Batch, ClearScope};
use crate::entry::{Freshness, MetaEntry, TagRegistry, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of looking a key up against the validity rule.
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    Hit(&'a MetaEntry),
    Miss,
    /// The entry existed but failed validation and has been removed.
    Stale,
}

/// `{tags, keys}` document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapState {
    #[serde(default)]
    pub tags: TagRegistry,
    #[serde(default, rename = "keys")]
    pub entries: BTreeMap<String, MetaEntry>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self, entry: &MetaEntry, fresh: &Freshness) -> bool {
        fresh.is_fresh(&entry.created) && self.tags.validates(entry)
    }

    /// Look `key` up, dropping the entry if it is no longer valid.
    pub fn lookup(&mut self, key: &str, fresh: &Freshness) -> Lookup<'_> {
        let valid = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => self.is_valid(entry, fresh),
        };
        if !valid {
            self.entries.remove(key);
            return Lookup::Stale;
        }
        match self.entries.get(key) {
            Some(entry) => Lookup::Hit(entry),
            None => Lookup::Miss,
        }
    }

    /// Look `key` up without mutating anything.
    pub fn peek(&self, key: &str, fresh: &Freshness) -> Option<&MetaEntry> {
        self.entries
            .get(key)
            .filter(|entry| self.is_valid(entry, fresh))
    }

    /// All valid values; invalid entries are pruned on the way.
    pub fn read_all(&mut self, fresh: &Freshness) -> BTreeMap<String, Value> {
        self.prune(fresh);
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.data.clone()))
            .collect()
    }

    /// Apply a validated batch. Registry rows go in before the entries.
    pub fn apply(&mut self, batch: Batch, overwrite: bool) {
        if overwrite {
            self.entries.clear();
            self.tags.clear();
        }
        self.tags.register(&batch.tags, &batch.created);
        for (key, value) in batch.entries {
            let entry = MetaEntry::new(batch.created.clone(), batch.tags.clone(), value);
            self.entries.insert(key, entry);
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self, scope: ClearScope<'_>) {
        match scope {
            ClearScope::All => {
                self.entries.clear();
                self.tags.clear();
            }
            ClearScope::Tags(tags) => {
                self.tags.remove(tags);
            }
        }
    }

    /// Drop invalid entries, returning how many were removed.
    pub fn prune(&mut self, fresh: &Freshness) -> usize {
        let before = self.entries.len();
        let tags = &self.tags;
        self.entries
            .retain(|_, entry| fresh.is_fresh(&entry.created) && tags.validates(entry));
        before - self.entries.len()
    }

    /// Prune entries, then registry rows no surviving entry references.
    pub fn collect_garbage(&mut self, fresh: &Freshness) -> usize {
        let removed = self.prune(fresh);
        self.tags.retain_referenced(self.entries.values());
        removed
    }
}
