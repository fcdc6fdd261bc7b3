//! Recognized driver options.
//!
//! The component that assembles drivers hands over a plain options map
//! (usually read from its own configuration files). [`Options`] is that map
//! with the recognized keys typed; each driver's config type picks the
//! options it understands through a `from_options` constructor and ignores
//! the rest.
//!
//! # Example
//!
//! ```
//! use tagkv::config::Options;
//!
//! let options = Options::from_json(r#"{"Path": "/tmp/cache", "Expire": 60, "UseMeta": true}"#).unwrap();
//! assert_eq!(options.ttl(), Some(std::time::Duration::from_secs(60)));
//! assert_eq!(options.save_meta_data, Some(true));
//! ```

use crate::entry::EntryMode;
use crate::error::{Error, Result};
use crate::serialization::Format;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding remote connection pool sizes.
pub const POOL_SIZE_ENV: &str = "TAGKV_POOL_SIZE";

/// Physical layout of the file drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
pub enum FileLayout {
    /// One file holds the whole keyspace and tag registry.
    #[default]
    Compact,
    /// One file per key plus one file per tag.
    Distributed,
}

/// Options map with every recognized key.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Options {
    /// TTL in seconds; absent or `0` means no expiry.
    pub expire: Option<u64>,
    /// Logical partition inside shared physical storage.
    pub group: Option<String>,
    pub path: Option<PathBuf>,
    pub table: Option<String>,
    pub tag_table: Option<String>,
    pub mode: Option<FileLayout>,
    /// Directory sharding depth, 0 to 3.
    pub spread: Option<u8>,
    pub hash_file_name: Option<bool>,
    #[serde(alias = "UseMeta")]
    pub save_meta_data: Option<bool>,
    pub lock_file: Option<bool>,
    pub format: Option<String>,
    pub prefix: Option<String>,
    pub servers: Option<Vec<String>>,
    pub pool_size: Option<u32>,
    pub max_cas_attempts: Option<u32>,
}

impl Options {
    /// Build from a string-keyed map of JSON values.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when a recognized option has the wrong type.
    pub fn from_map(map: BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let object: serde_json::Map<String, serde_json::Value> = map.into_iter().collect();
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| Error::ConfigError(format!("invalid options: {}", e)))
    }

    /// Build from a JSON object literal.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` on malformed JSON or mistyped options.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ConfigError(format!("invalid options: {}", e)))
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.expire.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Entry shape requested by `SaveMetaData`/`UseMeta` (metadata by default).
    pub fn entry_mode(&self) -> EntryMode {
        match self.save_meta_data {
            Some(false) => EntryMode::Raw,
            _ => EntryMode::Metadata,
        }
    }

    /// Requested wire format, native if unset.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for unknown format names.
    pub fn format(&self) -> Result<Format> {
        match &self.format {
            Some(name) => name.parse(),
            None => Ok(Format::default()),
        }
    }

    /// Mandatory option lookup with a configuration error on absence.
    pub fn require<'a, T>(value: &'a Option<T>, name: &str) -> Result<&'a T> {
        value
            .as_ref()
            .ok_or_else(|| Error::ConfigError(format!("missing mandatory option {}", name)))
    }
}

/// Pool size from the environment, then the options, then `fallback`.
pub fn pool_size(options: &Options, fallback: u32) -> u32 {
    std::env::var(POOL_SIZE_ENV)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .or(options.pool_size)
        .unwrap_or(fallback)
}
