//! Entry codecs.
//!
//! Every format goes through a `serde_json::Value` tree: callers serialize
//! their structure into a tree, the [`Format`] turns the tree into bytes and
//! back. This keeps one serde model for all drivers while letting each
//! format decide how far it can represent that model (INI is two levels
//! deep at most, XML and INI are written by hand since they carry type
//! information in attributes or quoting).
//!
//! # Native envelope
//!
//! ```text
//! [MAGIC: 4 bytes "TGKV"] [VERSION: u32 LE] [POSTCARD PAYLOAD]
//! ```
//!
//! The magic header lets a driver tell "someone else's bytes" from a
//! corrupted entry, and the version is bumped whenever the payload layout
//! changes so old files read as empty instead of as garbage.

mod ini;
mod xml;

use crate::entry::Value;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Magic header of the native envelope.
pub const MAGIC: [u8; 4] = *b"TGKV";

/// Layout version of the native payload.
pub const VERSION: u32 = 1;

/// Wire format of stored documents and entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Format {
    /// Versioned postcard envelope.
    #[default]
    Native,
    Json,
    Yaml,
    Xml,
    /// Flat `key = value` sections; no nesting below a section.
    Ini,
}

impl Format {
    /// File extension used by the file drivers.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Native => "bin",
            Format::Json => "json",
            Format::Yaml => "yaml",
            Format::Xml => "xml",
            Format::Ini => "ini",
        }
    }

    /// Whether the format can hold `{created, tags, data}` entries.
    pub fn supports_metadata(&self) -> bool {
        !matches!(self, Format::Ini)
    }

    pub fn encode_tree(&self, tree: &Value) -> Result<Vec<u8>> {
        match self {
            Format::Native => native_encode(tree),
            Format::Json => serde_json::to_vec(tree).map_err(Error::serialization),
            Format::Yaml => serde_yaml::to_string(tree)
                .map(String::into_bytes)
                .map_err(Error::serialization),
            Format::Xml => Ok(xml::encode(tree).into_bytes()),
            Format::Ini => ini::encode(tree).map(String::into_bytes),
        }
    }

    pub fn decode_tree(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            Format::Native => native_decode(bytes),
            Format::Json => serde_json::from_slice(bytes).map_err(Error::deserialization),
            Format::Yaml => serde_yaml::from_slice(bytes).map_err(Error::deserialization),
            Format::Xml => xml::decode(text(bytes)?),
            Format::Ini => ini::decode(text(bytes)?),
        }
    }

    /// Serialize any serde structure through the tree model.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let tree = serde_json::to_value(value).map_err(Error::serialization)?;
        self.encode_tree(&tree)
    }

    /// Deserialize bytes produced by [`encode`](Self::encode).
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let tree = self.decode_tree(bytes)?;
        serde_json::from_value(tree).map_err(Error::deserialization)
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "postcard" | "bin" => Ok(Format::Native),
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            "xml" => Ok(Format::Xml),
            "ini" => Ok(Format::Ini),
            other => Err(Error::ConfigError(format!("unknown format: {}", other))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Native => "native",
            Format::Json => "json",
            Format::Yaml => "yaml",
            Format::Xml => "xml",
            Format::Ini => "ini",
        };
        f.write_str(name)
    }
}

fn text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(Error::deserialization)
}

// Postcard is not self-describing, so the tree is mirrored into a tagged enum.
#[derive(Serialize, Deserialize)]
enum NativeValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<NativeValue>),
    Map(Vec<(String, NativeValue)>),
}

impl From<&Value> for NativeValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => NativeValue::Null,
            Value::Bool(b) => NativeValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    NativeValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    NativeValue::UInt(u)
                } else {
                    NativeValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => NativeValue::Str(s.clone()),
            Value::Array(items) => NativeValue::List(items.iter().map(Into::into).collect()),
            Value::Object(map) => {
                NativeValue::Map(map.iter().map(|(k, v)| (k.clone(), v.into())).collect())
            }
        }
    }
}

impl From<NativeValue> for Value {
    fn from(value: NativeValue) -> Self {
        match value {
            NativeValue::Null => Value::Null,
            NativeValue::Bool(b) => Value::Bool(b),
            NativeValue::Int(i) => Value::from(i),
            NativeValue::UInt(u) => Value::from(u),
            NativeValue::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            NativeValue::Str(s) => Value::String(s),
            NativeValue::List(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            NativeValue::Map(pairs) => Value::Object(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

fn native_encode(tree: &Value) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(&NativeValue::from(tree)).map_err(Error::serialization)?;
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn native_decode(bytes: &[u8]) -> Result<Value> {
    if bytes.len() < 8 {
        return Err(Error::InvalidCacheEntry(format!(
            "envelope too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::InvalidCacheEntry("bad magic header".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let found = u32::from_le_bytes(version);
    if found != VERSION {
        return Err(Error::VersionMismatch {
            expected: VERSION,
            found,
        });
    }
    let native: NativeValue = postcard::from_bytes(&bytes[8..]).map_err(Error::deserialization)?;
    Ok(native.into())
}
