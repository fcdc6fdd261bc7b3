//! Error types for storage drivers.
//!
//! Errors never cross the [`Driver`](crate::backend::Driver) surface: each
//! public operation turns a failure into its sentinel (`None`, `false`, empty
//! map) and hands the error to the configured
//! [`ErrorSink`](crate::observability::ErrorSink).

use std::io;

/// Errors raised inside the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A mandatory option is missing or an option value is unusable.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Key contains forbidden characters or exceeds the length bound.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Tag name contains forbidden characters or exceeds the length bound.
    #[error("invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: &'static str },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Stored bytes do not carry the expected envelope.
    #[error("invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    #[error("envelope version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The operation or value shape is not supported by this driver.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    BackendError(String),

    /// The driver could not reach its backend at construction time.
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    /// Optimistic registry update lost every race it entered.
    #[error("tag registry update gave up after {attempts} attempts")]
    CasExhausted { attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        Self::BackendError(e.to_string())
    }

    pub fn serialization(e: impl std::fmt::Display) -> Self {
        Self::SerializationError(e.to_string())
    }

    pub fn deserialization(e: impl std::fmt::Display) -> Self {
        Self::DeserializationError(e.to_string())
    }

    /// True for errors that describe unreadable stored data.
    ///
    /// Drivers treat these as "empty storage" rather than failures.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::DeserializationError(_)
                | Error::InvalidCacheEntry(_)
                | Error::VersionMismatch { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(Error::deserialization("bad").is_corruption());
        assert!(Error::InvalidCacheEntry("magic".into()).is_corruption());
        assert!(Error::VersionMismatch {
            expected: 1,
            found: 2
        }
        .is_corruption());
        assert!(!Error::backend("refused").is_corruption());
        assert!(!Error::CasExhausted { attempts: 3 }.is_corruption());
    }

    #[test]
    fn test_display() {
        let err = Error::InvalidKey {
            key: "a/b".into(),
            reason: "forbidden character",
        };
        assert_eq!(
            err.to_string(),
            "invalid key \"a/b\": forbidden character"
        );
    }
}
