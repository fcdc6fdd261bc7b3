//! Key and tag name validation.
//!
//! Keys may end up as file names, so the accepted alphabet is deliberately
//! small: ASCII letters, digits and `_ . - @ + ~ =`. A leading `.` is refused
//! so a key can never name `.`/`..` or a hidden file.

use crate::error::{Error, Result};

/// Length bound for keys of file-backed drivers.
pub const KEY_MAX_FILE: usize = 63;

/// Length bound for keys of every other driver.
pub const KEY_MAX_DEFAULT: usize = 250;

/// Length bound for tag names (tags become file names in the distributed layout).
pub const TAG_MAX: usize = 63;

/// Wildcard accepted by [`ClearScope::parse`](crate::backend::ClearScope::parse).
pub const WILDCARD: &str = "*";

fn allowed(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'@' | b'+' | b'~' | b'=')
}

fn check(name: &str, max_len: usize) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty");
    }
    if name.len() > max_len {
        return Err("too long");
    }
    if name.starts_with('.') {
        return Err("leading dot");
    }
    if !name.bytes().all(allowed) {
        return Err("forbidden character");
    }
    Ok(())
}

/// Validate a storage key against the shared alphabet and `max_len`.
///
/// # Errors
/// Returns `Error::InvalidKey` naming the first rule the key breaks.
pub fn validate_key(key: &str, max_len: usize) -> Result<()> {
    check(key, max_len).map_err(|reason| Error::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

/// Validate a tag name.
///
/// # Errors
/// Returns `Error::InvalidTag` naming the first rule the tag breaks.
pub fn validate_tag(tag: &str) -> Result<()> {
    check(tag, TAG_MAX).map_err(|reason| Error::InvalidTag {
        tag: tag.to_string(),
        reason,
    })
}

/// Validate every tag of a batch; the first offender fails the batch.
pub fn validate_tags<S: AsRef<str>>(tags: &[S]) -> Result<()> {
    tags.iter().try_for_each(|t| validate_tag(t.as_ref()))
}

/// Longest namespace prefix accepted by remote backends.
pub const PREFIX_MAX: usize = KEY_MAX_DEFAULT / 2;

/// Validate a remote namespace prefix.
///
/// A prefix follows the key rules but may not be empty or contain `.`, the
/// namespace separator, so no prefix can reach into another's keys.
///
/// # Errors
/// Returns `Error::ConfigError` naming the broken rule.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let reason = match check(prefix, PREFIX_MAX) {
        Err(reason) => reason,
        Ok(()) if prefix.contains('.') => "contains the separator '.'",
        Ok(()) => return Ok(()),
    };
    Err(Error::ConfigError(format!(
        "unusable Prefix {:?}: {}",
        prefix, reason
    )))
}

/// Namespaced key used by remote backends: `prefix.key`.
pub fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Reserved key holding the serialized tag registry: `prefix_TAG-REGISTRY`.
pub fn registry_key(prefix: &str) -> String {
    format!("{}_TAG-REGISTRY", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepts_plain_keys() {
        assert!(validate_key("user_42", KEY_MAX_FILE).is_ok());
        assert!(validate_key("a.b-c@d+e~f=g", KEY_MAX_FILE).is_ok());
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(validate_key("", KEY_MAX_FILE).is_err());
        assert!(validate_key("a/b", KEY_MAX_FILE).is_err());
        assert!(validate_key("a\nb", KEY_MAX_FILE).is_err());
        assert!(validate_key("tab\there", KEY_MAX_FILE).is_err());
        assert!(validate_key("..", KEY_MAX_FILE).is_err());
        assert!(validate_key(".hidden", KEY_MAX_FILE).is_err());
        assert!(validate_key("sp ace", KEY_MAX_FILE).is_err());
        assert!(validate_key("ключ", KEY_MAX_DEFAULT).is_err());
    }

    #[test]
    fn test_length_bound() {
        let at_bound = "k".repeat(KEY_MAX_FILE);
        let over = "k".repeat(KEY_MAX_FILE + 1);
        assert!(validate_key(&at_bound, KEY_MAX_FILE).is_ok());
        assert!(validate_key(&over, KEY_MAX_FILE).is_err());
        assert!(validate_key(&over, KEY_MAX_DEFAULT).is_ok());
    }

    #[test]
    fn test_tags() {
        assert!(validate_tags(&["users", "posts"]).is_ok());
        assert!(validate_tags(&["users", "bad tag"]).is_err());
        assert!(validate_tag(WILDCARD).is_err());
    }

    #[test]
    fn test_namespacing() {
        assert_eq!(namespaced("app", "k"), "app.k");
        assert_eq!(namespaced("", "k"), "k");
        assert_eq!(registry_key("app"), "app_TAG-REGISTRY");
    }

    #[test]
    fn test_prefix_rules() {
        assert!(validate_prefix("app").is_ok());
        assert!(validate_prefix("shop_eu-1").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("a.b").is_err());
        assert!(validate_prefix("app.").is_err());
        assert!(validate_prefix(&"p".repeat(PREFIX_MAX + 1)).is_err());
    }

    proptest! {
        #[test]
        fn prop_slash_and_control_chars_rejected(prefix in "[a-z]{0,10}", c in prop::sample::select(vec!['/', '\\', '\0', '\n', '\r', '\x7f'])) {
            let key = format!("{}{}x", prefix, c);
            prop_assert!(validate_key(&key, KEY_MAX_DEFAULT).is_err());
        }

        #[test]
        fn prop_alphabet_within_bound_accepted(key in "[A-Za-z0-9][A-Za-z0-9_.@+~=-]{0,62}") {
            prop_assert!(validate_key(&key, KEY_MAX_FILE).is_ok());
        }
    }
}
