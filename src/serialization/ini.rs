//! Two-level INI codec.
//!
//! Top-level scalars are written first as global `key = value` lines, then
//! every top-level map becomes a `[section]` of scalars. Strings are always
//! quoted so that `"1"` and `1` survive a round trip.

use crate::entry::Value;
use crate::error::{Error, Result};
use serde_json::{Map, Number};

pub(super) fn encode(tree: &Value) -> Result<String> {
    let root = tree
        .as_object()
        .ok_or_else(|| too_deep("top level must be a map"))?;

    let mut out = String::new();
    for (key, value) in root {
        if !value.is_object() {
            write_pair(&mut out, key, value)?;
        }
    }
    for (name, value) in root {
        if let Value::Object(section) = value {
            check_name(name)?;
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
            for (key, value) in section {
                write_pair(&mut out, key, value)?;
            }
        }
    }
    Ok(out)
}

fn too_deep(what: &str) -> Error {
    Error::SerializationError(format!("ini: {}", what))
}

fn check_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.trim() != name
        || name
            .chars()
            .any(|c| matches!(c, '=' | '[' | ']' | ';' | '#' | '"') || c.is_control());
    if bad {
        Err(too_deep(&format!("unrepresentable name {:?}", name)))
    } else {
        Ok(())
    }
}

fn write_pair(out: &mut String, key: &str, value: &Value) -> Result<()> {
    check_name(key)?;
    out.push_str(key);
    out.push_str(" = ");
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => quote_into(out, s),
        Value::Array(_) | Value::Object(_) => {
            return Err(too_deep(&format!("{:?} is nested too deeply", key)))
        }
    }
    out.push('\n');
    Ok(())
}

fn quote_into(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

pub(super) fn decode(input: &str) -> Result<Value> {
    let mut root = Map::new();
    let mut section: Option<String> = None;

    for (n, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            root.entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            section = Some(name);
            continue;
        }
        let (key, raw) = line.split_once('=').ok_or_else(|| {
            Error::DeserializationError(format!("ini: line {} is not key = value", n + 1))
        })?;
        let value = parse_scalar(raw.trim())?;
        let target = match &section {
            Some(name) => root
                .get_mut(name)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| Error::DeserializationError("ini: lost section".to_string()))?,
            None => &mut root,
        };
        target.insert(key.trim().to_string(), value);
    }
    Ok(Value::Object(root))
}

fn parse_scalar(raw: &str) -> Result<Value> {
    if let Some(body) = raw.strip_prefix('"') {
        let body = body
            .strip_suffix('"')
            .ok_or_else(|| Error::DeserializationError("ini: unterminated string".to_string()))?;
        return unquote(body).map(Value::String);
    }
    Ok(match raw {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(i) = raw.parse::<i64>() {
                Value::from(i)
            } else if let Ok(u) = raw.parse::<u64>() {
                Value::from(u)
            } else if let Some(f) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
                Value::Number(f)
            } else {
                Value::String(raw.to_string())
            }
        }
    })
}

fn unquote(body: &str) -> Result<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            _ => {
                return Err(Error::DeserializationError(
                    "ini: bad escape sequence".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layout() {
        let text = encode(&json!({"version": 2, "keys": {"a": "x"}})).expect("encode");
        assert_eq!(text, "version = 2\n[keys]\na = \"x\"\n");
    }

    #[test]
    fn test_strings_keep_their_type() {
        let tree = json!({"s": {"num": "1", "q": "say \"hi\"\n", "f": 2.5, "n": null}});
        assert_eq!(decode(&encode(&tree).expect("encode")).expect("decode"), tree);
    }

    #[test]
    fn test_rejects_nesting() {
        assert!(encode(&json!({"s": {"deep": {"x": 1}}})).is_err());
        assert!(encode(&json!({"s": {"list": [1]}})).is_err());
        assert!(encode(&json!([1])).is_err());
    }

    #[test]
    fn test_decode_tolerates_comments() {
        let tree = decode("; header\n[a]\n# note\nk = 1\n").expect("decode");
        assert_eq!(tree, json!({"a": {"k": 1}}));
        assert!(decode("[a]\nnot a pair\n").is_err());
    }
}
