//! Typed XML dialect.
//!
//! ```text
//! <value type="map">
//!   <value key="name" type="str">text</value>
//!   <value key="n" type="int">3</value>
//! </value>
//! ```
//!
//! Only documents written by [`encode`] are expected back; the reader
//! understands exactly this dialect (declaration, `value` elements,
//! double-quoted attributes, the five predefined entities).

use crate::entry::Value;
use crate::error::{Error, Result};
use serde_json::{Map, Number};

const DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

pub(super) fn encode(tree: &Value) -> String {
    let mut out = String::from(DECLARATION);
    write_value(&mut out, None, tree);
    out.push('\n');
    out
}

fn write_value(out: &mut String, key: Option<&str>, value: &Value) {
    out.push_str("<value");
    if let Some(key) = key {
        out.push_str(" key=\"");
        escape_into(out, key);
        out.push('"');
    }
    let (kind, text) = match value {
        Value::Null => ("null", None),
        Value::Bool(b) => ("bool", Some(b.to_string())),
        Value::Number(n) if n.is_f64() => ("float", Some(n.to_string())),
        Value::Number(n) => ("int", Some(n.to_string())),
        Value::String(s) => ("str", Some(s.clone())),
        Value::Array(_) => ("list", None),
        Value::Object(_) => ("map", None),
    };
    out.push_str(" type=\"");
    out.push_str(kind);
    out.push('"');

    match value {
        Value::Array(items) if !items.is_empty() => {
            out.push('>');
            for item in items {
                write_value(out, None, item);
            }
            out.push_str("</value>");
        }
        Value::Object(map) if !map.is_empty() => {
            out.push('>');
            for (k, v) in map {
                write_value(out, Some(k), v);
            }
            out.push_str("</value>");
        }
        _ => match text {
            Some(text) if !text.is_empty() => {
                out.push('>');
                escape_into(out, &text);
                out.push_str("</value>");
            }
            _ => out.push_str("/>"),
        },
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = rest
            .find(';')
            .ok_or_else(|| malformed("unterminated entity"))?;
        match &rest[..=end] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            other => return Err(malformed(&format!("unknown entity {}", other))),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn malformed(what: &str) -> Error {
    Error::DeserializationError(format!("xml: {}", what))
}

pub(super) fn decode(input: &str) -> Result<Value> {
    let mut cursor = Cursor { rest: input };
    cursor.skip_ws();
    if cursor.rest.starts_with("<?xml") {
        let end = cursor
            .rest
            .find("?>")
            .ok_or_else(|| malformed("unterminated declaration"))?;
        cursor.rest = &cursor.rest[end + 2..];
    }
    cursor.skip_ws();
    let (_, value) = cursor.element()?;
    cursor.skip_ws();
    if !cursor.rest.is_empty() {
        return Err(malformed("trailing content"));
    }
    Ok(value)
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        match self.rest.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            }
            None => Err(malformed(&format!("expected {:?}", token))),
        }
    }

    /// Parse one `<value ...>` element, returning its `key` attribute and value.
    fn element(&mut self) -> Result<(Option<String>, Value)> {
        self.expect("<value")?;
        let mut key = None;
        let mut kind = None;
        let empty = loop {
            self.skip_ws();
            if self.rest.starts_with("/>") {
                self.rest = &self.rest[2..];
                break true;
            }
            if self.rest.starts_with('>') {
                self.rest = &self.rest[1..];
                break false;
            }
            let (name, value) = self.attribute()?;
            match name {
                "key" => key = Some(value),
                "type" => kind = Some(value),
                _ => {}
            }
        };
        let kind = kind.ok_or_else(|| malformed("missing type attribute"))?;

        let value = match kind.as_str() {
            "list" => Value::Array(if empty {
                Vec::new()
            } else {
                let mut items = Vec::new();
                while !self.closing() {
                    items.push(self.element()?.1);
                }
                items
            }),
            "map" => Value::Object(if empty {
                Map::new()
            } else {
                let mut map = Map::new();
                while !self.closing() {
                    let (k, v) = self.element()?;
                    let k = k.ok_or_else(|| malformed("map member without key"))?;
                    map.insert(k, v);
                }
                map
            }),
            scalar => {
                let text = if empty {
                    String::new()
                } else {
                    let end = self
                        .rest
                        .find('<')
                        .ok_or_else(|| malformed("unterminated text"))?;
                    let raw = &self.rest[..end];
                    self.rest = &self.rest[end..];
                    self.expect("</value>")?;
                    unescape(raw)?
                };
                scalar_value(scalar, &text)?
            }
        };
        Ok((key, value))
    }

    /// Consume `</value>` if it is next; skips leading whitespace either way.
    fn closing(&mut self) -> bool {
        self.skip_ws();
        match self.rest.strip_prefix("</value>") {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn attribute(&mut self) -> Result<(&'a str, String)> {
        let rest: &'a str = self.rest;
        let eq = rest
            .find('=')
            .ok_or_else(|| malformed("attribute without value"))?;
        let name = rest[..eq].trim();
        self.rest = &rest[eq + 1..];
        self.expect("\"")?;
        let close = self
            .rest
            .find('"')
            .ok_or_else(|| malformed("unterminated attribute"))?;
        let value = unescape(&self.rest[..close])?;
        self.rest = &self.rest[close + 1..];
        Ok((name, value))
    }
}

fn scalar_value(kind: &str, text: &str) -> Result<Value> {
    match kind {
        "null" => Ok(Value::Null),
        "str" => Ok(Value::String(text.to_string())),
        "bool" => text
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| malformed("bad bool")),
        "int" => {
            if let Ok(i) = text.parse::<i64>() {
                Ok(Value::from(i))
            } else {
                text.parse::<u64>()
                    .map(Value::from)
                    .map_err(|_| malformed("bad int"))
            }
        }
        "float" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| malformed("bad float")),
        other => Err(malformed(&format!("unknown type {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoded_shape() {
        let xml = encode(&json!({"a": "x&y", "e": []}));
        assert!(xml.starts_with(DECLARATION));
        assert!(xml.contains(r#"<value key="a" type="str">x&amp;y</value>"#));
        assert!(xml.contains(r#"<value key="e" type="list"/>"#));
    }

    #[test]
    fn test_empty_and_nested() {
        let tree = json!({"": "", "m": {}, "l": [[], {"k": null}], "q": "\"'<>"});
        assert_eq!(decode(&encode(&tree)).expect("decode"), tree);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode("<value>").is_err());
        assert!(decode("<value type=\"int\">x</value>").is_err());
        assert!(decode("<value type=\"str\">a &bogus; b</value>").is_err());
        assert!(decode("not xml").is_err());
    }
}
