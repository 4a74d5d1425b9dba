//! Extraction Paths
//!
//! A small JSONPath subset used for step outputs and condition checks:
//! `$`, `$.data.promotion.id`, `$.items[0].id`, or the same without the
//! leading `$`. Numeric keys also index arrays (`items.0.id`).

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path '{path}': {reason}")]
pub struct PathError {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed extraction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parses a path expression.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let text = raw.trim();
        let err = |reason: &str| PathError {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut rest = text.strip_prefix('$').unwrap_or(text);
        let mut segments = Vec::new();
        let mut first = !text.starts_with('$');

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']').ok_or_else(|| err("unclosed '['"))?;
                let index = after[..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| err("array index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &after[close + 1..];
                first = false;
                continue;
            }

            let body = match rest.strip_prefix('.') {
                Some(body) => body,
                None if first => rest,
                None => return Err(err("expected '.' or '['")),
            };
            first = false;

            let end = body
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(body.len());
            let key = &body[..end];
            if key.is_empty() {
                return Err(err("empty key"));
            }
            if !key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
                return Err(err("keys may only contain letters, digits, '_' and '-'"));
            }
            segments.push(Segment::Key(key.to_string()));
            rest = &body[end..];
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Builds a path from already split keys.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<Segment> = keys.into_iter().map(|k| Segment::Key(k.into())).collect();
        let raw = segments
            .iter()
            .map(|s| match s {
                Segment::Key(k) => k.clone(),
                Segment::Index(i) => i.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".");
        Self { raw, segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Looks the path up in a JSON value.
    pub fn lookup<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        self.segments.iter().try_fold(value, |current, segment| match segment {
            Segment::Key(key) => match current {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            },
            Segment::Index(index) => current.as_array().and_then(|items| items.get(*index)),
        })
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parses `path` and extracts a copy of the value it points at.
pub fn extract(value: &Value, path: &str) -> Result<Option<Value>, PathError> {
    Ok(JsonPath::parse(path)?.lookup(value).cloned())
}
