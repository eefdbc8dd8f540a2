// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-path lookup into function results.
//!
//! Supports the subset used by switch conditions: `$` for the whole value,
//! dotted member access (`$.order.total`) and array indexing
//! (`$.items[0].sku`).

use serde_json::Value;

use crate::error::DslError;

/// Prefix that marks an operand as a path rather than a literal.
pub const PATH_ROOT: &str = "$";

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Returns true if the string looks like a JSON path (`$` or `$.` / `$[`).
pub fn is_path(s: &str) -> bool {
    s == PATH_ROOT || s.starts_with("$.") || s.starts_with("$[")
}

/// Parse a path such as `$.a.b[2]` into segments.
pub fn parse(path: &str) -> Result<Vec<Segment>, DslError> {
    let rest = path
        .strip_prefix(PATH_ROOT)
        .ok_or_else(|| DslError::InvalidPath(path.to_string()))?;

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(DslError::InvalidPath(path.to_string()));
                }
                segments.push(Segment::Key(key));
            }
            '[' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => digits.push(d),
                        None => return Err(DslError::InvalidPath(path.to_string())),
                    }
                }
                let index = digits
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| DslError::InvalidPath(path.to_string()))?;
                segments.push(Segment::Index(index));
            }
            _ => return Err(DslError::InvalidPath(path.to_string())),
        }
    }
    Ok(segments)
}

/// Look up `path` in `value`. Returns `Ok(None)` when the path is well formed
/// but does not exist in the value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Result<Option<&'a Value>, DslError> {
    let segments = parse(path)?;
    let mut current = value;
    for segment in &segments {
        let next = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}
