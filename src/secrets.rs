//! Secret Property Tracker
//!
//! Resource type → property paths that hold secrets. During expansion the
//! value found at each path is replaced by a placeholder unless the caller
//! asked to keep literal secrets.
//!
//! Paths are relative to the resource body and use dot/bracket notation:
//! `properties.containers[*].properties.environmentVariables[*].secureValue`.

use std::collections::HashMap;

use arm_expr::value::find_key;
use serde_json::{Map, Value};

use crate::error::{ExpandError, Result};

/// Replacement for a literal secret value
pub const SECRET_PLACEHOLDER: &str = "{{Secret}}";

const SECRET_REFERENCE_PREFIX: &str = "{{SecretReference:";

/// Results of `list*()` calls are already placeholders
const SECRET_LIST_PREFIX: &str = "{{SecretList";

static BUILTIN_SECRET_PROPERTIES: &str = include_str!("../data/secret-properties.json");

/// Placeholder for a secret that came from a Key Vault reference
pub fn secret_reference_placeholder(name: &str) -> String {
    format!("{}{}}}}}", SECRET_REFERENCE_PREFIX, name)
}

pub fn is_placeholder(value: &str) -> bool {
    value == SECRET_PLACEHOLDER
        || (value.starts_with(SECRET_REFERENCE_PREFIX) && value.ends_with("}}"))
        || (value.starts_with(SECRET_LIST_PREFIX) && value.ends_with("}}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    /// `[*]`: every element of an array
    Wildcard,
}

/// Split `a.b[*].c[0]` into segments
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let malformed = || ExpandError::malformed("", format!("invalid secret property path '{}'", path));
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if key.is_empty() && segments.is_empty() {
            return Err(malformed());
        }
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(malformed)?;
            let inner = &rest[1..close];
            segments.push(match inner {
                "*" => PathSegment::Wildcard,
                n => PathSegment::Index(n.parse().map_err(|_| malformed())?),
            });
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(malformed());
            }
        }
    }
    Ok(segments)
}

#[derive(Debug, Clone)]
struct SecretPath {
    raw: String,
    segments: Vec<PathSegment>,
}

/// Immutable registry of secret property paths, built once and shared
#[derive(Debug, Clone, Default)]
pub struct SecretPropertyRegistry {
    /// Lowercased resource type → paths in declaration order
    entries: HashMap<String, Vec<SecretPath>>,
    raw: HashMap<String, Vec<String>>,
}

impl SecretPropertyRegistry {
    /// The registry embedded in the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_SECRET_PROPERTIES)
    }

    /// Parse `{"<resource type>": ["path", ...]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let map: HashMap<String, Vec<String>> = serde_json::from_str(json).map_err(|e| {
            ExpandError::malformed("", format!("invalid secret property data: {}", e))
        })?;
        let mut registry = Self::default();
        for (resource_type, paths) in map {
            registry.insert(&resource_type, paths)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, resource_type: &str, paths: Vec<String>) -> Result<()> {
        let key = resource_type.to_ascii_lowercase();
        let parsed = paths
            .iter()
            .map(|p| {
                Ok(SecretPath {
                    raw: p.clone(),
                    segments: parse_path(p)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.entries.insert(key.clone(), parsed);
        self.raw.insert(key, paths);
        Ok(())
    }

    /// Exact, case-insensitive match on the full resource type
    pub fn try_get_value(&self, resource_type: &str) -> Option<&[String]> {
        self.raw
            .get(&resource_type.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace literal secrets in `body` and return the concrete paths touched.
    ///
    /// Values already holding a placeholder are left alone. With
    /// `keep_literals` nothing is replaced or reported.
    pub fn redact(
        &self,
        resource_type: &str,
        body: &mut Map<String, Value>,
        keep_literals: bool,
    ) -> Vec<String> {
        let mut redacted = Vec::new();
        if keep_literals {
            return redacted;
        }
        let Some(paths) = self.entries.get(&resource_type.to_ascii_lowercase()) else {
            return redacted;
        };
        for path in paths {
            tracing::trace!(resource_type, path = %path.raw, "checking secret path");
            redact_object(body, &path.segments, String::new(), &mut redacted);
        }
        redacted
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn redact_object(
    object: &mut Map<String, Value>,
    segments: &[PathSegment],
    prefix: String,
    redacted: &mut Vec<String>,
) {
    let Some((PathSegment::Key(key), rest)) = segments.split_first() else {
        return;
    };
    let Some(actual) = find_key(object, key).map(str::to_string) else {
        return;
    };
    if let Some(value) = object.get_mut(&actual) {
        redact_value(value, rest, join_key(&prefix, &actual), redacted);
    }
}

fn redact_value(value: &mut Value, segments: &[PathSegment], path: String, redacted: &mut Vec<String>) {
    match segments.first() {
        None => {
            if let Value::String(s) = value {
                if !is_placeholder(s) {
                    *s = SECRET_PLACEHOLDER.to_string();
                    redacted.push(path);
                }
            }
        }
        Some(PathSegment::Key(_)) => {
            if let Value::Object(object) = value {
                redact_object(object, segments, path, redacted);
            }
        }
        Some(PathSegment::Index(i)) => {
            if let Some(item) = value.as_array_mut().and_then(|a| a.get_mut(*i)) {
                redact_value(item, &segments[1..], format!("{}[{}]", path, i), redacted);
            }
        }
        Some(PathSegment::Wildcard) => {
            if let Value::Array(items) = value {
                for (i, item) in items.iter_mut().enumerate() {
                    redact_value(item, &segments[1..], format!("{}[{}]", path, i), redacted);
                }
            }
        }
    }
}

/// Replace every occurrence of a secure parameter value inside `value`.
///
/// Strings match exactly; objects match structurally.
pub fn redact_secure_values(value: &mut Value, secure: &[Value], path: &str, redacted: &mut Vec<String>) {
    if secure.is_empty() {
        return;
    }
    let matches = match &*value {
        Value::String(s) => !is_placeholder(s) && secure.iter().any(|v| v.as_str() == Some(s.as_str())),
        Value::Object(_) => secure.iter().any(|v| v.is_object() && v == &*value),
        _ => false,
    };
    if matches {
        *value = Value::String(SECRET_PLACEHOLDER.to_string());
        redacted.push(path.to_string());
        return;
    }
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                redact_secure_values(child, secure, &join_key(path, key), redacted);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                redact_secure_values(child, secure, &format!("{}[{}]", path, i), redacted);
            }
        }
        _ => {}
    }
}
