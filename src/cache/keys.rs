//! Cache key definitions.
//!
//! Defines `KeyPath` for declared dependencies and `CanonicalKey`, the string
//! form used to index subscriptions.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

const SEPARATOR: &str = ",";

/// An ordered sequence of values naming one dependency, e.g. `["users", 42]`.
///
/// Elements may be primitives, nested sequences or mappings. Two key paths
/// that are structurally equal always canonicalize to the same string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<Value>);

impl KeyPath {
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical string used as the cache index key.
    pub fn canonical(&self) -> CanonicalKey {
        canonicalize(&self.0)
    }
}

impl From<Vec<Value>> for KeyPath {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl<T: Into<Value>> FromIterator<T> for KeyPath {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Build a [`KeyPath`] from a list of values convertible into JSON values.
///
/// ```
/// use depquery::key_path;
///
/// let key = key_path!["users", 42];
/// assert_eq!(key.canonical().as_str(), "users,42");
/// ```
#[macro_export]
macro_rules! key_path {
    () => {
        $crate::KeyPath::default()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::KeyPath::new(vec![$($crate::Value::from($part)),+])
    };
}

/// Deterministic string form of a key path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CanonicalKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&KeyPath> for CanonicalKey {
    fn from(path: &KeyPath) -> Self {
        path.canonical()
    }
}

// ============================================================================
// Canonicalization
// ============================================================================

/// Canonicalize an ordered sequence of values.
///
/// Elements are rendered recursively and joined with `,`. An empty sequence
/// yields the empty string.
pub fn canonicalize(parts: &[Value]) -> CanonicalKey {
    CanonicalKey(render_sequence(parts))
}

/// Canonicalize a mapping as `key:value` entries in iteration order.
pub fn canonicalize_map(map: &Map<String, Value>) -> CanonicalKey {
    CanonicalKey(render_map(map))
}

fn render_sequence(parts: &[Value]) -> String {
    parts
        .iter()
        .map(render_value)
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

fn render_map(map: &Map<String, Value>) -> String {
    // Sorted even if serde_json's `preserve_order` gets enabled downstream.
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));
    entries
        .into_iter()
        .map(|(key, value)| format!("{key}:{}", render_value(value)))
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Array(items) => render_sequence(items),
        Value::Object(map) => render_map(map),
        Value::String(text) => text.clone(),
        Value::Number(number) => render_number(number),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => "null".to_string(),
    }
}

fn render_number(number: &Number) -> String {
    if let Some(int) = number.as_i64() {
        int.to_string()
    } else if let Some(uint) = number.as_u64() {
        uint.to_string()
    } else {
        // f64 Display drops a trailing `.0`, so 1.0 and 1 share a key.
        number.as_f64().map(|float| float.to_string()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_sequence_is_empty_string() {
        assert_eq!(canonicalize(&[]).as_str(), "");
        assert_eq!(KeyPath::default().canonical().as_str(), "");
    }

    #[test]
    fn empty_mapping_is_empty_string() {
        assert_eq!(canonicalize_map(&Map::new()).as_str(), "");
    }

    #[test]
    fn single_element() {
        assert_eq!(canonicalize(&[json!(1)]).as_str(), "1");
        assert_eq!(key_path!["root"].canonical().as_str(), "root");
    }

    #[test]
    fn nested_sequences_compose() {
        let key = canonicalize(&[json!([1, 2]), json!([3])]);
        assert_eq!(key.as_str(), "1,2,3");
        assert_eq!(key, canonicalize(&[json!([1, 2]), json!([3])]));
    }

    #[test]
    fn multi_level_key() {
        assert_eq!(key_path!["users", 42].canonical().as_str(), "users,42");
    }

    #[test]
    fn mapping_entries_render_with_keys() {
        let key = canonicalize(&[json!({"id": 7, "tags": ["a", "b"]})]);
        assert_eq!(key.as_str(), "id:7,tags:a,b");
    }

    #[test]
    fn mapping_independent_of_construction_order() {
        let mut first = Map::new();
        first.insert("b".to_string(), json!(2));
        first.insert("a".to_string(), json!(1));

        let mut second = Map::new();
        second.insert("a".to_string(), json!(1));
        second.insert("b".to_string(), json!(2));

        assert_eq!(canonicalize_map(&first), canonicalize_map(&second));
    }

    #[test]
    fn primitives_render_like_display() {
        let key = canonicalize(&[json!(true), json!(null), json!(1.5), json!(2.0), json!(-3)]);
        assert_eq!(key.as_str(), "true,null,1.5,2,-3");
    }

    #[test]
    fn canonicalize_does_not_consume_input() {
        let path = key_path!["posts", 1];
        let before = path.clone();
        let _ = path.canonical();
        assert_eq!(path, before);
    }

    #[test]
    fn collect_into_key_path() {
        let path: KeyPath = ["a", "b"].into_iter().collect();
        assert_eq!(path.canonical().as_str(), "a,b");
    }
}
