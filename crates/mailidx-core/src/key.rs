//! Record keys
//!
//! Keys follow IndexedDB ordering: every number sorts before every string,
//! every string before every array, and arrays compare element-wise. The
//! variant order below encodes that, so the derived `Ord` is the cursor order.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primary or index key of a stored record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
    Array(Vec<Key>),
}

impl Key {
    /// Extract a key from a JSON value, if the value is a valid key.
    ///
    /// Only integral numbers, strings and arrays of valid keys qualify.
    pub fn from_json(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Key::Int(n) => Value::from(*n),
            Key::Text(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_json).collect()),
        }
    }

    /// Read the key at `key_path` (a dotted field path) inside `value`.
    pub fn from_key_path(value: &Value, key_path: &str) -> Option<Key> {
        let mut current = value;
        for segment in key_path.split('.') {
            current = current.get(segment)?;
        }
        Key::from_json(current)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Text(s) => write!(f, "{:?}", s),
            Key::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ordering_matches_indexeddb() {
        let mut keys = vec![
            Key::Array(vec![Key::Int(1)]),
            Key::from("b"),
            Key::Int(10),
            Key::from("a"),
            Key::Int(-3),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::Int(-3),
                Key::Int(10),
                Key::from("a"),
                Key::from("b"),
                Key::Array(vec![Key::Int(1)]),
            ]
        );
    }

    #[test]
    fn test_from_json_rejects_non_keys() {
        assert_eq!(Key::from_json(&json!(1.5)), None);
        assert_eq!(Key::from_json(&json!({"a": 1})), None);
        assert_eq!(Key::from_json(&json!([1, null])), None);
        assert_eq!(
            Key::from_json(&json!([1, "x"])),
            Some(Key::Array(vec![Key::Int(1), Key::from("x")]))
        );
    }

    #[test]
    fn test_key_path_lookup() {
        let value = json!({"word": "hello", "meta": {"id": 7}});
        assert_eq!(Key::from_key_path(&value, "word"), Some(Key::from("hello")));
        assert_eq!(Key::from_key_path(&value, "meta.id"), Some(Key::Int(7)));
        assert_eq!(Key::from_key_path(&value, "missing"), None);
    }

    #[test]
    fn test_display() {
        let key = Key::Array(vec![Key::Int(1), Key::from("x")]);
        assert_eq!(key.to_string(), r#"[1, "x"]"#);
    }
}
