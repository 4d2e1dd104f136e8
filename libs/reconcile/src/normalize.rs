//! Normalisation and comparison of public objects.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Returns true when `key` names a time field (`createdAt`, `restartedAt`, ...).
fn is_time_field(key: &str) -> bool {
    key.len() > 2 && key.ends_with("At")
}

/// Normalise a JSON value for comparison.
///
/// - time fields are dropped
/// - `null`, `[]` and `{}` are treated as absent
///
/// Returns `None` when the whole value is absent after normalisation.
pub fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if is_time_field(key) {
                    continue;
                }
                if let Some(inner) = normalize(inner) {
                    out.insert(key.clone(), inner);
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        Value::Array(items) => {
            if items.is_empty() {
                return None;
            }
            // Array positions are significant, so absent items stay as null.
            let out = items
                .iter()
                .map(|item| normalize(item).unwrap_or(Value::Null))
                .collect();
            Some(Value::Array(out))
        }
        other => Some(other.clone()),
    }
}

/// Compare two public objects modulo time fields and empty containers.
///
/// Values that fail to serialize are never equivalent.
pub fn equivalent<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => normalize(&a) == normalize(&b),
        _ => false,
    }
}

/// A spec hash for deterministic comparison and logging.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Hash of the normalised form of a public object.
    ///
    /// Two equivalent objects always share a hash.
    pub fn of<T: Serialize>(public: &T) -> Self {
        let value = serde_json::to_value(public).unwrap_or(Value::Null);
        Self::from_json(&normalize(&value).unwrap_or(Value::Null))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = json!({"b": 2, "a": 1});
        let json2 = json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[rstest]
    #[case(json!({"name": "a", "createdAt": "2024-01-01T00:00:00Z"}), json!({"name": "a", "createdAt": "2025-06-01T12:00:00Z"}))]
    #[case(json!({"name": "a", "labels": {}}), json!({"name": "a"}))]
    #[case(json!({"name": "a", "hosts": []}), json!({"name": "a", "hosts": null}))]
    #[case(json!({"name": "a", "spec": {"envs": []}}), json!({"name": "a"}))]
    fn test_equivalent_pairs(#[case] a: Value, #[case] b: Value) {
        assert!(equivalent(&a, &b));
        assert_eq!(SpecHash::of(&a), SpecHash::of(&b));
    }

    #[rstest]
    #[case(json!({"name": "a", "replicas": 1}), json!({"name": "a", "replicas": 2}))]
    #[case(json!({"name": "a", "hosts": ["x"]}), json!({"name": "a", "hosts": []}))]
    #[case(json!({"name": "a", "image": ""}), json!({"name": "a"}))]
    fn test_divergent_pairs(#[case] a: Value, #[case] b: Value) {
        assert!(!equivalent(&a, &b));
    }

    #[test]
    fn test_array_positions_are_kept() {
        let a = json!({"ports": [{}, {"port": 80}]});
        let b = json!({"ports": [{"port": 80}]});
        assert!(!equivalent(&a, &b));
    }

    #[test]
    fn test_short_at_key_is_not_a_time_field() {
        let a = json!({"At": 1});
        let b = json!({"At": 2});
        assert!(!equivalent(&a, &b));
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(keys in proptest::collection::vec("[a-z]{1,6}(At)?", 0..6), n in 0i64..5) {
            let mut map = Map::new();
            for (i, k) in keys.iter().enumerate() {
                let v = if i as i64 % 2 == n % 2 { json!([]) } else { json!(i) };
                map.insert(k.clone(), v);
            }
            let value = Value::Object(map);
            let once = normalize(&value);
            let twice = once.as_ref().and_then(normalize);
            prop_assert_eq!(once, twice);
        }
    }
}
