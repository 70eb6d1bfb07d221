//! Deterministic request hashing.
//!
//! Object keys are sorted recursively before serialization so two payloads
//! that differ only in key insertion order hash identically. Arrays keep
//! their order.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of every hash produced by [`stable_hash`].
pub const HASH_HEX_LEN: usize = 64;

/// SHA-256 of the canonical JSON form of `value`, as lowercase hex.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(hash_value(&value))
}

/// Hash an already-built JSON value.
pub fn hash_value(value: &Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serialize with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serializing a &str cannot fail
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":null,"y":[1,2]},"b":1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
    }

    #[test]
    fn output_is_fixed_length_hex() {
        for value in [json!(null), json!("x"), json!({"deep": {"er": [true]}})] {
            let hash = hash_value(&value);
            assert_eq!(hash.len(), HASH_HEX_LEN);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"z": {"b": 2, "a": 1}, "a": "s"});
        assert_eq!(canonical_json(&value), r#"{"a":"s","z":{"a":1,"b":2}}"#);
    }
}
