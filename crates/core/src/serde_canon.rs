//! Canonical JSON serialization for deterministic model hashing
//!
//! Sorted map keys, no whitespace. Identical models hash identically
//! across platforms and serde versions.

use crate::errors::{GbmError, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// Serialize a value to canonical JSON (recursively sorted keys,
/// compact formatting).
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let json_value =
        serde_json::to_value(value).map_err(|e| GbmError::Serialization(e.to_string()))?;
    let canonical = canonicalize_value(&json_value);
    serde_json::to_string(&canonical).map_err(|e| GbmError::Serialization(e.to_string()))
}

fn canonicalize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut btree = BTreeMap::new();
            for (k, v) in map {
                btree.insert(k.clone(), canonicalize_value(v));
            }
            serde_json::Value::Object(btree.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_value).collect())
        }
        other => other.clone(),
    }
}

/// Blake3 hash of the canonical JSON representation.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    let json = to_canonical_json(value)?;
    Ok(*blake3::hash(json.as_bytes()).as_bytes())
}

/// Blake3 hash as a hex string.
pub fn hash_canonical_hex<T: Serialize>(value: &T) -> Result<String> {
    Ok(hex::encode(hash_canonical(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        zeta: i64,
        alpha: i64,
    }

    #[test]
    fn test_keys_sorted() {
        let json = to_canonical_json(&Sample { zeta: 1, alpha: 2 }).unwrap();
        assert_eq!(json, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_hash_stable() {
        let a = Sample { zeta: 1, alpha: 2 };
        let b = Sample { zeta: 1, alpha: 2 };
        assert_eq!(
            hash_canonical_hex(&a).unwrap(),
            hash_canonical_hex(&b).unwrap()
        );
        assert_eq!(hash_canonical_hex(&a).unwrap().len(), 64);
    }
}
