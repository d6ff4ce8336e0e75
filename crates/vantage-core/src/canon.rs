use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Re-serialize arbitrary JSON text with sorted keys and no insignificant
/// whitespace (§4.5, §4.7: "serialize canonically (sorted keys, no
/// whitespace)").
///
/// `serde_json::Map` is backed by a `BTreeMap` as long as the
/// `preserve_order` feature is not enabled (it isn't, anywhere in this
/// workspace), so parsing into [`Value`] and re-serializing already sorts
/// object keys; `to_string` (as opposed to `to_string_pretty`) emits the
/// compact, whitespace-free form.
pub fn canonicalize_json(text: &str) -> Result<String, CoreError> {
    let value: Value = serde_json::from_str(text)?;
    Ok(serde_json::to_string(&value)?)
}

pub fn canonicalize_value(value: &Value) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

/// SHA-256 hex digest of an already-canonical string, used by the
/// fingerprint computer (§4.7).
pub fn sha256_hex(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_keys_and_strips_whitespace() {
        let input = r#"{ "b": 1, "a": { "z": 2, "y": 3 } }"#;
        let out = canonicalize_json(input).unwrap();
        assert_eq!(out, r#"{"a":{"y":3,"z":2},"b":1}"#);
    }

    #[test]
    fn sha256_is_deterministic() {
        let a = canonicalize_json(r#"{"b":1,"a":2}"#).unwrap();
        let b = canonicalize_json(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(sha256_hex(&a), sha256_hex(&b));
    }
}
