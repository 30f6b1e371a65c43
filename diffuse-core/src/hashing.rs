//! Payload Fingerprints - SHA-256 over Canonical JSON
//!
//! Two payloads built from the same composition share a fingerprint even
//! though their seeds differ, which lets callers spot repeated draws.

use serde::Serialize;
use serde_json::{to_string, Map, Value};
use sha2::{Digest, Sha256};

/// Keys left out of the fingerprint because they change on every resolution.
const VOLATILE_KEYS: &[&str] = &["seed"];

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Fingerprint a request payload, ignoring its seed.
pub fn payload_fingerprint(payload: &Map<String, Value>) -> Result<String, serde_json::Error> {
    let stable: Map<String, Value> = payload
        .iter()
        .filter(|(k, _)| !VOLATILE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let canonical = canonical_json(&stable)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
