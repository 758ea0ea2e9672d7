//! Canonical JSON encoding used for bundle checksums
//!
//! Rules:
//! - object keys sorted bytewise, at every depth
//! - no insignificant whitespace
//! - strings escaped by `serde_json`
//! - numbers: integers verbatim, floats in shortest round-trip form (`ryu`)
//!
//! The writer sorts keys itself instead of trusting the map type behind
//! `serde_json::Value`, so a dependency enabling `preserve_order` cannot
//! change checksums.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{ReproError, Result};

/// Canonical bytes of any serializable value
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::with_capacity(256);
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of the canonical encoding of `value`
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            serde_json::to_writer(&mut *out, value)
                .map_err(|e| ReproError::Serialization(e.to_string()))?;
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)
                    .map_err(|e| ReproError::Serialization(e.to_string()))?;
                out.push(b':');
                write_value(item, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}
