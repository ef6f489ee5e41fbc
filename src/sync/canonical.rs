//! Canonical JSON serialization and content digests.
//!
//! Canonical form: object keys sorted by code point at every depth, no
//! insignificant whitespace, non-ASCII text written as-is (not `\u` escaped).
//! Two values that differ only in key insertion order serialize identically.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes `value` in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
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
        Value::String(s) => write_string(s, out),
        // null, bool and numbers have a single serde_json rendering
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::from(s).to_string());
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn digest(value: &Value) -> String {
    digest_bytes(canonical_json(value).as_bytes())
}

/// SHA-256 hex digest of already-serialized bytes.
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
