//! Canonical JSON encoding and hashing.
//!
//! Event ids, signing digests, and checkpoint root hashes are all SHA-256
//! over the canonical byte form produced here, so this encoding must stay
//! byte-identical across platforms and releases.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value to its canonical byte form.
///
/// Rules: object keys sorted lexicographically by byte order, arrays kept in
/// given order, no whitespace, non-ASCII and control characters escaped as
/// `\uXXXX`, numbers in serde_json's shortest form with `-0` normalized to
/// `0`, and `null` rendered explicitly (absence is a different value).
pub fn canonical(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// SHA-256 over the canonical byte form.
pub fn hash(value: &Value) -> [u8; 32] {
    Sha256::digest(canonical(value)).into()
}

/// SHA-256 over the canonical byte form, lowercase hex.
pub fn hash_hex(value: &Value) -> String {
    hex::encode(hash(value))
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[key.as_str()]);
            }
            out.push(b'}');
        }
    }
}

fn write_number(out: &mut Vec<u8>, n: &serde_json::Number) {
    // serde_json cannot represent NaN or infinities, so every number here
    // has a finite shortest form. Negative zero collapses to plain zero.
    if n.as_f64() == Some(0.0) && n.as_u64().is_none() && n.as_i64().is_none() {
        out.push(b'0');
        return;
    }
    out.extend_from_slice(n.to_string().as_bytes());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            c if (' '..='~').contains(&c) => out.push(c as u8),
            c => {
                // Escape everything outside printable ASCII, using a
                // surrogate pair for characters beyond the BMP.
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.extend_from_slice(format!("\\u{:04x}", unit).as_bytes());
                }
            }
        }
    }
    out.push(b'"');
}
