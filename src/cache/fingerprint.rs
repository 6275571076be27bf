use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{ApiType, normalize_model_name};

/// Top-level fields that do not change what the model produces.
const IGNORED_KEYS: &[&str] = &[
    "model",
    "stream",
    "stream_options",
    "user",
    "metadata",
    "store",
    "safety_identifier",
    "prompt_cache_key",
];

/// Forwarded request headers that change what the upstream returns.
pub const VARY_HEADERS: &[&str] = &["anthropic-beta", "anthropic-version"];

/// SHA-256 over dialect, normalised model, the request variants (query
/// string and `VARY_HEADERS` values, as `(name, value)` pairs) and the
/// canonical request body.
pub fn fingerprint(api_type: ApiType, model: &str, variants: &[(&str, &str)], body: &Value) -> String {
    let mut canonical = String::new();
    match body {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !IGNORED_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            write_canonical(&Value::Object(filtered), &mut canonical);
        }
        other => write_canonical(other, &mut canonical),
    }

    let mut hasher = Sha256::new();
    hasher.update(api_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_model_name(model).as_bytes());
    hasher.update([0u8]);
    let mut variants = variants.to_vec();
    variants.sort();
    for (name, value) in variants {
        hasher.update(name.to_ascii_lowercase().as_bytes());
        hasher.update([b'=']);
        hasher.update(value.trim().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => {
            out.push_str(&Value::String(s.trim().to_string()).to_string());
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

// 1 与 1.0 视为同一个值
fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 9.0e15 {
            out.push_str(&(f as i64).to_string());
        } else {
            out.push_str(&f.to_string());
        }
    }
}
