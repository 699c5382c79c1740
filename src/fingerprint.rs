//! Deterministic cache keys for dispatched commands.
//!
//! A fingerprint is a SHA-1 hex digest over `{command, model, normalized
//! parameters}`. Parameters are normalized by recursively ordering object
//! keys, so two semantically equal commands collide regardless of the key
//! order the client serialized. Explicit `null` values survive normalization
//! and therefore fingerprint differently from absent keys.

use std::fmt::Write as _;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Computes the cache fingerprint for one command invocation.
pub fn fingerprint(command: &str, model: &str, params: &Value) -> String {
    let canonical = canonicalize(params).to_string();

    let mut sha1 = Sha1::new();
    sha1.update(command.as_bytes());
    sha1.update(b"\0");
    sha1.update(model.as_bytes());
    sha1.update(b"\0");
    sha1.update(canonical.as_bytes());

    let digest = sha1.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // writing to a String cannot fail
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Rebuilds a JSON value with all object keys in sorted order, recursively.
/// Arrays keep their element order; element order is semantic.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = fingerprint("users.list", "users", &json!({"limit": 10, "offset": 0}));
        let b = fingerprint("users.list", "users", &json!({"offset": 0, "limit": 10}));
        assert_eq!(a, b);
    }

    #[test]
    fn nested_maps_are_normalized_too() {
        let a = fingerprint("q", "m", &json!({"filter": {"a": 1, "b": 2}}));
        let b = fingerprint("q", "m", &json!({"filter": {"b": 2, "a": 1}}));
        assert_eq!(a, b);
    }

    #[test]
    fn null_and_absent_are_distinct() {
        let with_null = fingerprint("q", "m", &json!({"cursor": null}));
        let absent = fingerprint("q", "m", &json!({}));
        assert_ne!(with_null, absent);
    }

    #[test]
    fn command_and_model_are_part_of_the_key() {
        let p = json!({"x": 1});
        assert_ne!(fingerprint("a.list", "a", &p), fingerprint("b.list", "a", &p));
        assert_ne!(fingerprint("a.list", "a", &p), fingerprint("a.list", "b", &p));
    }

    #[test]
    fn array_order_is_semantic() {
        let a = fingerprint("q", "m", &json!({"ids": [1, 2]}));
        let b = fingerprint("q", "m", &json!({"ids": [2, 1]}));
        assert_ne!(a, b);
    }
}
