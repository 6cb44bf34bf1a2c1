//! Deterministic JSON serialization for hashing and signing.
//!
//! Both sides of the task protocol hash the same canonical form of a message:
//! lexicographically key-sorted objects, no whitespace, no trailing newline.
//! `serde_json` objects are backed by a `BTreeMap`, so serializing a
//! [`serde_json::Value`] compactly already yields sorted keys; this module
//! just pins that contract down in one place.

use serde_json::Value;

/// Serializes a JSON value in canonical form: sorted keys, compact separators.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("JSON value serialization is infallible")
}

/// Returns a copy of `value` with the named top-level fields removed.
///
/// Used to strip `commander_signature` and `message_name` before hashing a
/// task request.
pub fn without_fields(value: &Value, fields: &[&str]) -> Value {
    let mut base = value.clone();
    if let Some(map) = base.as_object_mut() {
        for field in fields {
            map.remove(*field);
        }
    }
    base
}
