//! Best-effort structural equality that ignores internal bookkeeping fields.
//!
//! This is **not** a substitute for `PartialEq` and must not feed any
//! authorization decision. It exists for test assertions that want to compare
//! the meaningful shape of two records while ignoring fields such as store
//! revisions.

use serde::Serialize;
use serde_json::Value;

/// Object keys starting with this prefix are internal bookkeeping.
pub const INTERNAL_FIELD_PREFIX: &str = "__";

/// Compare two values by their serialized form, skipping every object key
/// that starts with [`INTERNAL_FIELD_PREFIX`] at any depth.
///
/// Returns `false` if either value fails to serialize.
pub fn known_fields_eq<A, B>(a: &A, b: &B) -> bool
where
    A: Serialize + ?Sized,
    B: Serialize + ?Sized,
{
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => strip_internal(a) == strip_internal(b),
        _ => false,
    }
}

fn strip_internal(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.starts_with(INTERNAL_FIELD_PREFIX))
                .map(|(key, v)| (key, strip_internal(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_internal).collect()),
        other => other,
    }
}
