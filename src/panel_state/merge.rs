use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::storage::StorageEnvelope;

/// Stored data overlaid on caller defaults. Stored values win; defaults only
/// fill keys the stored object lacks, recursively for nested objects.
pub fn fill_defaults(defaults: &Value, stored: &Value) -> Value {
    match (defaults, stored) {
        (Value::Object(defaults), Value::Object(stored)) => {
            let mut merged = stored.clone();
            for (key, default) in defaults {
                match merged.get_mut(key) {
                    Some(existing) => *existing = fill_defaults(default, existing),
                    None => {
                        merged.insert(key.clone(), default.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => stored.clone(),
    }
}

/// Union of two object trees where `higher` wins every collision. Scalars and
/// arrays are taken wholesale from `higher`.
pub fn smart_merge(lower: &Value, higher: &Value) -> Value {
    match (lower, higher) {
        (Value::Object(lower), Value::Object(higher)) => {
            let mut merged: Map<String, Value> = lower.clone();
            for (key, value) in higher {
                let next = match merged.get(key) {
                    Some(existing) => smart_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => higher.clone(),
    }
}

/// Top-level shallow patch, the `Partial<T>` update form.
pub fn shallow_patch(base: &Value, patch: &Map<String, Value>) -> Option<Value> {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return None,
    };
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    Some(Value::Object(merged))
}

/// Outcome of reconciling two envelopes for the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub envelope: StorageEnvelope<Value>,
    /// Both sides carried the same version and differing data.
    pub ambiguous: bool,
}

/// Reconcile two envelopes independent of argument order.
///
/// The side with the higher version is dominant; equal versions fall back to
/// the later `updatedAt`, then to the lexicographically greater serialized
/// data. The result keeps the dominant side's version and timestamp.
pub fn resolve_conflict(a: &StorageEnvelope<Value>, b: &StorageEnvelope<Value>) -> Resolution {
    let (lower, higher) = match rank(a, b) {
        Ordering::Greater => (b, a),
        _ => (a, b),
    };
    let ambiguous = lower.version == higher.version && lower.data != higher.data;
    Resolution {
        envelope: StorageEnvelope {
            version: higher.version,
            updated_at: higher.updated_at,
            data: smart_merge(&lower.data, &higher.data),
        },
        ambiguous,
    }
}

fn rank(a: &StorageEnvelope<Value>, b: &StorageEnvelope<Value>) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.updated_at.cmp(&b.updated_at))
        .then_with(|| canonical(&a.data).cmp(&canonical(&b.data)))
}

fn canonical(value: &Value) -> String {
    // serde_json maps are ordered, so this is stable for equal values.
    value.to_string()
}
