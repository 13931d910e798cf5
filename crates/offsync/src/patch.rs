//! JSON merge patches (RFC 7386) over entity fields.
//!
//! An update payload is a merge patch: object members are merged
//! recursively, `null` removes a member, anything else replaces it. The same
//! functions are used for optimistic application, for rebasing fetched state
//! onto the pending queue, and by the in-memory remote, so all three agree
//! on what an update means.

use serde_json::{Map, Value};

/// Apply `patch` to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_obj) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_obj) = target {
        merge_fields(target_obj, patch_obj);
    }
}

/// Apply a merge patch to an entity's field map.
pub fn merge_fields(fields: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            fields.remove(key);
        } else if value.is_object() {
            let slot = fields.entry(key.clone()).or_insert(Value::Null);
            apply_merge_patch(slot, value);
        } else {
            fields.insert(key.clone(), value.clone());
        }
    }
}

/// Fold `later` into `earlier` so that applying the result equals applying
/// `earlier` then `later`.
///
/// Nested objects compose recursively; `null` and scalars from `later`
/// overwrite.
pub fn compose(earlier: &mut Map<String, Value>, later: &Map<String, Value>) {
    for (key, value) in later {
        match (earlier.get_mut(key), value) {
            (Some(Value::Object(prev)), Value::Object(next)) => compose(prev, next),
            _ => {
                earlier.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Values `fields` currently holds at every path `patch` writes, as a patch.
///
/// Absent paths map to `null`, so applying the snapshot after the patch
/// restores the original state.
pub fn snapshot(fields: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in patch {
        let current = fields.get(key);
        let restored = match (current, value) {
            (Some(Value::Object(cur)), Value::Object(next)) => Value::Object(snapshot(cur, next)),
            (Some(cur), _) => cur.clone(),
            (None, _) => Value::Null,
        };
        out.insert(key.clone(), restored);
    }
    out
}

/// Whether applying `patch` to `fields` would change nothing.
pub fn is_noop(fields: &Map<String, Value>, patch: &Map<String, Value>) -> bool {
    let mut merged = fields.clone();
    merge_fields(&mut merged, patch);
    &merged == fields
}
