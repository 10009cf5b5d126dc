//! Server-side record metadata.
//!
//! Every synced row carries four metadata fields beyond its domain columns.
//! Rows travel as JSON objects; these helpers read and stamp the metadata
//! without a typed row struct, since table shapes are user-defined.

use serde_json::{json, Map, Value};

pub const VERSION_FIELD: &str = "_version";
pub const UPDATED_AT_FIELD: &str = "_updated_at";
pub const CLIENT_ID_FIELD: &str = "_client_id";
pub const DELETED_FIELD: &str = "_is_deleted";

/// Stored `_version`, defaulting to 0 when absent or malformed.
pub fn version(row: &Value) -> i64 {
    row.get(VERSION_FIELD).and_then(Value::as_i64).unwrap_or(0)
}

/// Stored `_updated_at` unix milliseconds, 0 when absent.
pub fn updated_at(row: &Value) -> i64 {
    row.get(UPDATED_AT_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Originating replica id, `None` for server-originated writes.
pub fn client_id(row: &Value) -> Option<&str> {
    row.get(CLIENT_ID_FIELD).and_then(Value::as_str)
}

pub fn is_deleted(row: &Value) -> bool {
    row.get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Stamps the metadata for a freshly inserted row: `_version = 1`, the
/// given server instant, the originating replica, not deleted.
pub fn stamp_insert(row: &mut Value, updated_at: i64, client_id: Option<&str>) {
    set_meta(row, 1, updated_at, client_id, false);
}

/// Stamps the metadata for an accepted update on top of the stored row.
pub fn stamp_update(row: &mut Value, next_version: i64, updated_at: i64, client_id: Option<&str>) {
    set_meta(row, next_version, updated_at, client_id, false);
}

fn set_meta(row: &mut Value, version: i64, updated_at: i64, client_id: Option<&str>, deleted: bool) {
    if let Some(map) = row.as_object_mut() {
        map.insert(VERSION_FIELD.into(), json!(version));
        map.insert(UPDATED_AT_FIELD.into(), json!(updated_at));
        map.insert(
            CLIENT_ID_FIELD.into(),
            client_id.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert(DELETED_FIELD.into(), json!(deleted));
    }
}

/// Shallow-merges `patch`'s fields over `base`, leaving `base`'s other
/// fields (including metadata) in place. Non-object inputs replace wholesale.
pub fn merge_into(base: &Value, patch: &Value) -> Value {
    match (base.as_object(), patch.as_object()) {
        (Some(base_map), Some(patch_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in patch_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

/// Returns a copy of the row without the sync metadata fields.
pub fn strip_meta(row: &Value) -> Value {
    match row.as_object() {
        Some(map) => {
            let stripped: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| {
                    !matches!(
                        key.as_str(),
                        VERSION_FIELD | UPDATED_AT_FIELD | CLIENT_ID_FIELD | DELETED_FIELD
                    )
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(stripped)
        }
        None => row.clone(),
    }
}

/// Restricts an object row to the named columns; `id` and the sync metadata
/// always survive the projection.
pub fn project_columns(row: &Value, columns: &[String]) -> Value {
    match row.as_object() {
        Some(map) => {
            let projected: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| {
                    key.as_str() == "id"
                        || matches!(
                            key.as_str(),
                            VERSION_FIELD | UPDATED_AT_FIELD | CLIENT_ID_FIELD | DELETED_FIELD
                        )
                        || columns.iter().any(|column| column == key.as_str())
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(projected)
        }
        None => row.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_insert_sets_all_fields() {
        let mut row = json!({"id": "r1", "text": "hi"});
        stamp_insert(&mut row, 42, Some("c1"));
        assert_eq!(version(&row), 1);
        assert_eq!(updated_at(&row), 42);
        assert_eq!(client_id(&row), Some("c1"));
        assert!(!is_deleted(&row));
    }

    #[test]
    fn server_writes_carry_null_client_id() {
        let mut row = json!({"id": "r1"});
        stamp_insert(&mut row, 1, None);
        assert_eq!(row[CLIENT_ID_FIELD], Value::Null);
        assert_eq!(client_id(&row), None);
    }

    #[test]
    fn merge_keeps_unpatched_fields() {
        let base = json!({"id": "r1", "a": 1, "b": 2, "_version": 3});
        let patch = json!({"b": 9, "c": 7});
        let merged = merge_into(&base, &patch);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 9);
        assert_eq!(merged["c"], 7);
        assert_eq!(merged["_version"], 3);
    }

    #[test]
    fn strip_meta_removes_only_metadata() {
        let row = json!({
            "id": "r1", "text": "hi",
            "_version": 2, "_updated_at": 5, "_client_id": "c1", "_is_deleted": false
        });
        let stripped = strip_meta(&row);
        assert_eq!(stripped, json!({"id": "r1", "text": "hi"}));
    }

    #[test]
    fn projection_always_keeps_id_and_meta() {
        let row = json!({
            "id": "r1", "text": "hi", "secret": "x",
            "_version": 2, "_updated_at": 5, "_client_id": null, "_is_deleted": false
        });
        let projected = project_columns(&row, &["text".to_string()]);
        assert_eq!(projected["id"], "r1");
        assert_eq!(projected["text"], "hi");
        assert_eq!(projected["_version"], 2);
        assert!(projected.get("secret").is_none());
    }

    #[test]
    fn missing_metadata_reads_as_defaults() {
        let row = json!({"id": "r1"});
        assert_eq!(version(&row), 0);
        assert_eq!(updated_at(&row), 0);
        assert!(!is_deleted(&row));
    }
}
