//! Server store adapter contract.
//!
//! The sync engine talks to persistence exclusively through [`ServerStore`].
//! Rows are JSON objects; the engine stamps the sync metadata
//! (`_version`, `_updated_at`, `_client_id`, `_is_deleted`) before writes,
//! except for `delete`, where the adapter flips the tombstone itself so a
//! repeated delete can stay a no-op.

use async_trait::async_trait;
use serde_json::Value;

use tidepool_core::{ClientState, Operation};

use crate::error::StoreResult;

mod memory;
mod postgres;

pub use memory::MemoryServerStore;
pub use postgres::PgServerStore;

#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Stores a fully stamped new row. Fails with `Duplicate` when a row
    /// with the same id exists, tombstoned or not.
    async fn insert(&self, table: &str, data: Value) -> StoreResult<Value>;

    /// Replaces the row with the given stamped state, guarded by
    /// `expected_version`: fails with `VersionMismatch` when the stored
    /// `_version` has moved under the caller.
    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        expected_version: i64,
    ) -> StoreResult<Value>;

    /// Soft-deletes: sets `_is_deleted`, stamps `_updated_at` and
    /// `_client_id`, and bumps `_version` once on the first delete.
    /// Idempotent; deleting a missing or already tombstoned row succeeds.
    async fn delete(
        &self,
        table: &str,
        id: &str,
        deleted_at: i64,
        client_id: Option<&str>,
    ) -> StoreResult<()>;

    /// Returns the row (tombstones included), or `None`.
    async fn find_one(&self, table: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Returns live rows matching the filter document (field equality on
    /// the row payload). `None` returns every live row.
    async fn find(&self, table: &str, filter: Option<&Value>) -> StoreResult<Vec<Value>>;

    /// Rows (tombstones included) with `_updated_at > since`, optionally
    /// restricted by a filter document and excluding rows whose
    /// `_client_id` equals `exclude_client_id`. Rows with a null
    /// `_client_id` are never excluded.
    async fn get_changes_since(
        &self,
        table: &str,
        since: i64,
        filter: Option<&Value>,
        exclude_client_id: Option<&str>,
    ) -> StoreResult<Vec<Value>>;

    async fn batch_insert(&self, table: &str, rows: Vec<Value>) -> StoreResult<()>;

    /// Rows as `(id, stamped data, expected_version)` triples.
    async fn batch_update(&self, table: &str, rows: Vec<(String, Value, i64)>) -> StoreResult<()>;

    /// True when the stored `_version` differs from `expected_version`.
    async fn check_conflict(&self, table: &str, id: &str, expected_version: i64)
        -> StoreResult<bool>;

    async fn log_sync_operation(&self, operation: &Operation, user_id: &str) -> StoreResult<()>;

    async fn update_client_state(&self, client_id: &str, user_id: &str) -> StoreResult<()>;

    async fn get_client_state(&self, client_id: &str) -> StoreResult<Option<ClientState>>;

    /// Cheap readiness probe for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// True when the row satisfies every field of the filter document.
pub(crate) fn matches_filter(row: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| row.get(key) == Some(expected)),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_on_field_equality() {
        let row = json!({"id": "r1", "user_id": "u1", "done": false});
        assert!(matches_filter(&row, &json!({"user_id": "u1"})));
        assert!(!matches_filter(&row, &json!({"user_id": "u2"})));
        assert!(matches_filter(&row, &json!({"user_id": "u1", "done": false})));
        assert!(!matches_filter(&row, &json!({"missing": 1})));
    }
}
