//! Client store adapter contract.
//!
//! The embedded store keeps the replica's table data, the durable operation
//! queue, and the per-replica sync metadata. `update` has upsert semantics:
//! authoritative operations from pull and realtime apply blindly.

use async_trait::async_trait;
use serde_json::Value;

use tidepool_core::{Operation, OperationStatus};

use crate::error::Result;

mod memory;
mod sqlite;

pub use memory::MemoryClientStore;
pub use sqlite::SqliteClientStore;

#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Creates data tables and metadata stores. Idempotent.
    async fn init(&self, tables: &[String]) -> Result<()>;

    async fn insert(&self, table: &str, data: Value) -> Result<Value>;

    /// Upserts: updating a missing row creates it.
    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value>;

    /// Removes the row. The client store keeps no tombstones; the server's
    /// delta log replays deletes to late pullers.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    async fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>>;

    async fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>>;

    async fn add_to_queue(&self, operation: &Operation) -> Result<()>;

    /// The durable queue in enqueue order.
    async fn get_queue(&self) -> Result<Vec<Operation>>;

    async fn remove_from_queue(&self, ids: &[String]) -> Result<()>;

    async fn update_queue_status(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn get_last_sync(&self) -> Result<i64>;

    async fn set_last_sync(&self, timestamp: i64) -> Result<()>;

    /// Generated and persisted on first call; stable thereafter.
    async fn get_client_id(&self) -> Result<String>;

    async fn is_initialized(&self) -> Result<bool>;

    async fn set_initialized(&self, initialized: bool) -> Result<()>;
}

/// Field-equality match of a row against a filter document.
pub(crate) fn matches_filter(row: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| row.get(key) == Some(expected)),
        None => true,
    }
}
