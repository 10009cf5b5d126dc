//! In-memory store, used by the test suites and as the reference adapter.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use tidepool_core::{record, time, ClientState, Operation};

use crate::error::{StoreError, StoreResult};
use crate::store::{matches_filter, ServerStore};

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, Value>>,
    sync_log: Vec<(Operation, String)>,
    client_states: HashMap<String, ClientState>,
}

#[derive(Default)]
pub struct MemoryServerStore {
    state: RwLock<MemoryState>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync log entries, oldest first. Test helper.
    pub async fn logged_operations(&self) -> Vec<(Operation, String)> {
        self.state.read().await.sync_log.clone()
    }
}

fn record_id(data: &Value) -> StoreResult<String> {
    data.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidRow("row is missing string `id`".into()))
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn insert(&self, table: &str, data: Value) -> StoreResult<Value> {
        let id = record_id(&data)?;
        let mut state = self.state.write().await;
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                id,
            });
        }
        rows.insert(id, data.clone());
        Ok(data)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        expected_version: i64,
    ) -> StoreResult<Value> {
        let mut state = self.state.write().await;
        let rows = state.tables.entry(table.to_string()).or_default();
        let current = rows.get(id).ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })?;

        let found = record::version(current);
        if found != expected_version {
            return Err(StoreError::VersionMismatch {
                table: table.to_string(),
                id: id.to_string(),
                expected: expected_version,
                found,
            });
        }
        rows.insert(id.to_string(), data.clone());
        Ok(data)
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        deleted_at: i64,
        client_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let rows = state.tables.entry(table.to_string()).or_default();
        let Some(row) = rows.get_mut(id) else {
            return Ok(());
        };
        let already_deleted = record::is_deleted(row);
        let next_version = record::version(row) + 1;
        if let Some(map) = row.as_object_mut() {
            if !already_deleted {
                map.insert(record::VERSION_FIELD.into(), next_version.into());
            }
            map.insert(record::DELETED_FIELD.into(), true.into());
            map.insert(record::UPDATED_AT_FIELD.into(), deleted_at.into());
            map.insert(
                record::CLIENT_ID_FIELD.into(),
                client_id.map(Value::from).unwrap_or(Value::Null),
            );
        }
        Ok(())
    }

    async fn find_one(&self, table: &str, id: &str) -> StoreResult<Option<Value>> {
        let state = self.state.read().await;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn find(&self, table: &str, filter: Option<&Value>) -> StoreResult<Vec<Value>> {
        let state = self.state.read().await;
        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|row| !record::is_deleted(row))
            .filter(|row| filter.is_none_or(|f| matches_filter(row, f)))
            .cloned()
            .collect())
    }

    async fn get_changes_since(
        &self,
        table: &str,
        since: i64,
        filter: Option<&Value>,
        exclude_client_id: Option<&str>,
    ) -> StoreResult<Vec<Value>> {
        let state = self.state.read().await;
        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut changed: Vec<Value> = rows
            .values()
            .filter(|row| record::updated_at(row) > since)
            .filter(|row| filter.is_none_or(|f| matches_filter(row, f)))
            .filter(|row| match (record::client_id(row), exclude_client_id) {
                (Some(origin), Some(excluded)) => origin != excluded,
                _ => true,
            })
            .cloned()
            .collect();
        changed.sort_by_key(record::updated_at);
        Ok(changed)
    }

    async fn batch_insert(&self, table: &str, rows: Vec<Value>) -> StoreResult<()> {
        for row in rows {
            self.insert(table, row).await?;
        }
        Ok(())
    }

    async fn batch_update(&self, table: &str, rows: Vec<(String, Value, i64)>) -> StoreResult<()> {
        for (id, data, expected_version) in rows {
            self.update(table, &id, data, expected_version).await?;
        }
        Ok(())
    }

    async fn check_conflict(
        &self,
        table: &str,
        id: &str,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let current = self.find_one(table, id).await?;
        Ok(current
            .map(|row| record::version(&row) != expected_version)
            .unwrap_or(false))
    }

    async fn log_sync_operation(&self, operation: &Operation, user_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .sync_log
            .push((operation.clone(), user_id.to_string()));
        Ok(())
    }

    async fn update_client_state(&self, client_id: &str, user_id: &str) -> StoreResult<()> {
        let now = time::now_millis();
        let mut state = self.state.write().await;
        state.client_states.insert(
            client_id.to_string(),
            ClientState {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
                last_sync: now,
                last_active: now,
            },
        );
        Ok(())
    }

    async fn get_client_state(&self, client_id: &str) -> StoreResult<Option<ClientState>> {
        let state = self.state.read().await;
        Ok(state.client_states.get(client_id).cloned())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
