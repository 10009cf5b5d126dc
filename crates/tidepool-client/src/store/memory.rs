//! In-memory client store for tests and throwaway replicas. The queue is
//! durable only for the process lifetime.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use tidepool_core::{Operation, OperationStatus};

use crate::error::{ClientError, Result};
use crate::store::{matches_filter, ClientStore};

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    queue: Vec<Operation>,
    client_id: Option<String>,
    last_sync: i64,
    initialized: bool,
}

#[derive(Default)]
pub struct MemoryClientStore {
    state: RwLock<MemoryState>,
}

impl MemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn row_id(data: &Value) -> Result<String> {
    data.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::InvalidInput("row is missing string `id`".into()))
}

#[async_trait]
impl ClientStore for MemoryClientStore {
    async fn init(&self, tables: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for table in tables {
            state.tables.entry(table.clone()).or_default();
        }
        Ok(())
    }

    async fn insert(&self, table: &str, data: Value) -> Result<Value> {
        let id = row_id(&data)?;
        let mut state = self.state.write().await;
        let rows = state.tables.entry(table.to_string()).or_default();
        // Upsert, like the SQLite store: a retried create with the same id
        // must not leave a duplicate row behind.
        match rows
            .iter_mut()
            .find(|row| row.get("id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(row) => *row = data.clone(),
            None => rows.push(data.clone()),
        }
        Ok(data)
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value> {
        let mut state = self.state.write().await;
        let rows = state.tables.entry(table.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
        {
            Some(row) => *row = data.clone(),
            None => rows.push(data.clone()),
        }
        Ok(data)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| row.get("id").and_then(Value::as_str) != Some(id));
        }
        Ok(())
    }

    async fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>> {
        let state = self.state.read().await;
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.is_none_or(|f| matches_filter(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let state = self.state.read().await;
        Ok(state.tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
                .cloned()
        }))
    }

    async fn add_to_queue(&self, operation: &Operation) -> Result<()> {
        let mut state = self.state.write().await;
        state.queue.push(operation.clone());
        Ok(())
    }

    async fn get_queue(&self) -> Result<Vec<Operation>> {
        Ok(self.state.read().await.queue.clone())
    }

    async fn remove_from_queue(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        state.queue.retain(|op| !ids.contains(&op.id));
        Ok(())
    }

    async fn update_queue_status(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(op) = state.queue.iter_mut().find(|op| op.id == id) {
            op.status = status;
            op.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn get_last_sync(&self) -> Result<i64> {
        Ok(self.state.read().await.last_sync)
    }

    async fn set_last_sync(&self, timestamp: i64) -> Result<()> {
        self.state.write().await.last_sync = timestamp;
        Ok(())
    }

    async fn get_client_id(&self) -> Result<String> {
        let mut state = self.state.write().await;
        if state.client_id.is_none() {
            state.client_id = Some(Uuid::new_v4().to_string());
        }
        Ok(state.client_id.clone().unwrap_or_default())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.state.read().await.initialized)
    }

    async fn set_initialized(&self, initialized: bool) -> Result<()> {
        self.state.write().await.initialized = initialized;
        Ok(())
    }
}
