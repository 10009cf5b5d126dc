//! Reactive collection view.
//!
//! A `Collection` projects one table of the local replica for UI
//! consumption: mutations apply to the in-memory list immediately and are
//! replaced by the engine's canonical record when it lands; observers watch
//! the state through a `tokio::sync::watch` channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// The engine surface a collection drives. Implemented by the sync engine;
/// split out so views are testable without one.
#[async_trait]
pub trait CollectionBackend: Send + Sync {
    async fn create(&self, table: &str, data: Value) -> Result<Value>;
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value>;
    async fn delete(&self, table: &str, id: &str) -> Result<()>;
    async fn load(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>>;
    async fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>>;
}

/// Observable snapshot of one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionState {
    pub data: Vec<Value>,
    pub is_loading: bool,
    pub error: Option<String>,
}

pub struct Collection {
    table: String,
    backend: Arc<dyn CollectionBackend>,
    state: watch::Sender<CollectionState>,
}

fn value_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

impl Collection {
    pub fn new(table: impl Into<String>, backend: Arc<dyn CollectionBackend>) -> Self {
        let (state, _) = watch::channel(CollectionState::default());
        Self {
            table: table.into(),
            backend,
            state,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Subscribe to state changes; the receiver always holds the latest
    /// snapshot.
    pub fn watch(&self) -> watch::Receiver<CollectionState> {
        self.state.subscribe()
    }

    pub fn data(&self) -> Vec<Value> {
        self.state.borrow().data.clone()
    }

    pub fn count(&self) -> usize {
        self.state.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().data.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    /// Creates a record: the provisional row appears in `data` before the
    /// engine call and is replaced in place by the canonical record.
    pub async fn create(&self, partial: Value) -> Result<Value> {
        let mut provisional = partial;
        if value_id(&provisional).is_none() {
            if let Some(map) = provisional.as_object_mut() {
                map.insert("id".into(), Uuid::new_v4().to_string().into());
            } else {
                return Err(ClientError::InvalidInput("record must be an object".into()));
            }
        }
        let id = value_id(&provisional)
            .map(str::to_string)
            .unwrap_or_default();

        self.state.send_modify(|state| {
            state.data.push(provisional.clone());
            state.error = None;
        });

        match self.backend.create(&self.table, provisional).await {
            Ok(canonical) => {
                self.replace_in_place(&id, canonical.clone());
                Ok(canonical)
            }
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Merges a patch into the entry immediately, then swaps in the
    /// engine's canonical record.
    pub async fn update(&self, id: &str, patch: Value) -> Result<Value> {
        self.state.send_modify(|state| {
            if let Some(entry) = state
                .data
                .iter_mut()
                .find(|entry| value_id(entry) == Some(id))
            {
                *entry = tidepool_core::record::merge_into(entry, &patch);
            }
            state.error = None;
        });

        match self.backend.update(&self.table, id, patch).await {
            Ok(canonical) => {
                self.replace_in_place(id, canonical.clone());
                Ok(canonical)
            }
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Removes the entry immediately. There is no automatic rollback on
    /// failure; callers reload after handling the error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.state.send_modify(|state| {
            state.data.retain(|entry| value_id(entry) != Some(id));
            state.error = None;
        });

        match self.backend.delete(&self.table, id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    pub async fn find_one(&self, id: &str) -> Result<Option<Value>> {
        self.backend.find_one(&self.table, id).await
    }

    /// Re-reads the table from the local store.
    pub async fn load(&self, filter: Option<Value>) -> Result<()> {
        self.state.send_modify(|state| {
            state.is_loading = true;
        });

        let result = self.backend.load(&self.table, filter.as_ref()).await;
        match result {
            Ok(rows) => {
                self.state.send_modify(|state| {
                    state.data = rows;
                    state.is_loading = false;
                    state.error = None;
                });
                Ok(())
            }
            Err(err) => {
                self.state.send_modify(|state| {
                    state.is_loading = false;
                    state.error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    pub async fn reload(&self) -> Result<()> {
        self.load(None).await
    }

    pub fn find<P>(&self, predicate: P) -> Option<Value>
    where
        P: Fn(&Value) -> bool,
    {
        self.state.borrow().data.iter().find(|v| predicate(v)).cloned()
    }

    pub fn filter<P>(&self, predicate: P) -> Vec<Value>
    where
        P: Fn(&Value) -> bool,
    {
        self.state
            .borrow()
            .data
            .iter()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    pub fn map<T, F>(&self, mapper: F) -> Vec<T>
    where
        F: Fn(&Value) -> T,
    {
        self.state.borrow().data.iter().map(mapper).collect()
    }

    pub fn sort<F>(&self, compare: F) -> Vec<Value>
    where
        F: Fn(&Value, &Value) -> std::cmp::Ordering,
    {
        let mut snapshot = self.data();
        snapshot.sort_by(|a, b| compare(a, b));
        snapshot
    }

    pub async fn create_many(&self, records: Vec<Value>) -> Result<Vec<Value>> {
        let mut created = Vec::with_capacity(records.len());
        for record in records {
            created.push(self.create(record).await?);
        }
        Ok(created)
    }

    pub async fn update_many(&self, updates: Vec<(String, Value)>) -> Result<Vec<Value>> {
        let mut updated = Vec::with_capacity(updates.len());
        for (id, patch) in updates {
            updated.push(self.update(&id, patch).await?);
        }
        Ok(updated)
    }

    pub async fn delete_many(&self, ids: Vec<String>) -> Result<()> {
        for id in ids {
            self.delete(&id).await?;
        }
        Ok(())
    }

    fn replace_in_place(&self, id: &str, canonical: Value) {
        self.state.send_modify(|state| {
            match state
                .data
                .iter_mut()
                .find(|entry| value_id(entry) == Some(id))
            {
                Some(entry) => *entry = canonical,
                None => state.data.push(canonical),
            }
        });
    }

    fn record_error(&self, err: &ClientError) {
        self.state.send_modify(|state| {
            state.error = Some(err.to_string());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// Backend stub: canonical records gain a `server: true` marker so the
    /// replace-in-place contract is observable.
    #[derive(Default)]
    struct StubBackend {
        rows: RwLock<HashMap<String, Value>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl StubBackend {
        fn fail_next(&self) {
            self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn take_fail(&self) -> bool {
            self.fail.swap(false, std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CollectionBackend for StubBackend {
        async fn create(&self, _table: &str, mut data: Value) -> Result<Value> {
            if self.take_fail() {
                return Err(ClientError::Network("offline".into()));
            }
            if let Some(map) = data.as_object_mut() {
                map.insert("server".into(), json!(true));
            }
            let id = value_id(&data).unwrap_or_default().to_string();
            self.rows.write().await.insert(id, data.clone());
            Ok(data)
        }

        async fn update(&self, _table: &str, id: &str, patch: Value) -> Result<Value> {
            if self.take_fail() {
                return Err(ClientError::Network("offline".into()));
            }
            let mut rows = self.rows.write().await;
            let current = rows.get(id).cloned().unwrap_or(json!({"id": id}));
            let mut merged = tidepool_core::record::merge_into(&current, &patch);
            if let Some(map) = merged.as_object_mut() {
                map.insert("server".into(), json!(true));
            }
            rows.insert(id.to_string(), merged.clone());
            Ok(merged)
        }

        async fn delete(&self, _table: &str, id: &str) -> Result<()> {
            self.rows.write().await.remove(id);
            Ok(())
        }

        async fn load(&self, _table: &str, _filter: Option<&Value>) -> Result<Vec<Value>> {
            Ok(self.rows.read().await.values().cloned().collect())
        }

        async fn find_one(&self, _table: &str, id: &str) -> Result<Option<Value>> {
            Ok(self.rows.read().await.get(id).cloned())
        }
    }

    fn collection() -> (Arc<StubBackend>, Collection) {
        let backend = Arc::new(StubBackend::default());
        let view = Collection::new("todos", Arc::clone(&backend) as Arc<dyn CollectionBackend>);
        (backend, view)
    }

    #[tokio::test]
    async fn create_replaces_provisional_with_canonical() {
        let (_, view) = collection();

        let created = view.create(json!({"text": "T"})).await.unwrap();
        assert_eq!(created["server"], true);

        let data = view.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["server"], true);
        assert!(value_id(&data[0]).is_some());
    }

    #[tokio::test]
    async fn update_merges_then_swaps_in_canonical() {
        let (_, view) = collection();
        let created = view.create(json!({"id": "r1", "text": "a", "done": false})).await.unwrap();
        assert_eq!(created["done"], false);

        view.update("r1", json!({"done": true})).await.unwrap();
        let data = view.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["done"], true);
        assert_eq!(data[0]["text"], "a");
    }

    #[tokio::test]
    async fn delete_removes_immediately() {
        let (_, view) = collection();
        view.create(json!({"id": "r1"})).await.unwrap();
        view.delete("r1").await.unwrap();
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn failed_create_keeps_optimistic_entry_and_sets_error() {
        let (backend, view) = collection();
        backend.fail_next();

        let result = view.create(json!({"id": "r1", "text": "T"})).await;
        assert!(result.is_err());
        // No automatic rollback: the provisional entry stays until reload.
        assert_eq!(view.count(), 1);
        assert!(view.error().unwrap().contains("offline"));

        view.reload().await.unwrap();
        assert!(view.is_empty());
        assert!(view.error().is_none());
    }

    #[tokio::test]
    async fn watch_observes_changes() {
        let (_, view) = collection();
        let mut receiver = view.watch();
        assert!(receiver.borrow().data.is_empty());

        view.create(json!({"id": "r1"})).await.unwrap();
        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().data.len(), 1);
    }

    #[tokio::test]
    async fn pure_accessors_operate_on_snapshots() {
        let (_, view) = collection();
        view.create(json!({"id": "r1", "rank": 2})).await.unwrap();
        view.create(json!({"id": "r2", "rank": 1})).await.unwrap();

        let found = view.find(|v| v["rank"] == 1).unwrap();
        assert_eq!(found["id"], "r2");

        assert_eq!(view.filter(|v| v["rank"].as_i64().unwrap() > 0).len(), 2);

        let ranks: Vec<i64> = view.map(|v| v["rank"].as_i64().unwrap());
        assert_eq!(ranks.len(), 2);

        let sorted = view.sort(|a, b| a["rank"].as_i64().cmp(&b["rank"].as_i64()));
        assert_eq!(sorted[0]["id"], "r2");
    }

    #[tokio::test]
    async fn bulk_operations_run_sequentially() {
        let (_, view) = collection();
        view.create_many(vec![json!({"id": "r1"}), json!({"id": "r2"})])
            .await
            .unwrap();
        assert_eq!(view.count(), 2);

        view.delete_many(vec!["r1".into(), "r2".into()]).await.unwrap();
        assert!(view.is_empty());
    }
}
