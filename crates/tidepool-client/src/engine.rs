//! Client sync engine.
//!
//! Orchestrates the local-first write path (optimistic store write plus a
//! durable queued operation), the periodic sync cycle (push, pull, conflict
//! resolution), realtime-driven authoritative applies, and the reactive
//! collection registry. One engine instance per replica; all long-lived
//! handles it spawns are released in `destroy`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tidepool_core::{
    record, time, Conflict, ConflictStrategy, Operation, OperationKind, OperationStatus,
};

use crate::collection::{Collection, CollectionBackend};
use crate::config::SyncOptions;
use crate::coordinator::{Coordinator, CoordinatorMessage};
use crate::error::{ClientError, Result};
use crate::realtime::RealtimeClient;
use crate::remote::RemoteSync;
use crate::store::ClientStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Conflict,
    Offline,
}

pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

pub struct SyncEngine {
    store: Arc<dyn ClientStore>,
    remote: Arc<dyn RemoteSync>,
    coordinator: Arc<dyn Coordinator>,
    options: SyncOptions,
    tables: Vec<String>,

    self_ref: Weak<SyncEngine>,
    client_id: OnceLock<String>,
    last_sync: AtomicI64,
    conflicts: Mutex<Vec<Conflict>>,
    init_started: AtomicBool,
    initialized: AtomicBool,
    is_syncing: AtomicBool,
    status: watch::Sender<SyncStatus>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    realtime: Mutex<Option<Arc<RealtimeClient>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    on_error: std::sync::Mutex<Option<ErrorCallback>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ClientStore>,
        remote: Arc<dyn RemoteSync>,
        coordinator: Arc<dyn Coordinator>,
        tables: Vec<String>,
        options: SyncOptions,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Arc::new_cyclic(|self_ref| Self {
            store,
            remote,
            coordinator,
            options,
            tables,
            self_ref: self_ref.clone(),
            client_id: OnceLock::new(),
            last_sync: AtomicI64::new(0),
            conflicts: Mutex::new(Vec::new()),
            init_started: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            is_syncing: AtomicBool::new(false),
            status,
            collections: RwLock::new(HashMap::new()),
            ticker: Mutex::new(None),
            realtime: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            on_error: std::sync::Mutex::new(None),
        })
    }

    pub fn set_on_error(&self, callback: ErrorCallback) {
        *self.on_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn last_sync(&self) -> i64 {
        self.last_sync.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> Result<String> {
        self.client_id
            .get()
            .cloned()
            .ok_or(ClientError::NotInitialized)
    }

    /// Unresolved conflicts awaiting the local policy (or `manual` input).
    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.lock().await.clone()
    }

    /// The durable queue entries still awaiting push.
    pub async fn pending_operations(&self) -> Result<Vec<Operation>> {
        Ok(self
            .store
            .get_queue()
            .await?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::NotInitialized)
        }
    }

    fn set_status(&self, status: SyncStatus) {
        let _ = self.status.send(status);
    }

    fn emit_error(&self, err: &ClientError) {
        let callback = self
            .on_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }

    /// Upgrading cannot fail while a method runs: the only constructor
    /// hands out `Arc`s, so a live `&self` implies a live strong count.
    fn self_arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("engine accessed outside an Arc")
    }

    /// Loads replica identity, runs the one-time bootstrap pull, then
    /// starts the auto-sync ticker, coordinator listener and realtime
    /// stream. Idempotent within the engine's lifetime; a failure here is
    /// fatal for the engine.
    pub async fn init(&self) -> Result<()> {
        if self.init_started.swap(true, Ordering::SeqCst) {
            tracing::warn!("sync engine already initialized");
            return Ok(());
        }

        self.store.init(&self.tables).await?;

        let client_id = self.store.get_client_id().await?;
        let _ = self.client_id.set(client_id.clone());
        self.last_sync
            .store(self.store.get_last_sync().await?, Ordering::SeqCst);

        if !self.store.is_initialized().await? {
            self.bootstrap_pull(&client_id).await?;
            self.store.set_initialized(true).await?;
        }

        self.initialized.store(true, Ordering::SeqCst);

        self.start_ticker().await;
        self.start_coordinator_listener().await;
        self.start_realtime(&client_id).await;

        tracing::debug!(client_id, "sync engine initialized");
        Ok(())
    }

    async fn bootstrap_pull(&self, client_id: &str) -> Result<()> {
        let operations = self.remote.pull(0, client_id).await?;
        let mut max_timestamp = self.last_sync.load(Ordering::SeqCst);

        for operation in &operations {
            max_timestamp = max_timestamp.max(operation.timestamp);
            if operation.client_id == client_id {
                continue;
            }
            self.apply_operation_to_store(operation).await?;
        }

        self.store.set_last_sync(max_timestamp).await?;
        self.last_sync.store(max_timestamp, Ordering::SeqCst);
        Ok(())
    }

    async fn start_ticker(&self) {
        if !self.options.auto_sync_enabled() {
            return;
        }
        let engine = self.self_arc();
        let period = Duration::from_millis(self.options.sync_interval_ms as u64);
        *self.ticker.lock().await = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // the first tick fires immediately; skip it
            loop {
                tick.tick().await;
                if let Err(err) = engine.sync(false).await {
                    tracing::error!(error = %err, "auto-sync failed");
                }
            }
        }));
    }

    async fn start_coordinator_listener(&self) {
        let mut messages = self.coordinator.subscribe();
        let engine = self.self_arc();
        let handle = tokio::spawn(async move {
            while let Ok(message) = messages.recv().await {
                match message {
                    CoordinatorMessage::DataChanged { table, .. } => {
                        engine.reload_collection(&table).await;
                    }
                    CoordinatorMessage::SyncComplete => {
                        engine.reload_all_collections().await;
                    }
                }
            }
        });
        self.background.lock().await.push(handle);
    }

    async fn start_realtime(&self, client_id: &str) {
        if !self.options.realtime.enabled {
            return;
        }

        let (sender, mut receiver) = mpsc::channel::<Vec<Operation>>(32);
        let engine = self.self_arc();
        let consumer = tokio::spawn(async move {
            while let Some(operations) = receiver.recv().await {
                engine.apply_remote_batch(operations).await;
            }
        });
        self.background.lock().await.push(consumer);

        let client = RealtimeClient::new(
            self.options.realtime.clone(),
            client_id,
            self.options.realtime.user_id.clone(),
            sender,
        );
        client.connect().await;
        *self.realtime.lock().await = Some(client);
    }

    pub async fn realtime_client(&self) -> Option<Arc<RealtimeClient>> {
        self.realtime.lock().await.clone()
    }

    /// Local-first create: the row lands in the client store and the
    /// operation in the durable queue before any network traffic.
    pub async fn create(&self, table: &str, data: Value) -> Result<Value> {
        self.ensure_initialized()?;

        let mut row = data;
        let map = row
            .as_object_mut()
            .ok_or_else(|| ClientError::InvalidInput("record must be an object".into()))?;
        if !map.contains_key("id") {
            map.insert("id".into(), Uuid::new_v4().to_string().into());
        }
        map.insert(record::VERSION_FIELD.into(), json!(1));

        self.store.insert(table, row.clone()).await?;
        self.enqueue(table, OperationKind::Insert, row.clone(), 1)
            .await?;
        self.coordinator.broadcast(CoordinatorMessage::DataChanged {
            table: table.to_string(),
            kind: OperationKind::Insert,
            data: row.clone(),
        });
        self.maybe_sync_now().await;
        Ok(row)
    }

    /// Local-first update; the queued operation carries
    /// `observed server version + 1`.
    pub async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        self.ensure_initialized()?;

        let current = self
            .store
            .find_one(table, id)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("record {id} in {table}")))?;
        let next_version = record::version(&current) + 1;

        let mut merged = record::merge_into(&current, &patch);
        if let Some(map) = merged.as_object_mut() {
            map.insert(record::VERSION_FIELD.into(), json!(next_version));
        }

        self.store.update(table, id, merged.clone()).await?;
        self.enqueue(table, OperationKind::Update, merged.clone(), next_version)
            .await?;
        self.coordinator.broadcast(CoordinatorMessage::DataChanged {
            table: table.to_string(),
            kind: OperationKind::Update,
            data: merged.clone(),
        });
        self.maybe_sync_now().await;
        Ok(merged)
    }

    /// Local-first delete. The version on the queued operation is advisory.
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.ensure_initialized()?;

        let current = self.store.find_one(table, id).await?;
        let version = current.as_ref().map(record::version).unwrap_or(0);

        self.store.delete(table, id).await?;
        self.enqueue(table, OperationKind::Delete, json!({ "id": id }), version)
            .await?;
        self.coordinator.broadcast(CoordinatorMessage::DataChanged {
            table: table.to_string(),
            kind: OperationKind::Delete,
            data: json!({ "id": id }),
        });
        self.maybe_sync_now().await;
        Ok(())
    }

    async fn enqueue(
        &self,
        table: &str,
        kind: OperationKind,
        data: Value,
        version: i64,
    ) -> Result<()> {
        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            table: table.to_string(),
            kind,
            data,
            timestamp: time::now_millis(),
            client_id: self.client_id()?,
            version,
            status: OperationStatus::Pending,
            error: None,
            user_id: None,
        };
        self.store.add_to_queue(&operation).await
    }

    async fn maybe_sync_now(&self) {
        if self.options.sync_after_mutation() {
            // The local write already succeeded; a failing synchronous sync
            // surfaces through status and on_error, not through the mutation.
            if let Err(err) = self.sync(false).await {
                tracing::warn!(error = %err, "post-mutation sync failed");
            }
        }
    }

    /// One sync cycle: push pending operations, pull the delta, resolve
    /// surfaced conflicts, notify co-located replicas.
    pub async fn sync(&self, force: bool) -> Result<()> {
        self.ensure_initialized()?;

        if self.is_syncing.swap(true, Ordering::SeqCst) && !force {
            return Ok(());
        }
        self.set_status(SyncStatus::Syncing);

        let outcome = self.run_cycle().await;
        self.is_syncing.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                let pending_conflicts = !self.conflicts.lock().await.is_empty();
                self.coordinator.broadcast(CoordinatorMessage::SyncComplete);
                self.set_status(if pending_conflicts {
                    SyncStatus::Conflict
                } else {
                    SyncStatus::Idle
                });
                Ok(())
            }
            Err(err) => {
                self.set_status(match err {
                    ClientError::Network(_) => SyncStatus::Offline,
                    _ => SyncStatus::Error,
                });
                self.emit_error(&err);
                Err(err)
            }
        }
    }

    async fn run_cycle(&self) -> Result<()> {
        self.push_phase().await?;
        self.pull_phase().await?;
        if !self.conflicts.lock().await.is_empty() {
            self.resolve_conflicts().await?;
        }
        self.reload_all_collections().await;
        Ok(())
    }

    async fn push_phase(&self) -> Result<()> {
        let pending: Vec<Operation> = self
            .store
            .get_queue()
            .await?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        for batch in pending.chunks(self.options.batch_size.max(1)) {
            let result = self.remote.push(batch.to_vec()).await?;

            if !result.synced.is_empty() {
                self.store.remove_from_queue(&result.synced).await?;
            }
            if !result.conflicts.is_empty() {
                self.set_status(SyncStatus::Conflict);
                self.conflicts.lock().await.extend(result.conflicts);
            }
            for failure in &result.errors {
                self.store
                    .update_queue_status(&failure.id, OperationStatus::Error, Some(&failure.error))
                    .await?;
            }
        }
        Ok(())
    }

    async fn pull_phase(&self) -> Result<()> {
        let client_id = self.client_id()?;
        let since = self.last_sync.load(Ordering::SeqCst);
        let operations = self.remote.pull(since, &client_id).await?;

        let mut max_timestamp = since;
        for operation in &operations {
            max_timestamp = max_timestamp.max(operation.timestamp);
            if operation.client_id == client_id {
                continue;
            }
            if let Err(err) = self.apply_operation_to_store(operation).await {
                tracing::warn!(
                    op_id = %operation.id,
                    error = %err,
                    "failed to apply pulled operation"
                );
            }
        }

        if max_timestamp > since {
            self.store.set_last_sync(max_timestamp).await?;
            self.last_sync.store(max_timestamp, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn apply_operation_to_store(&self, operation: &Operation) -> Result<()> {
        let id = operation
            .record_id()
            .ok_or_else(|| ClientError::InvalidInput("operation data is missing `id`".into()))?;
        match operation.kind {
            // Upsert keeps replays idempotent; inserts and updates land the
            // same way.
            OperationKind::Insert | OperationKind::Update => {
                self.store
                    .update(&operation.table, id, operation.data.clone())
                    .await?;
            }
            OperationKind::Delete => {
                self.store.delete(&operation.table, id).await?;
            }
        }
        Ok(())
    }

    async fn resolve_conflicts(&self) -> Result<()> {
        let drained: Vec<Conflict> = std::mem::take(&mut *self.conflicts.lock().await);
        let mut still_pending: Vec<Conflict> = Vec::new();

        for conflict in drained {
            let resolved = match self.options.conflict_resolution {
                ConflictStrategy::ClientWins => Some(conflict.operation.clone()),
                ConflictStrategy::ServerWins => {
                    let mut operation = conflict.operation.clone();
                    operation.data = conflict.server_data.clone();
                    Some(operation)
                }
                ConflictStrategy::LastWriteWins => {
                    // The client payload carries no `_updated_at`; its side
                    // of the comparison is the operation's own wall clock.
                    let server_wins = record::updated_at(&conflict.server_data)
                        > conflict.operation.timestamp;
                    let mut operation = conflict.operation.clone();
                    if server_wins {
                        operation.data = conflict.server_data.clone();
                    }
                    Some(operation)
                }
                ConflictStrategy::Manual => match self.remote.resolve(conflict.clone()).await {
                    Ok(operation) => Some(operation),
                    Err(err) => {
                        tracing::debug!(error = %err, "manual resolution unavailable");
                        still_pending.push(conflict.clone());
                        None
                    }
                },
            };

            let Some(operation) = resolved else {
                continue;
            };
            if let Some(id) = operation.record_id() {
                self.store
                    .update(&operation.table, id, operation.data.clone())
                    .await?;
            }
            self.store
                .remove_from_queue(std::slice::from_ref(&conflict.operation.id))
                .await?;
        }

        *self.conflicts.lock().await = still_pending;
        Ok(())
    }

    /// Applies a realtime batch of authoritative operations: echoes are
    /// discarded, affected views reload, co-located replicas are notified.
    pub async fn apply_remote_batch(&self, operations: Vec<Operation>) {
        let Ok(client_id) = self.client_id() else {
            return;
        };

        let mut max_timestamp = self.last_sync.load(Ordering::SeqCst);
        let mut touched: HashSet<String> = HashSet::new();

        for operation in &operations {
            max_timestamp = max_timestamp.max(operation.timestamp);
            if operation.client_id == client_id {
                continue;
            }
            match self.apply_operation_to_store(operation).await {
                Ok(()) => {
                    touched.insert(operation.table.clone());
                }
                Err(err) => {
                    tracing::warn!(op_id = %operation.id, error = %err, "realtime apply failed");
                }
            }
        }

        if max_timestamp > self.last_sync.load(Ordering::SeqCst) {
            if let Err(err) = self.store.set_last_sync(max_timestamp).await {
                tracing::warn!(error = %err, "failed to persist last_sync");
            }
            self.last_sync.store(max_timestamp, Ordering::SeqCst);
        }

        for table in touched {
            self.reload_collection(&table).await;
        }
        if !operations.is_empty() {
            self.coordinator.broadcast(CoordinatorMessage::SyncComplete);
        }
    }

    /// The reactive view over one table, created on first use.
    pub async fn collection(&self, table: &str) -> Arc<Collection> {
        if let Some(existing) = self.collections.read().await.get(table) {
            return Arc::clone(existing);
        }
        let mut registry = self.collections.write().await;
        // A racer may have inserted between the locks.
        if let Some(existing) = registry.get(table) {
            return Arc::clone(existing);
        }
        let collection = Arc::new(Collection::new(
            table,
            self.self_arc() as Arc<dyn CollectionBackend>,
        ));
        registry.insert(table.to_string(), Arc::clone(&collection));
        collection
    }

    async fn reload_collection(&self, table: &str) {
        let collection = self.collections.read().await.get(table).cloned();
        if let Some(collection) = collection {
            if let Err(err) = collection.reload().await {
                tracing::warn!(table, error = %err, "collection reload failed");
            }
        }
    }

    async fn reload_all_collections(&self) {
        let collections: Vec<Arc<Collection>> =
            self.collections.read().await.values().cloned().collect();
        for collection in collections {
            if let Err(err) = collection.reload().await {
                tracing::warn!(table = collection.table(), error = %err, "collection reload failed");
            }
        }
    }

    /// Stops the ticker, the coordinator channel and the realtime stream.
    /// The client store is left intact.
    pub async fn destroy(&self) {
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.abort();
        }
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(realtime) = self.realtime.lock().await.take() {
            realtime.destroy().await;
        }
        self.coordinator.close();
    }
}

#[async_trait]
impl CollectionBackend for SyncEngine {
    async fn create(&self, table: &str, data: Value) -> Result<Value> {
        SyncEngine::create(self, table, data).await
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        SyncEngine::update(self, table, id, patch).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        SyncEngine::delete(self, table, id).await
    }

    async fn load(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>> {
        self.store.find(table, filter).await
    }

    async fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>> {
        self.store.find_one(table, id).await
    }
}
