//! Client engine cycles against a scripted remote.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use tidepool_client::{
    ClientError, ClientStore, Coordinator, MemoryClientStore, NoopCoordinator, RemoteSync,
    SyncEngine, SyncOptions, SyncStatus,
};
use tidepool_core::{
    record, Conflict, ConflictStrategy, Operation, OperationKind, OperationStatus, PushError,
    PushResult,
};

/// Scripted remote: queued pull batches and push results, with a recording
/// of everything the engine sent.
#[derive(Default)]
struct ScriptedRemote {
    pull_batches: Mutex<VecDeque<Vec<Operation>>>,
    push_results: Mutex<VecDeque<PushResult>>,
    pushed: Mutex<Vec<Vec<Operation>>>,
    pull_calls: AtomicUsize,
    fail_push: AtomicBool,
    resolve_with: Mutex<Option<Operation>>,
}

impl ScriptedRemote {
    fn queue_pull(&self, operations: Vec<Operation>) {
        self.pull_batches.try_lock().unwrap().push_back(operations);
    }

    fn queue_push_result(&self, result: PushResult) {
        self.push_results.try_lock().unwrap().push_back(result);
    }

    fn pushed_batches(&self) -> Vec<Vec<Operation>> {
        self.pushed.try_lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSync for ScriptedRemote {
    async fn push(&self, operations: Vec<Operation>) -> tidepool_client::Result<PushResult> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(ClientError::Network("connection refused".into()));
        }
        self.pushed.lock().await.push(operations.clone());
        let scripted = self.push_results.lock().await.pop_front();
        Ok(scripted.unwrap_or_else(|| PushResult {
            success: true,
            synced: operations.iter().map(|op| op.id.clone()).collect(),
            conflicts: Vec::new(),
            errors: Vec::new(),
        }))
    }

    async fn pull(&self, _since: i64, _client_id: &str) -> tidepool_client::Result<Vec<Operation>> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pull_batches
            .lock()
            .await
            .pop_front()
            .unwrap_or_default())
    }

    async fn resolve(&self, conflict: Conflict) -> tidepool_client::Result<Operation> {
        match self.resolve_with.lock().await.clone() {
            Some(operation) => Ok(operation),
            None => {
                let _ = conflict;
                Err(ClientError::NotImplemented("manual resolution".into()))
            }
        }
    }
}

fn options(strategy: ConflictStrategy) -> SyncOptions {
    SyncOptions {
        sync_interval_ms: -1, // no ticker during tests
        conflict_resolution: strategy,
        ..SyncOptions::default()
    }
}

async fn engine_with(
    strategy: ConflictStrategy,
) -> (
    Arc<MemoryClientStore>,
    Arc<ScriptedRemote>,
    Arc<SyncEngine>,
) {
    let store = Arc::new(MemoryClientStore::new());
    let remote = Arc::new(ScriptedRemote::default());
    let engine = SyncEngine::new(
        Arc::clone(&store) as Arc<dyn ClientStore>,
        Arc::clone(&remote) as Arc<dyn RemoteSync>,
        Arc::new(NoopCoordinator::new()) as Arc<dyn Coordinator>,
        vec!["todos".to_string()],
        options(strategy),
    );
    (store, remote, engine)
}

fn authoritative_op(kind: OperationKind, data: Value, client_id: &str, timestamp: i64) -> Operation {
    Operation {
        id: format!("srv-{timestamp}-{client_id}"),
        table: "todos".into(),
        kind,
        data,
        timestamp,
        client_id: client_id.into(),
        version: 1,
        status: OperationStatus::Synced,
        error: None,
        user_id: None,
    }
}

#[tokio::test]
async fn mutations_require_init() {
    let (_store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    let err = engine.create("todos", json!({"text": "T"})).await.unwrap_err();
    assert!(matches!(err, ClientError::NotInitialized));
}

#[tokio::test]
async fn init_bootstraps_once_and_is_idempotent() {
    let (store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    remote.queue_pull(vec![authoritative_op(
        OperationKind::Update,
        json!({"id": "seed-1", "text": "from-server", "_version": 1}),
        "other-client",
        5_000,
    )]);

    engine.init().await.unwrap();

    let row = store.find_one("todos", "seed-1").await.unwrap().unwrap();
    assert_eq!(row["text"], "from-server");
    assert_eq!(engine.last_sync(), 5_000);
    assert!(store.is_initialized().await.unwrap());

    // Second init is a warning, not a second bootstrap.
    engine.init().await.unwrap();
    assert_eq!(remote.pull_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn create_is_optimistic_and_enqueues() {
    let (store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let created = engine
        .create("todos", json!({"text": "buy milk"}))
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();
    assert_eq!(record::version(&created), 1);

    let stored = store.find_one("todos", id).await.unwrap().unwrap();
    assert_eq!(stored["text"], "buy milk");

    let pending = engine.pending_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Insert);
    assert_eq!(pending[0].version, 1);
    assert_eq!(pending[0].client_id, engine.client_id().unwrap());
}

#[tokio::test]
async fn update_carries_observed_version_plus_one() {
    let (_store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let created = engine.create("todos", json!({"text": "a"})).await.unwrap();
    let id = created["id"].as_str().unwrap();

    let updated = engine
        .update("todos", id, json!({"text": "b"}))
        .await
        .unwrap();
    assert_eq!(record::version(&updated), 2);
    assert_eq!(updated["text"], "b");

    let pending = engine.pending_operations().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[1].kind, OperationKind::Update);
    assert_eq!(pending[1].version, 2);
}

#[tokio::test]
async fn update_of_missing_record_fails() {
    let (_store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let err = engine
        .update("todos", "ghost", json!({"text": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));
}

#[tokio::test]
async fn sync_pushes_pending_and_prunes_the_queue() {
    let (_store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    engine.create("todos", json!({"text": "a"})).await.unwrap();
    engine.create("todos", json!({"text": "b"})).await.unwrap();

    engine.sync(false).await.unwrap();

    let batches = remote.pushed_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert!(engine.pending_operations().await.unwrap().is_empty());
    assert_eq!(engine.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn push_respects_batch_size() {
    let store = Arc::new(MemoryClientStore::new());
    let remote = Arc::new(ScriptedRemote::default());
    let engine = SyncEngine::new(
        Arc::clone(&store) as Arc<dyn ClientStore>,
        Arc::clone(&remote) as Arc<dyn RemoteSync>,
        Arc::new(NoopCoordinator::new()) as Arc<dyn Coordinator>,
        vec!["todos".to_string()],
        SyncOptions {
            sync_interval_ms: -1,
            batch_size: 1,
            ..SyncOptions::default()
        },
    );
    engine.init().await.unwrap();

    for text in ["a", "b", "c"] {
        engine.create("todos", json!({"text": text})).await.unwrap();
    }
    engine.sync(false).await.unwrap();

    let batches = remote.pushed_batches();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|batch| batch.len() == 1));
}

#[tokio::test]
async fn push_errors_mark_queue_entries() {
    let (store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    engine.create("todos", json!({"text": "a"})).await.unwrap();
    let pending = engine.pending_operations().await.unwrap();
    let op_id = pending[0].id.clone();

    remote.queue_push_result(PushResult {
        success: false,
        synced: vec![],
        conflicts: vec![],
        errors: vec![PushError {
            id: op_id,
            error: "Access denied".into(),
        }],
    });

    engine.sync(false).await.unwrap();

    // Errored entries leave pending status but stay in the durable queue,
    // marked with the server's message.
    assert!(engine.pending_operations().await.unwrap().is_empty());
    let queue = store.get_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].status, OperationStatus::Error);
    assert_eq!(queue[0].error.as_deref(), Some("Access denied"));
}

#[tokio::test]
async fn conflicts_resolve_client_wins() {
    let (store, remote, engine) = engine_with(ConflictStrategy::ClientWins).await;
    engine.init().await.unwrap();

    let created = engine.create("todos", json!({"text": "client"})).await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let pending = engine.pending_operations().await.unwrap();

    remote.queue_push_result(PushResult {
        success: false,
        synced: vec![],
        conflicts: vec![Conflict::new(
            pending[0].clone(),
            json!({"id": id, "text": "server", "_updated_at": 99, "_version": 4}),
        )],
        errors: vec![],
    });

    engine.sync(false).await.unwrap();

    // Client wins: local data stays, op acknowledged out of the queue.
    let row = store.find_one("todos", &id).await.unwrap().unwrap();
    assert_eq!(row["text"], "client");
    assert!(store.get_queue().await.unwrap().is_empty());
    assert!(engine.conflicts().await.is_empty());
    assert_eq!(engine.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn conflicts_resolve_server_wins() {
    let (store, remote, engine) = engine_with(ConflictStrategy::ServerWins).await;
    engine.init().await.unwrap();

    let created = engine.create("todos", json!({"text": "client"})).await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let pending = engine.pending_operations().await.unwrap();

    remote.queue_push_result(PushResult {
        success: false,
        synced: vec![],
        conflicts: vec![Conflict::new(
            pending[0].clone(),
            json!({"id": id, "text": "server", "_updated_at": 99, "_version": 4}),
        )],
        errors: vec![],
    });

    engine.sync(false).await.unwrap();

    let row = store.find_one("todos", &id).await.unwrap().unwrap();
    assert_eq!(row["text"], "server");
    assert!(store.get_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn lww_conflict_server_wins_when_server_copy_is_newer() {
    let (store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let created = engine.create("todos", json!({"text": "client"})).await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let pending = engine.pending_operations().await.unwrap();

    // Server copy postdates the operation's wall clock: server wins.
    remote.queue_push_result(PushResult {
        success: false,
        synced: vec![],
        conflicts: vec![Conflict::new(
            pending[0].clone(),
            json!({"id": id, "text": "server", "_updated_at": i64::MAX, "_version": 4}),
        )],
        errors: vec![],
    });

    engine.sync(false).await.unwrap();
    let row = store.find_one("todos", &id).await.unwrap().unwrap();
    assert_eq!(row["text"], "server");
    assert!(store.get_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn lww_conflict_client_wins_when_its_write_is_newer() {
    let (store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let created = engine.create("todos", json!({"text": "client"})).await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let pending = engine.pending_operations().await.unwrap();
    // Conflicts arrive exactly as the server builds them: client_data is
    // the operation payload, which never carries `_updated_at`.
    assert!(pending[0].data.get("_updated_at").is_none());

    // Server copy predates the operation's wall clock: client wins.
    remote.queue_push_result(PushResult {
        success: false,
        synced: vec![],
        conflicts: vec![Conflict::new(
            pending[0].clone(),
            json!({"id": id, "text": "server", "_updated_at": 1, "_version": 4}),
        )],
        errors: vec![],
    });

    engine.sync(false).await.unwrap();
    let row = store.find_one("todos", &id).await.unwrap().unwrap();
    assert_eq!(row["text"], "client");
    assert!(store.get_queue().await.unwrap().is_empty());
    assert!(engine.conflicts().await.is_empty());
}

#[tokio::test]
async fn manual_strategy_without_resolver_leaves_conflict_pending() {
    let (_store, remote, engine) = engine_with(ConflictStrategy::Manual).await;
    engine.init().await.unwrap();

    let created = engine.create("todos", json!({"text": "client"})).await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let pending = engine.pending_operations().await.unwrap();

    remote.queue_push_result(PushResult {
        success: false,
        synced: vec![],
        conflicts: vec![Conflict::new(
            pending[0].clone(),
            json!({"id": id, "text": "server"}),
        )],
        errors: vec![],
    });

    engine.sync(false).await.unwrap();

    assert_eq!(engine.conflicts().await.len(), 1);
    assert_eq!(engine.status(), SyncStatus::Conflict);
}

#[tokio::test]
async fn pull_applies_foreign_operations_and_skips_echoes() {
    let (store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();
    let own_id = engine.client_id().unwrap();

    remote.queue_pull(vec![
        authoritative_op(
            OperationKind::Update,
            json!({"id": "mine", "text": "echo"}),
            &own_id,
            2_000,
        ),
        authoritative_op(
            OperationKind::Update,
            json!({"id": "theirs", "text": "peer"}),
            "peer-client",
            3_000,
        ),
    ]);

    engine.sync(false).await.unwrap();

    assert!(store.find_one("todos", "mine").await.unwrap().is_none());
    let row = store.find_one("todos", "theirs").await.unwrap().unwrap();
    assert_eq!(row["text"], "peer");
    // last_sync advances over every returned op, echoes included.
    assert_eq!(engine.last_sync(), 3_000);
}

#[tokio::test]
async fn pull_deletes_remove_local_rows() {
    let (store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    store
        .insert("todos", json!({"id": "gone", "text": "old"}))
        .await
        .unwrap();
    remote.queue_pull(vec![authoritative_op(
        OperationKind::Delete,
        json!({"id": "gone"}),
        "peer-client",
        4_000,
    )]);

    engine.sync(false).await.unwrap();
    assert!(store.find_one("todos", "gone").await.unwrap().is_none());
}

#[tokio::test]
async fn applying_the_same_authoritative_op_twice_is_idempotent() {
    let (store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let op = authoritative_op(
        OperationKind::Update,
        json!({"id": "r1", "text": "same"}),
        "peer-client",
        5_000,
    );
    engine.apply_remote_batch(vec![op.clone()]).await;
    engine.apply_remote_batch(vec![op]).await;

    let rows = store.find("todos", None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["text"], "same");
    assert_eq!(engine.last_sync(), 5_000);
}

#[tokio::test]
async fn realtime_batches_reload_registered_collections() {
    let (_store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let collection = engine.collection("todos").await;
    assert!(collection.is_empty());

    engine
        .apply_remote_batch(vec![authoritative_op(
            OperationKind::Update,
            json!({"id": "r1", "text": "pushed"}),
            "peer-client",
            6_000,
        )])
        .await;

    assert_eq!(collection.count(), 1);
    assert_eq!(collection.data()[0]["text"], "pushed");
}

#[tokio::test]
async fn transport_failure_flips_status_offline_and_keeps_the_queue() {
    let (_store, remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();

    let seen_errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen_errors);
    engine.set_on_error(Arc::new(move |_err| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    engine.create("todos", json!({"text": "a"})).await.unwrap();
    remote.fail_push.store(true, Ordering::SeqCst);

    let err = engine.sync(false).await.unwrap_err();
    assert!(matches!(err, ClientError::Network(_)));
    assert_eq!(engine.status(), SyncStatus::Offline);
    assert_eq!(seen_errors.load(Ordering::SeqCst), 1);
    assert_eq!(engine.pending_operations().await.unwrap().len(), 1);

    // Recovery: the queued op is still there for the next cycle.
    remote.fail_push.store(false, Ordering::SeqCst);
    engine.sync(false).await.unwrap();
    assert!(engine.pending_operations().await.unwrap().is_empty());
    assert_eq!(engine.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn destroy_releases_background_tasks() {
    let (_store, _remote, engine) = engine_with(ConflictStrategy::LastWriteWins).await;
    engine.init().await.unwrap();
    engine.destroy().await;
    // Mutations still work against the local store after destroy.
    engine.create("todos", json!({"text": "late"})).await.unwrap();
}
