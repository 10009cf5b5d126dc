//! Realtime fan-out scenarios, from the hub surface down to the SSE route.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tokio_stream::StreamExt;
use tower::ServiceExt;
use uuid::Uuid;

use tidepool_core::{
    Operation, OperationKind, OperationStatus, StreamEventKind, SyncSchema, TableConfig,
};
use tidepool_server::routes::{router, AppState};
use tidepool_server::{
    HubDiagnostic, MemoryServerStore, RealtimeHub, RealtimeOptions, ServerStore, SyncEngine,
};

fn make_op(table: &str, record_id: &str, client_id: &str) -> Operation {
    Operation {
        id: format!("op-{}", Uuid::new_v4()),
        table: table.into(),
        kind: OperationKind::Insert,
        data: json!({"id": record_id, "text": "T", "user_id": "user-1"}),
        timestamp: 1_000,
        client_id: client_id.into(),
        version: 1,
        status: OperationStatus::Pending,
        error: None,
        user_id: None,
    }
}

fn quiet_options() -> RealtimeOptions {
    RealtimeOptions {
        heartbeat_interval_ms: 0,
        ..RealtimeOptions::default()
    }
}

#[tokio::test]
async fn push_fans_out_to_peers_but_not_origin() {
    let hub = RealtimeHub::start(quiet_options());
    let store: Arc<dyn ServerStore> = Arc::new(MemoryServerStore::new());
    let schema = SyncSchema::new().with_table("todos", TableConfig::new("todos"));
    let engine = SyncEngine::new(schema, store).with_hub(Arc::clone(&hub));

    let mut origin = hub
        .create_connection("conn-1", "user-1", "C1", vec!["todos".into()])
        .await
        .unwrap();
    let mut peer = hub
        .create_connection("conn-2", "user-1", "C2", vec!["todos".into()])
        .await
        .unwrap();
    origin.try_recv().unwrap();
    peer.try_recv().unwrap();

    let result = engine.push(vec![make_op("todos", "todo-9", "C1")], "user-1").await;
    assert!(result.success);

    let event = peer.try_recv().unwrap();
    match event.kind {
        StreamEventKind::Operations { operations, .. } => {
            assert_eq!(operations.len(), 1);
            assert_eq!(operations[0].data["id"], "todo-9");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(origin.try_recv().is_err());
}

#[tokio::test]
async fn rejected_operations_are_not_fanned_out() {
    let hub = RealtimeHub::start(quiet_options());
    let store: Arc<dyn ServerStore> = Arc::new(MemoryServerStore::new());
    let schema = SyncSchema::new().with_table("todos", TableConfig::new("todos"));
    let engine = SyncEngine::new(schema, store).with_hub(Arc::clone(&hub));

    let mut peer = hub
        .create_connection("conn-1", "user-1", "C2", vec![])
        .await
        .unwrap();
    peer.try_recv().unwrap();

    // Update of a missing record fails; nothing must reach the stream.
    let mut op = make_op("todos", "todo-1", "C1");
    op.kind = OperationKind::Update;
    op.version = 2;
    let result = engine.push(vec![op], "user-1").await;
    assert!(!result.success);
    assert!(peer.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_emits_diagnostic_events() {
    let hub = RealtimeHub::start(quiet_options());
    let mut diagnostics = hub.subscribe_diagnostics();

    let mut peer = hub
        .create_connection("conn-1", "user-1", "C2", vec![])
        .await
        .unwrap();
    peer.try_recv().unwrap();

    hub.broadcast(vec![make_op("todos", "todo-1", "C1")], Some("C1"))
        .await;

    let mut saw_broadcast = false;
    while let Ok(diagnostic) = diagnostics.try_recv() {
        if let HubDiagnostic::Broadcast {
            connections,
            operations,
        } = diagnostic
        {
            assert_eq!(connections, 1);
            assert_eq!(operations, 1);
            saw_broadcast = true;
        }
    }
    assert!(saw_broadcast);
}

#[tokio::test]
async fn idle_connections_are_reaped_by_heartbeat() {
    let hub = RealtimeHub::start(RealtimeOptions {
        heartbeat_interval_ms: 20,
        connection_timeout_ms: 10,
        ..RealtimeOptions::default()
    });

    let _receiver = hub
        .create_connection("conn-1", "user-1", "C1", vec![])
        .await
        .unwrap();
    assert_eq!(hub.connection_count().await, 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(hub.connection_count().await, 0);
}

#[tokio::test]
async fn destroy_closes_every_stream() {
    let hub = RealtimeHub::start(quiet_options());
    let mut receiver = hub
        .create_connection("conn-1", "user-1", "C1", vec![])
        .await
        .unwrap();
    receiver.try_recv().unwrap();

    hub.destroy().await;
    assert_eq!(hub.connection_count().await, 0);
    assert!(matches!(
        receiver.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));
}

fn test_state(options: RealtimeOptions) -> AppState {
    let hub = RealtimeHub::start(options);
    let store: Arc<dyn ServerStore> = Arc::new(MemoryServerStore::new());
    let schema = SyncSchema::new().with_table("todos", TableConfig::new("todos"));
    let engine = Arc::new(SyncEngine::new(schema, store).with_hub(Arc::clone(&hub)));
    AppState {
        engine,
        hub,
        batch_size: 50,
    }
}

#[tokio::test]
async fn push_requires_the_user_header() {
    let app = router(test_state(quiet_options()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sync/push")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"operations": []}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn events_route_streams_the_connected_event() {
    let app = router(test_state(quiet_options()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sync/events?clientId=C1&tables=todos")
                .header("x-user-id", "user-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let mut body = response.into_body().into_data_stream();
    let chunk = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.contains("event:"));
    assert!(text.contains("id:"));
    assert!(text.contains("\"type\":\"connected\""));
    assert!(text.contains("\"id\":1"));
}

#[tokio::test]
async fn events_route_is_unavailable_when_disabled() {
    let app = router(test_state(RealtimeOptions {
        enabled: false,
        ..quiet_options()
    }));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sync/events?clientId=C1")
                .header("x-user-id", "user-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn resolve_route_is_unimplemented_without_a_resolver() {
    let app = router(test_state(quiet_options()));

    let conflict = tidepool_core::Conflict::new(
        make_op("todos", "todo-1", "C1"),
        json!({"id": "todo-1", "text": "server"}),
    );
    let body = serde_json::to_string(&json!({"conflict": conflict})).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sync/resolve")
                .header("x-user-id", "user-1")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}
