use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use tidepool_core::{Operation, PullQuery, PushRequest, PushResult, ResolveRequest, StreamEvent};

use crate::engine::SyncEngine;
use crate::error::ApiError;
use crate::realtime::RealtimeHub;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub hub: Arc<RealtimeHub>,
    /// Advisory push batch ceiling from server config.
    pub batch_size: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync/push", post(push))
        .route("/sync/pull", post(pull))
        .route("/sync/resolve", post(resolve))
        .route("/sync/events", get(events))
        .with_state(state)
}

/// The outer authentication layer resolves the principal and forwards it in
/// `x-user-id`; the sync core never sees credentials.
fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.store().ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable"})),
        ),
    }
}

async fn push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResult>, ApiError> {
    let user_id = require_user(&headers)?;
    if request.operations.len() > state.batch_size {
        tracing::warn!(
            size = request.operations.len(),
            limit = state.batch_size,
            "push batch exceeds configured batch size"
        );
    }
    let result = state.engine.push(request.operations, &user_id).await;
    Ok(Json(result))
}

async fn pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(query): Json<PullQuery>,
) -> Result<Json<Vec<Operation>>, ApiError> {
    let user_id = require_user(&headers)?;
    let operations = state
        .engine
        .pull(query.since, &query.client_id, &user_id)
        .await;
    Ok(Json(operations))
}

async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Operation>, ApiError> {
    require_user(&headers)?;
    let resolver = state
        .engine
        .resolver()
        .ok_or(ApiError::ResolveUnavailable)?;
    let operation = resolver
        .resolve(request.conflict)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(operation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    client_id: String,
    #[serde(default)]
    tables: String,
    #[serde(default)]
    last_event_id: Option<u64>,
}

async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    let tables: Vec<String> = query
        .tables
        .split(',')
        .map(str::trim)
        .filter(|table| !table.is_empty())
        .map(str::to_string)
        .collect();

    if let Some(last_event_id) = query.last_event_id {
        // Replay is not supported; the client falls back to a delta pull.
        tracing::debug!(client_id = %query.client_id, last_event_id, "reconnect without replay");
    }

    let connection_id = Uuid::new_v4().to_string();
    let receiver = state
        .hub
        .create_connection(&connection_id, &user_id, &query.client_id, tables)
        .await
        .map_err(|_| ApiError::RealtimeUnavailable)?;

    let stream = ReceiverStream::new(receiver).map(|event| Ok::<_, Infallible>(to_sse(event)));
    Ok(Sse::new(stream))
}

fn to_sse(event: StreamEvent) -> Event {
    let id = event.id.to_string();
    let name = event.kind.event_name();
    match Event::default().json_data(&event) {
        Ok(sse_event) => sse_event.id(id).event(name),
        Err(err) => Event::default()
            .event("error")
            .data(format!("{{\"error\":\"{err}\"}}")),
    }
}
