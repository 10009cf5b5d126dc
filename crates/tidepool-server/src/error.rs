use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Faults raised by server store adapters.
///
/// The sync engine maps these to per-operation outcomes; only the HTTP
/// layer ever turns them into whole-request failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {id} in {table} already exists")]
    Duplicate { table: String, id: String },
    #[error("record {id} in {table} not found")]
    NotFound { table: String, id: String },
    #[error("version mismatch for {id} in {table}: expected {expected}, found {found}")]
    VersionMismatch {
        table: String,
        id: String,
        expected: i64,
        found: i64,
    },
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidRow(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Request-level failures surfaced by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid x-user-id header")]
    Unauthorized,
    #[error("realtime service disabled")]
    RealtimeUnavailable,
    #[error("manual conflict resolution is not configured")]
    ResolveUnavailable,
    #[error("too many connection attempts")]
    ConnectionRejected,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RealtimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ResolveUnavailable => StatusCode::NOT_IMPLEMENTED,
            ApiError::ConnectionRejected => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_messages() {
        let err = StoreError::VersionMismatch {
            table: "todos".into(),
            id: "todo-1".into(),
            expected: 2,
            found: 3,
        };
        assert_eq!(
            err.to_string(),
            "version mismatch for todo-1 in todos: expected 2, found 3"
        );
    }

    #[test]
    fn api_error_status_codes() {
        assert_eq!(
            ApiError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::RealtimeUnavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::ResolveUnavailable.into_response().status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }
}
