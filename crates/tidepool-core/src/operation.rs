use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflict::Conflict;

/// The kind of change an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// Queue lifecycle of an operation on the originating replica.
///
/// Only meaningful in the client queue; the server ignores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Synced,
    Error,
    #[serde(untagged)]
    Unknown(String),
}

impl OperationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Synced => "synced",
            OperationStatus::Error => "error",
            OperationStatus::Unknown(value) => value.as_str(),
        }
    }
}

impl From<&str> for OperationStatus {
    fn from(value: &str) -> Self {
        match value {
            "pending" => OperationStatus::Pending,
            "synced" => OperationStatus::Synced,
            "error" => OperationStatus::Error,
            other => OperationStatus::Unknown(other.to_string()),
        }
    }
}

/// A single replicated change, addressed by `(table, data["id"])`.
///
/// Operations are produced by client replicas (with client wall-clock
/// `timestamp` and the version the replica observed) and by the server on
/// pull (with server `_updated_at` time and the stored `_version`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique id, assigned by the originating replica.
    pub id: String,
    pub table: String,
    pub kind: OperationKind,
    /// Row payload. Deletes only need `id`; inserts and updates carry the
    /// full intended post-state.
    pub data: Value,
    /// Unix milliseconds at origination. Trusted only for LWW tie-breaks.
    pub timestamp: i64,
    pub client_id: String,
    /// `1` for inserts; `prior_server_version + 1` for updates; advisory
    /// for deletes.
    pub version: i64,
    #[serde(default = "default_status")]
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn default_status() -> OperationStatus {
    OperationStatus::Pending
}

impl Operation {
    /// The id of the record this operation targets, when present in `data`.
    pub fn record_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

/// Per-operation failure reported in a [`PushResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushError {
    pub id: String,
    pub error: String,
}

/// Outcome of one `push` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResult {
    pub success: bool,
    /// Ids of operations the server accepted, in input order.
    pub synced: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<PushError>,
}

/// Per-replica bookkeeping the server keeps across pushes and pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub client_id: String,
    pub user_id: String,
    pub last_sync: i64,
    pub last_active: i64,
}
