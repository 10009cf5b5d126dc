use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::Operation;

/// How a surfaced conflict was ultimately settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    ClientWins,
    ServerWins,
    Merged,
}

/// Per-table policy deciding whether a version gap becomes a [`Conflict`]
/// or is rewritten to an accepted write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    ClientWins,
    ServerWins,
    #[default]
    LastWriteWins,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

/// A client operation the server refused to apply, together with both
/// sides' row state at refusal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub operation: Operation,
    pub server_data: Value,
    pub client_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    pub fn new(operation: Operation, server_data: Value) -> Self {
        let client_data = operation.data.clone();
        Self {
            operation,
            server_data,
            client_data,
            resolution: None,
        }
    }
}
