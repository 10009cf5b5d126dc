//! Wire envelopes: realtime stream events and the push/pull/resolve RPCs.

use serde::{Deserialize, Serialize};

use crate::conflict::Conflict;
use crate::operation::Operation;

/// Payload of one realtime stream event, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamEventKind {
    /// First event on every stream.
    Connected {
        connection_id: String,
        tables: Vec<String>,
    },
    /// Authoritative operations fanned out to a subscriber.
    Operations {
        operations: Vec<Operation>,
        tables: Vec<String>,
    },
    Heartbeat {
        timestamp: i64,
    },
    /// Server-requested reconnection (reserved).
    Reconnect,
    /// Out-of-band diagnostic.
    Error {
        message: String,
    },
}

impl StreamEventKind {
    /// The SSE `event:` field value for this kind.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEventKind::Connected { .. } => "connected",
            StreamEventKind::Operations { .. } => "operations",
            StreamEventKind::Heartbeat { .. } => "heartbeat",
            StreamEventKind::Reconnect => "reconnect",
            StreamEventKind::Error { .. } => "error",
        }
    }
}

/// One event on the realtime stream. Ids are assigned monotonically per
/// connection so clients can resume with `lastEventId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: u64,
    #[serde(flatten)]
    pub kind: StreamEventKind,
    pub timestamp: i64,
}

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub operations: Vec<Operation>,
}

/// Body of `POST /sync/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullQuery {
    /// Unix milliseconds; `0` requests the full bootstrap set.
    pub since: i64,
    pub client_id: String,
}

/// Body of `POST /sync/resolve` (manual conflict policy only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub conflict: Conflict,
}
