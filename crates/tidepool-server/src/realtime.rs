//! Realtime fan-out hub.
//!
//! One registered connection per live event stream. Fan-out is non-blocking:
//! events are pushed over a bounded per-connection channel and a full or
//! closed channel drops only that connection. A single timer task drives
//! heartbeats and reaps idle connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use tidepool_core::{time, Operation, StreamEvent, StreamEventKind};

/// Per-connection event buffer; a consumer this far behind is closed.
const EVENT_BUFFER: usize = 64;
const DIAGNOSTIC_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub enabled: bool,
    pub heartbeat_interval_ms: u64,
    /// `0` disables idle reaping.
    pub connection_timeout_ms: u64,
    pub max_connections_per_user: usize,
    /// Tables clients may subscribe to; `None` allows every table.
    pub allowed_tables: Option<Vec<String>>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 0,
            max_connections_per_user: 5,
            allowed_tables: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime service disabled")]
    Disabled,
}

/// Internal observability events, mirrored onto a broadcast channel so
/// operators and tests can watch fan-out without tapping client streams.
#[derive(Debug, Clone)]
pub enum HubDiagnostic {
    ConnectionOpened { connection_id: String },
    ConnectionClosed { connection_id: String },
    Broadcast { connections: usize, operations: usize },
}

struct Connection {
    user_id: String,
    client_id: String,
    /// Effective subscription; empty means every allowed table.
    tables: Vec<String>,
    sender: mpsc::Sender<StreamEvent>,
    created_at: i64,
    last_activity: i64,
    next_event_id: u64,
}

impl Connection {
    fn wants(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|name| name == table)
    }

    fn assign_event_id(&mut self) -> u64 {
        self.next_event_id += 1;
        self.next_event_id
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    user_connections: HashMap<String, Vec<String>>,
}

pub struct RealtimeHub {
    options: RealtimeOptions,
    state: RwLock<HubState>,
    diagnostics: broadcast::Sender<HubDiagnostic>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeHub {
    /// Creates the hub and, when enabled, starts its heartbeat task.
    pub fn start(options: RealtimeOptions) -> Arc<Self> {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_BUFFER);
        let hub = Arc::new(Self {
            options,
            state: RwLock::new(HubState::default()),
            diagnostics,
            heartbeat: Mutex::new(None),
        });

        if hub.options.enabled && hub.options.heartbeat_interval_ms > 0 {
            let task_hub = Arc::clone(&hub);
            let handle = tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(
                    task_hub.options.heartbeat_interval_ms,
                ));
                tick.tick().await; // immediate first tick
                loop {
                    tick.tick().await;
                    task_hub.heartbeat_tick().await;
                }
            });
            if let Ok(mut slot) = hub.heartbeat.try_lock() {
                *slot = Some(handle);
            }
        }

        hub
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<HubDiagnostic> {
        self.diagnostics.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Registers a stream. The oldest connection of the user is evicted
    /// when the per-user cap is reached. The returned receiver yields a
    /// `connected` event first; dropping it deregisters the connection on
    /// the next send attempt.
    pub async fn create_connection(
        &self,
        connection_id: &str,
        user_id: &str,
        client_id: &str,
        tables: Vec<String>,
    ) -> Result<mpsc::Receiver<StreamEvent>, RealtimeError> {
        if !self.options.enabled {
            return Err(RealtimeError::Disabled);
        }

        let effective_tables = self.effective_subscription(tables);
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let now = time::now_millis();

        let mut state = self.state.write().await;

        loop {
            let ids = self.connection_ids_for(&state, user_id);
            if ids.len() < self.options.max_connections_per_user.max(1) {
                break;
            }
            let oldest = ids
                .into_iter()
                .min_by_key(|id| state.connections.get(id).map(|c| c.created_at));
            match oldest {
                Some(id) => self.close_connection(&mut state, &id),
                None => break,
            }
        }

        let mut connection = Connection {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            tables: effective_tables.clone(),
            sender,
            created_at: now,
            last_activity: now,
            next_event_id: 0,
        };

        let event = StreamEvent {
            id: connection.assign_event_id(),
            kind: StreamEventKind::Connected {
                connection_id: connection_id.to_string(),
                tables: effective_tables,
            },
            timestamp: now,
        };
        // Buffer is fresh; this cannot fail.
        let _ = connection.sender.try_send(event);

        state
            .connections
            .insert(connection_id.to_string(), connection);
        state
            .user_connections
            .entry(user_id.to_string())
            .or_default()
            .push(connection_id.to_string());

        let _ = self.diagnostics.send(HubDiagnostic::ConnectionOpened {
            connection_id: connection_id.to_string(),
        });

        Ok(receiver)
    }

    fn effective_subscription(&self, requested: Vec<String>) -> Vec<String> {
        match &self.options.allowed_tables {
            Some(allowed) => {
                let intersection: Vec<String> = requested
                    .into_iter()
                    .filter(|table| allowed.contains(table))
                    .collect();
                // An empty request (or a fully filtered one) subscribes to
                // every allowed table, never to tables outside the allowlist.
                if intersection.is_empty() {
                    allowed.clone()
                } else {
                    intersection
                }
            }
            None => requested,
        }
    }

    fn connection_ids_for(&self, state: &HubState, user_id: &str) -> Vec<String> {
        state
            .user_connections
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn close_connection(&self, state: &mut HubState, connection_id: &str) {
        if let Some(connection) = state.connections.remove(connection_id) {
            if let Some(ids) = state.user_connections.get_mut(&connection.user_id) {
                ids.retain(|id| id != connection_id);
                if ids.is_empty() {
                    state.user_connections.remove(&connection.user_id);
                }
            }
            let _ = self.diagnostics.send(HubDiagnostic::ConnectionClosed {
                connection_id: connection_id.to_string(),
            });
        }
    }

    /// Fans the batch out to every registered connection except the
    /// originating replica's, filtered per subscription.
    pub async fn broadcast(&self, operations: Vec<Operation>, exclude_client_id: Option<&str>) {
        if !self.options.enabled || operations.is_empty() {
            return;
        }

        let mut state = self.state.write().await;
        let now = time::now_millis();
        let mut failed: Vec<String> = Vec::new();
        let mut delivered = 0usize;

        let targets: Vec<String> = state.connections.keys().cloned().collect();
        for connection_id in targets {
            let Some(connection) = state.connections.get_mut(&connection_id) else {
                continue;
            };
            if Some(connection.client_id.as_str()) == exclude_client_id {
                continue;
            }

            let filtered: Vec<Operation> = operations
                .iter()
                .filter(|op| connection.wants(&op.table))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }

            let mut tables: Vec<String> = filtered.iter().map(|op| op.table.clone()).collect();
            tables.sort();
            tables.dedup();

            let event = StreamEvent {
                id: connection.assign_event_id(),
                kind: StreamEventKind::Operations {
                    operations: filtered,
                    tables,
                },
                timestamp: now,
            };

            if connection.sender.try_send(event).is_err() {
                failed.push(connection_id);
            } else {
                connection.last_activity = now;
                delivered += 1;
            }
        }

        for connection_id in failed {
            self.close_connection(&mut state, &connection_id);
        }

        let _ = self.diagnostics.send(HubDiagnostic::Broadcast {
            connections: delivered,
            operations: operations.len(),
        });
        tracing::debug!(connections = delivered, operations = operations.len(), "fan-out");
    }

    /// Same filtering as [`broadcast`], restricted to one user's streams.
    pub async fn send_to_user(&self, user_id: &str, operations: Vec<Operation>) {
        if !self.options.enabled || operations.is_empty() {
            return;
        }

        let mut state = self.state.write().await;
        let now = time::now_millis();
        let mut failed: Vec<String> = Vec::new();

        for connection_id in self.connection_ids_for(&state, user_id) {
            let Some(connection) = state.connections.get_mut(&connection_id) else {
                continue;
            };

            let filtered: Vec<Operation> = operations
                .iter()
                .filter(|op| connection.wants(&op.table))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }

            let mut tables: Vec<String> = filtered.iter().map(|op| op.table.clone()).collect();
            tables.sort();
            tables.dedup();

            let event = StreamEvent {
                id: connection.assign_event_id(),
                kind: StreamEventKind::Operations {
                    operations: filtered,
                    tables,
                },
                timestamp: now,
            };

            if connection.sender.try_send(event).is_err() {
                failed.push(connection_id);
            } else {
                connection.last_activity = now;
            }
        }

        for connection_id in failed {
            self.close_connection(&mut state, &connection_id);
        }
    }

    async fn heartbeat_tick(&self) {
        let mut state = self.state.write().await;
        let now = time::now_millis();
        let timeout = self.options.connection_timeout_ms as i64;

        let stale: Vec<String> = state
            .connections
            .iter()
            .filter(|(_, connection)| timeout > 0 && now - connection.last_activity > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for connection_id in stale {
            self.close_connection(&mut state, &connection_id);
        }

        let mut failed: Vec<String> = Vec::new();
        let targets: Vec<String> = state.connections.keys().cloned().collect();
        for connection_id in targets {
            let Some(connection) = state.connections.get_mut(&connection_id) else {
                continue;
            };
            let event = StreamEvent {
                id: connection.assign_event_id(),
                kind: StreamEventKind::Heartbeat { timestamp: now },
                timestamp: now,
            };
            if connection.sender.try_send(event).is_err() {
                failed.push(connection_id);
            }
        }
        for connection_id in failed {
            self.close_connection(&mut state, &connection_id);
        }
    }

    /// Stops the heartbeat and closes every stream.
    pub async fn destroy(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
        let mut state = self.state.write().await;
        state.connections.clear();
        state.user_connections.clear();
    }
}
