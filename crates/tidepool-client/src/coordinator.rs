//! Intra-replica coordination.
//!
//! Co-located replicas of the same client identity (parallel windows,
//! worker processes sharing one store) stay visually consistent through a
//! named pub/sub channel: every local mutation announces `data-changed`,
//! every finished sync cycle announces `sync-complete`.

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use tidepool_core::OperationKind;

const CHANNEL_BUFFER: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorMessage {
    DataChanged {
        table: String,
        kind: OperationKind,
        data: Value,
    },
    SyncComplete,
}

/// What actually travels on the shared channel; `sender` identifies the
/// originating handle for echo suppression.
#[derive(Debug, Clone)]
pub struct Envelope {
    sender: String,
    message: CoordinatorMessage,
}

pub trait Coordinator: Send + Sync {
    fn broadcast(&self, message: CoordinatorMessage);

    /// A receiver of messages from *other* handles on the channel; the
    /// handle's own broadcasts are filtered out.
    fn subscribe(&self) -> broadcast::Receiver<CoordinatorMessage>;

    fn close(&self);
}

/// In-process coordinator over a tokio broadcast channel. Each handle has
/// its own id, so self-echoes from the shared channel are dropped before
/// subscribers see them.
pub struct LocalCoordinator {
    name: String,
    handle_id: String,
    channel: broadcast::Sender<Envelope>,
    delivery: broadcast::Sender<CoordinatorMessage>,
    forward: tokio::task::JoinHandle<()>,
}

impl LocalCoordinator {
    pub fn new(name: impl Into<String>) -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_BUFFER);
        Self::attach(name, channel)
    }

    /// Joins an existing channel, e.g. the one another replica created.
    pub fn attach(name: impl Into<String>, channel: broadcast::Sender<Envelope>) -> Self {
        let handle_id = Uuid::new_v4().to_string();
        let (delivery, _) = broadcast::channel(CHANNEL_BUFFER);

        let mut upstream = channel.subscribe();
        let own_id = handle_id.clone();
        let downstream = delivery.clone();
        let forward = tokio::spawn(async move {
            while let Ok(envelope) = upstream.recv().await {
                if envelope.sender != own_id {
                    let _ = downstream.send(envelope.message);
                }
            }
        });

        Self {
            name: name.into(),
            handle_id,
            channel,
            delivery,
            forward,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared channel, for attaching further replicas in-process.
    pub fn channel(&self) -> broadcast::Sender<Envelope> {
        self.channel.clone()
    }
}

impl Coordinator for LocalCoordinator {
    fn broadcast(&self, message: CoordinatorMessage) {
        tracing::trace!(channel = %self.name, "coordinator broadcast");
        let _ = self.channel.send(Envelope {
            sender: self.handle_id.clone(),
            message,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorMessage> {
        self.delivery.subscribe()
    }

    fn close(&self) {
        self.forward.abort();
    }
}

/// For single-replica deployments: broadcasts vanish, subscriptions stay
/// silent.
pub struct NoopCoordinator {
    delivery: broadcast::Sender<CoordinatorMessage>,
}

impl NoopCoordinator {
    pub fn new() -> Self {
        let (delivery, _) = broadcast::channel(1);
        Self { delivery }
    }
}

impl Default for NoopCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator for NoopCoordinator {
    fn broadcast(&self, _message: CoordinatorMessage) {}

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorMessage> {
        self.delivery.subscribe()
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn own_broadcasts_are_not_echoed_back() {
        let coordinator = LocalCoordinator::new("sync-test");
        let mut receiver = coordinator.subscribe();

        coordinator.broadcast(CoordinatorMessage::SyncComplete);
        tokio::task::yield_now().await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn peers_on_the_same_channel_hear_each_other() {
        let first = LocalCoordinator::new("sync-test");
        let second = LocalCoordinator::attach("sync-test", first.channel());
        let mut receiver = second.subscribe();

        first.broadcast(CoordinatorMessage::DataChanged {
            table: "todos".into(),
            kind: OperationKind::Insert,
            data: json!({"id": "r1"}),
        });

        // The forwarding task needs a moment to relay.
        let message = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            receiver.recv(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(
            message,
            CoordinatorMessage::DataChanged { ref table, .. } if table == "todos"
        ));

        first.close();
        second.close();
    }

    #[tokio::test]
    async fn noop_coordinator_stays_silent() {
        let coordinator = NoopCoordinator::new();
        let mut receiver = coordinator.subscribe();
        coordinator.broadcast(CoordinatorMessage::SyncComplete);
        tokio::task::yield_now().await;
        assert!(receiver.try_recv().is_err());
    }
}
