//! Realtime client: maintains the long-lived event stream.
//!
//! Reconnects with exponential backoff on failure; a heartbeat watchdog
//! declares a silent stream dead. When attempts are exhausted the client
//! parks in `Fallback` and the periodic sync ticker remains the only
//! delivery path until `reconnect()` or `enable()`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use tidepool_core::{Operation, StreamEvent, StreamEventKind};

use crate::config::RealtimeClientOptions;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeStatus {
    Disconnected,
    Connecting,
    Connected,
    Fallback,
}

/// Delay before reconnect attempt `attempts + 1`.
pub fn backoff_delay_ms(attempts: u32, base_ms: u64, cap_ms: u64) -> u64 {
    base_ms
        .saturating_mul(2u64.saturating_pow(attempts))
        .min(cap_ms)
}

pub struct RealtimeClient {
    options: RealtimeClientOptions,
    client_id: String,
    user_id: String,
    self_ref: Weak<RealtimeClient>,
    /// Batches of authoritative operations, consumed by the sync engine.
    delivery: mpsc::Sender<Vec<Operation>>,
    status: watch::Sender<RealtimeStatus>,
    attempts: AtomicU32,
    last_event_id: AtomicU64,
    enabled: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    http: reqwest::Client,
}

impl RealtimeClient {
    pub fn new(
        options: RealtimeClientOptions,
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        delivery: mpsc::Sender<Vec<Operation>>,
    ) -> Arc<Self> {
        let enabled = options.enabled;
        let (status, _) = watch::channel(RealtimeStatus::Disconnected);
        Arc::new_cyclic(|self_ref| Self {
            options,
            client_id: client_id.into(),
            user_id: user_id.into(),
            self_ref: self_ref.clone(),
            delivery,
            status,
            attempts: AtomicU32::new(0),
            last_event_id: AtomicU64::new(0),
            enabled: AtomicBool::new(enabled),
            task: Mutex::new(None),
            http: reqwest::Client::new(),
        })
    }

    pub fn status(&self) -> RealtimeStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RealtimeStatus> {
        self.status.subscribe()
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id.load(Ordering::SeqCst)
    }

    /// Opens the stream and keeps it alive. Without an endpoint (or when
    /// disabled) the client goes straight to `Fallback`.
    pub async fn connect(&self) {
        if !self.enabled.load(Ordering::SeqCst) || self.options.endpoint.is_empty() {
            let _ = self.status.send(RealtimeStatus::Fallback);
            return;
        }

        // The constructor only hands out Arcs, so the upgrade holds.
        let Some(client) = self.self_ref.upgrade() else {
            return;
        };

        let mut slot = self.task.lock().await;
        if let Some(existing) = slot.take() {
            existing.abort();
        }
        *slot = Some(tokio::spawn(async move {
            client.run_loop().await;
        }));
    }

    /// Resets the attempt counter and opens a fresh stream.
    pub async fn reconnect(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.connect().await;
    }

    pub async fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        let _ = self.status.send(RealtimeStatus::Disconnected);
    }

    pub async fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        self.connect().await;
    }

    pub async fn destroy(&self) {
        self.disable().await;
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if !self.enabled.load(Ordering::SeqCst) {
                let _ = self.status.send(RealtimeStatus::Disconnected);
                return;
            }

            let _ = self.status.send(RealtimeStatus::Connecting);
            match self.stream_once().await {
                Ok(()) => {
                    tracing::debug!("event stream closed by server");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "event stream failed");
                }
            }

            let attempts = self.attempts.load(Ordering::SeqCst);
            if attempts >= self.options.max_reconnect_attempts {
                let _ = self.status.send(RealtimeStatus::Fallback);
                return;
            }
            let delay = backoff_delay_ms(
                attempts,
                self.options.reconnect_interval_ms,
                self.options.max_reconnect_interval_ms,
            );
            self.attempts.store(attempts + 1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn stream_once(&self) -> Result<()> {
        let url = self.stream_url();
        let mut request = self
            .http
            .get(&url)
            .header("accept", "text/event-stream");
        if !self.user_id.is_empty() {
            request = request.header("x-user-id", &self.user_id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Realtime(format!(
                "stream rejected with HTTP {}",
                response.status().as_u16()
            )));
        }

        // Stream is up: a successful open resets the backoff.
        self.attempts.store(0, Ordering::SeqCst);
        let _ = self.status.send(RealtimeStatus::Connected);

        let watchdog = Duration::from_millis(self.options.heartbeat_timeout_ms);
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            // Any event resets the watchdog; a silent stream is dead.
            let chunk = tokio::time::timeout(watchdog, stream.next())
                .await
                .map_err(|_| ClientError::Realtime("heartbeat watchdog expired".into()))?;

            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(boundary) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..boundary + 2).collect();
                self.handle_frame(frame.trim_end()).await;
            }
        }
    }

    fn stream_url(&self) -> String {
        let mut url = format!(
            "{}?clientId={}&tables={}",
            self.options.endpoint,
            self.client_id,
            self.options.tables.join(",")
        );
        let last_event_id = self.last_event_id.load(Ordering::SeqCst);
        if last_event_id > 0 {
            url.push_str(&format!("&lastEventId={last_event_id}"));
        }
        url
    }

    async fn handle_frame(&self, frame: &str) {
        let mut data_lines: Vec<&str> = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }
        if data_lines.is_empty() {
            return; // comment or retry frame
        }

        let payload = data_lines.join("\n");
        let event: StreamEvent = match serde_json::from_str(&payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable stream event");
                return;
            }
        };

        self.last_event_id.store(event.id, Ordering::SeqCst);

        match event.kind {
            StreamEventKind::Operations { operations, .. } => {
                if self.delivery.send(operations).await.is_err() {
                    tracing::debug!("operation consumer gone");
                }
            }
            StreamEventKind::Heartbeat { .. } => {}
            StreamEventKind::Connected { connection_id, .. } => {
                tracing::debug!(connection_id, "event stream connected");
            }
            StreamEventKind::Reconnect => {
                tracing::debug!("server requested reconnect");
            }
            StreamEventKind::Error { message } => {
                tracing::warn!(message, "server stream error");
            }
        }
    }
}
