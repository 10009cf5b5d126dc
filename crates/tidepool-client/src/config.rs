//! Client configuration.

use tidepool_core::ConflictStrategy;

/// Realtime stream settings for one replica.
#[derive(Debug, Clone)]
pub struct RealtimeClientOptions {
    pub enabled: bool,
    /// Base URL of the event stream endpoint, e.g.
    /// `http://localhost:8087/sync/events`.
    pub endpoint: String,
    /// Tables to subscribe to; empty subscribes to everything the server
    /// allows.
    pub tables: Vec<String>,
    /// Forwarded as `x-user-id` on the stream request. Empty when the
    /// outer layer authenticates the stream itself (proxy, cookies).
    pub user_id: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// A stream with no events (heartbeats included) for this long is
    /// considered dead.
    pub heartbeat_timeout_ms: u64,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            tables: Vec::new(),
            user_id: String::new(),
            reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 30_000,
            max_reconnect_attempts: 10,
            heartbeat_timeout_ms: 90_000,
        }
    }
}

/// Sync engine settings for one replica.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Auto-sync period. `0` syncs synchronously after every local
    /// mutation; negative disables the ticker entirely.
    pub sync_interval_ms: i64,
    pub batch_size: usize,
    pub conflict_resolution: ConflictStrategy,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub realtime: RealtimeClientOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            batch_size: 50,
            conflict_resolution: ConflictStrategy::LastWriteWins,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            realtime: RealtimeClientOptions::default(),
        }
    }
}

impl SyncOptions {
    pub fn auto_sync_enabled(&self) -> bool {
        self.sync_interval_ms > 0
    }

    pub fn sync_after_mutation(&self) -> bool {
        self.sync_interval_ms == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_defaults() {
        let options = SyncOptions::default();
        assert_eq!(options.sync_interval_ms, 30_000);
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.conflict_resolution, ConflictStrategy::LastWriteWins);
        assert!(options.auto_sync_enabled());
        assert!(!options.sync_after_mutation());
        assert!(!options.realtime.enabled);
    }

    #[test]
    fn interval_modes() {
        let synchronous = SyncOptions {
            sync_interval_ms: 0,
            ..SyncOptions::default()
        };
        assert!(synchronous.sync_after_mutation());
        assert!(!synchronous.auto_sync_enabled());

        let disabled = SyncOptions {
            sync_interval_ms: -1,
            ..SyncOptions::default()
        };
        assert!(!disabled.sync_after_mutation());
        assert!(!disabled.auto_sync_enabled());
    }
}
