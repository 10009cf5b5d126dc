//! Tidepool sync server.
//!
//! Applies client operation batches against the authoritative store under
//! per-user authorization and per-table conflict policy, serves delta
//! pulls, and fans accepted operations out to subscribed replicas over
//! long-lived event streams.

use std::sync::Arc;

use anyhow::Result;

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod logging;
pub mod realtime;
pub mod routes;
pub mod server;
pub mod store;

pub use config::{load_config, ServerConfig};
pub use engine::{ConflictResolver, SyncEngine};
pub use error::{ApiError, StoreError};
pub use realtime::{HubDiagnostic, RealtimeHub, RealtimeOptions};
pub use routes::AppState;
pub use store::{MemoryServerStore, PgServerStore, ServerStore};

pub(crate) const SERVICE_NAME: &str = "tidepool-server";

/// Wires the Postgres store, engine and realtime hub, then serves until
/// shutdown. Library users who need custom stores, transforms or resolvers
/// assemble [`AppState`] themselves and call [`routes::router`].
pub async fn run(config: ServerConfig) -> Result<()> {
    let pool = db::connect(&config.database_url, config.max_db_connections).await?;

    let pg_store = PgServerStore::new(pool);
    pg_store.init(&config.schema).await?;
    let store: Arc<dyn ServerStore> = Arc::new(pg_store);

    let hub = RealtimeHub::start(config.realtime.clone());
    let engine = Arc::new(SyncEngine::new(config.schema, store).with_hub(Arc::clone(&hub)));

    let state = AppState {
        engine,
        hub,
        batch_size: config.batch_size,
    };
    let router = http::apply_standard_layers(routes::router(state));

    server::serve(config.addr, router).await
}
