//! Tidepool client: a local-first replica with background synchronization.
//!
//! Writes go to the embedded store immediately and queue an operation for
//! the server; a sync cycle pushes the queue, pulls the authoritative
//! delta, and resolves conflicts by policy. A realtime stream (with
//! backoff and polling fallback) delivers other replicas' accepted
//! operations between cycles, and reactive collections project tables for
//! UI consumption.

pub mod collection;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod realtime;
pub mod remote;
pub mod store;

pub use collection::{Collection, CollectionBackend, CollectionState};
pub use config::{RealtimeClientOptions, SyncOptions};
pub use coordinator::{Coordinator, CoordinatorMessage, LocalCoordinator, NoopCoordinator};
pub use engine::{SyncEngine, SyncStatus};
pub use error::{ClientError, Result};
pub use realtime::{RealtimeClient, RealtimeStatus};
pub use remote::{HttpRemote, RemoteSync};
pub use store::{ClientStore, MemoryClientStore, SqliteClientStore};
