//! Shared types for the Tidepool sync protocol.
//!
//! This crate defines the operation model exchanged between client replicas
//! and the sync server, the per-table sync schema, the record metadata
//! helpers for server-side rows, and the realtime wire envelope. It is a
//! pure type crate: no I/O, no runtime.

pub mod conflict;
pub mod operation;
pub mod record;
pub mod schema;
pub mod time;
pub mod wire;

pub use conflict::{Conflict, ConflictResolution, ConflictStrategy};
pub use operation::{ClientState, Operation, OperationKind, OperationStatus, PushError, PushResult};
pub use schema::{SyncSchema, TableConfig};
pub use wire::{PullQuery, PushRequest, ResolveRequest, StreamEvent, StreamEventKind};
