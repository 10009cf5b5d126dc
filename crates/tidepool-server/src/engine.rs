//! Authoritative sync engine: applies pushed operations under the table
//! schema's authorization and conflict policy, and serves delta pulls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use tidepool_core::{
    record, time, Conflict, ConflictStrategy, Operation, OperationKind, OperationStatus,
    PushError, PushResult, SyncSchema, TableConfig,
};

use crate::error::StoreError;
use crate::realtime::RealtimeHub;
use crate::store::ServerStore;

/// Hook invoked by `POST /sync/resolve` when a table uses the `manual`
/// client strategy. Returns the operation that settles the conflict.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: Conflict) -> Result<Operation, String>;
}

enum OpOutcome {
    Applied,
    Conflicted(Box<Conflict>),
}

enum PolicyDecision {
    Resolved,
    Conflict,
}

pub struct SyncEngine {
    schema: SyncSchema,
    store: Arc<dyn ServerStore>,
    hub: Option<Arc<RealtimeHub>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl SyncEngine {
    pub fn new(schema: SyncSchema, store: Arc<dyn ServerStore>) -> Self {
        Self {
            schema,
            store,
            hub: None,
            resolver: None,
        }
    }

    pub fn with_hub(mut self, hub: Arc<RealtimeHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn store(&self) -> &Arc<dyn ServerStore> {
        &self.store
    }

    pub fn resolver(&self) -> Option<&Arc<dyn ConflictResolver>> {
        self.resolver.as_ref()
    }

    /// Applies a batch of client operations in input order. Per-operation
    /// failures are isolated into the result; accepted operations are
    /// logged, acknowledged and fanned out to other subscribed replicas.
    pub async fn push(&self, operations: Vec<Operation>, user_id: &str) -> PushResult {
        let mut result = PushResult::default();
        let push_client_id = operations.first().map(|op| op.client_id.clone());
        let mut accepted: Vec<Operation> = Vec::new();

        for operation in operations {
            match self.apply_operation(&operation, user_id).await {
                Ok(OpOutcome::Applied) => {
                    if let Err(err) = self.store.log_sync_operation(&operation, user_id).await {
                        result.errors.push(PushError {
                            id: operation.id.clone(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                    result.synced.push(operation.id.clone());
                    accepted.push(operation);
                }
                Ok(OpOutcome::Conflicted(conflict)) => result.conflicts.push(*conflict),
                Err(error) => result.errors.push(PushError {
                    id: operation.id.clone(),
                    error,
                }),
            }
        }

        if let Some(client_id) = push_client_id.as_deref() {
            if let Err(err) = self.store.update_client_state(client_id, user_id).await {
                tracing::warn!(client_id, error = %err, "failed to update client state");
            }
        }

        result.success = result.conflicts.is_empty() && result.errors.is_empty();

        if !accepted.is_empty() {
            if let Some(hub) = &self.hub {
                hub.broadcast(accepted, push_client_id.as_deref()).await;
            }
        }

        result
    }

    async fn apply_operation(
        &self,
        operation: &Operation,
        user_id: &str,
    ) -> Result<OpOutcome, String> {
        let config = self.schema.table(&operation.table).ok_or_else(|| {
            format!("Table {} not configured for sync", operation.table)
        })?;
        let record_id = operation
            .record_id()
            .ok_or_else(|| "Operation data is missing `id`".to_string())?
            .to_string();

        match operation.kind {
            OperationKind::Insert => {
                self.apply_insert(config, operation, &record_id, user_id)
                    .await
            }
            OperationKind::Update => {
                self.apply_update(config, operation, &record_id, user_id)
                    .await
            }
            OperationKind::Delete => {
                self.apply_delete(config, operation, &record_id, user_id)
                    .await
            }
        }
    }

    async fn apply_insert(
        &self,
        config: &TableConfig,
        operation: &Operation,
        record_id: &str,
        user_id: &str,
    ) -> Result<OpOutcome, String> {
        if config.is_user_scoped() {
            let claimed = operation
                .user_id
                .as_deref()
                .or_else(|| operation.data.get("user_id").and_then(Value::as_str));
            if let Some(claimed) = claimed {
                if claimed != user_id {
                    return Err("Access denied".to_string());
                }
            }
        }

        let existing = self
            .store
            .find_one(&config.table, record_id)
            .await
            .map_err(stringify)?;
        if let Some(server_row) = existing {
            return Ok(OpOutcome::Conflicted(Box::new(Conflict::new(
                operation.clone(),
                server_row,
            ))));
        }

        let mut row = operation.data.clone();
        if let Some(map) = row.as_object_mut() {
            map.insert("user_id".into(), user_id.into());
        }
        record::stamp_insert(&mut row, time::now_millis(), Some(&operation.client_id));

        self.store
            .insert(&config.table, row)
            .await
            .map_err(stringify)?;
        Ok(OpOutcome::Applied)
    }

    async fn apply_update(
        &self,
        config: &TableConfig,
        operation: &Operation,
        record_id: &str,
        user_id: &str,
    ) -> Result<OpOutcome, String> {
        let current = self
            .store
            .find_one(&config.table, record_id)
            .await
            .map_err(stringify)?
            .ok_or_else(|| "Record not found".to_string())?;

        check_ownership(config, &current, user_id)?;

        let current_version = record::version(&current);
        if current_version != operation.version - 1 {
            match decide(config.conflict_resolution, operation, &current) {
                PolicyDecision::Conflict => {
                    return Ok(OpOutcome::Conflicted(Box::new(Conflict::new(
                        operation.clone(),
                        current,
                    ))));
                }
                PolicyDecision::Resolved => {}
            }
        }

        let mut merged = record::merge_into(&current, &operation.data);
        record::stamp_update(
            &mut merged,
            current_version + 1,
            operation.timestamp,
            Some(&operation.client_id),
        );

        // A concurrent writer between our read and this guarded write shows
        // up as VersionMismatch; that is an error for the client to retry,
        // never a conflict.
        self.store
            .update(&config.table, record_id, merged, current_version)
            .await
            .map_err(stringify)?;
        Ok(OpOutcome::Applied)
    }

    async fn apply_delete(
        &self,
        config: &TableConfig,
        operation: &Operation,
        record_id: &str,
        user_id: &str,
    ) -> Result<OpOutcome, String> {
        let current = self
            .store
            .find_one(&config.table, record_id)
            .await
            .map_err(stringify)?;

        let Some(current) = current else {
            // Deleting what is not there is a success: the op is idempotent.
            return Ok(OpOutcome::Applied);
        };

        check_ownership(config, &current, user_id)?;

        self.store
            .delete(
                &config.table,
                record_id,
                operation.timestamp,
                Some(&operation.client_id),
            )
            .await
            .map_err(stringify)?;
        Ok(OpOutcome::Applied)
    }

    /// Delta pull across every configured table. A failing table is logged
    /// and skipped; the merged result is sorted by timestamp ascending.
    pub async fn pull(&self, since: i64, client_id: &str, user_id: &str) -> Vec<Operation> {
        let mut operations: Vec<Operation> = Vec::new();

        for (logical, config) in self.schema.iter() {
            let filter = config.where_filter.as_ref().map(|build| build(user_id));
            let rows = match self
                .store
                .get_changes_since(&config.table, since, filter.as_ref(), Some(client_id))
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(table = logical, error = %err, "pull skipped failing table");
                    continue;
                }
            };

            for row in rows {
                operations.push(row_to_operation(logical, config, row));
            }
        }

        operations.sort_by_key(|op| op.timestamp);

        if let Err(err) = self.store.update_client_state(client_id, user_id).await {
            tracing::warn!(client_id, error = %err, "failed to update client state");
        }

        operations
    }
}

fn stringify(err: StoreError) -> String {
    err.to_string()
}

fn check_ownership(config: &TableConfig, row: &Value, user_id: &str) -> Result<(), String> {
    if !config.is_user_scoped() {
        return Ok(());
    }
    let owner = row.get("user_id").and_then(Value::as_str);
    if owner == Some(user_id) {
        Ok(())
    } else {
        Err("Access denied".to_string())
    }
}

fn decide(strategy: ConflictStrategy, operation: &Operation, server_row: &Value) -> PolicyDecision {
    match strategy {
        ConflictStrategy::ClientWins => PolicyDecision::Resolved,
        ConflictStrategy::ServerWins | ConflictStrategy::Manual => PolicyDecision::Conflict,
        ConflictStrategy::LastWriteWins => {
            // Strict: equal timestamps favor the server.
            if operation.timestamp > record::updated_at(server_row) {
                PolicyDecision::Resolved
            } else {
                PolicyDecision::Conflict
            }
        }
    }
}

fn row_to_operation(logical: &str, config: &TableConfig, row: Value) -> Operation {
    let kind = if record::is_deleted(&row) {
        OperationKind::Delete
    } else {
        OperationKind::Update
    };
    let timestamp = record::updated_at(&row);
    let version = record::version(&row);
    let client_id = record::client_id(&row)
        .unwrap_or("server")
        .to_string();

    let mut data = match &config.columns {
        Some(columns) => record::project_columns(&row, columns),
        None => row,
    };
    if let Some(transform) = &config.transform {
        data = transform(data);
    }

    Operation {
        id: Uuid::new_v4().to_string(),
        table: logical.to_string(),
        kind,
        data,
        timestamp,
        client_id,
        version,
        status: OperationStatus::Synced,
        error: None,
        user_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(kind: OperationKind, data: Value, version: i64, timestamp: i64) -> Operation {
        Operation {
            id: Uuid::new_v4().to_string(),
            table: "todos".into(),
            kind,
            data,
            timestamp,
            client_id: "c1".into(),
            version,
            status: OperationStatus::Pending,
            error: None,
            user_id: None,
        }
    }

    #[test]
    fn lww_is_strict() {
        let server_row = json!({"id": "t1", "_updated_at": 100});
        let newer = op(OperationKind::Update, json!({"id": "t1"}), 2, 101);
        let tied = op(OperationKind::Update, json!({"id": "t1"}), 2, 100);

        assert!(matches!(
            decide(ConflictStrategy::LastWriteWins, &newer, &server_row),
            PolicyDecision::Resolved
        ));
        assert!(matches!(
            decide(ConflictStrategy::LastWriteWins, &tied, &server_row),
            PolicyDecision::Conflict
        ));
    }

    #[test]
    fn server_wins_always_conflicts() {
        let server_row = json!({"id": "t1", "_updated_at": 0});
        let operation = op(OperationKind::Update, json!({"id": "t1"}), 2, i64::MAX);
        assert!(matches!(
            decide(ConflictStrategy::ServerWins, &operation, &server_row),
            PolicyDecision::Conflict
        ));
        assert!(matches!(
            decide(ConflictStrategy::ClientWins, &operation, &server_row),
            PolicyDecision::Resolved
        ));
    }

    #[test]
    fn ownership_check_only_applies_to_scoped_tables() {
        let open = TableConfig::new("todos");
        let scoped = TableConfig::new("todos").with_where(|uid| json!({"user_id": uid}));
        let row = json!({"id": "t1", "user_id": "someone-else"});

        assert!(check_ownership(&open, &row, "user-1").is_ok());
        assert_eq!(
            check_ownership(&scoped, &row, "user-1"),
            Err("Access denied".to_string())
        );
    }

    #[test]
    fn pull_rows_become_idempotent_updates() {
        let config = TableConfig::new("app_todos");
        let mut row = json!({"id": "t1", "text": "hi"});
        record::stamp_insert(&mut row, 42, Some("c9"));

        let operation = row_to_operation("todos", &config, row);
        assert_eq!(operation.kind, OperationKind::Update);
        assert_eq!(operation.table, "todos");
        assert_eq!(operation.timestamp, 42);
        assert_eq!(operation.version, 1);
        assert_eq!(operation.client_id, "c9");
    }

    #[test]
    fn tombstones_pull_as_deletes_with_server_origin() {
        let config = TableConfig::new("app_todos");
        let row = json!({
            "id": "t1",
            "_version": 2, "_updated_at": 50, "_client_id": null, "_is_deleted": true
        });

        let operation = row_to_operation("todos", &config, row);
        assert_eq!(operation.kind, OperationKind::Delete);
        assert_eq!(operation.client_id, "server");
    }
}
