//! Postgres-backed server store.
//!
//! Each synced physical table holds the domain payload as JSONB plus the
//! four sync metadata columns, so version guards and delta scans stay plain
//! SQL. The adapter also owns the sync log and client state tables.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Postgres, QueryBuilder, Row};

use tidepool_core::{record, time, ClientState, Operation, SyncSchema};

use crate::error::{StoreError, StoreResult};
use crate::store::ServerStore;

const SYNC_LOG_TABLE: &str = "tidepool_sync_log";
const CLIENT_STATE_TABLE: &str = "tidepool_client_state";

pub struct PgServerStore {
    pool: Pool<Postgres>,
}

impl PgServerStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Creates the physical tables for every configured logical table plus
    /// the bookkeeping tables. Idempotent.
    pub async fn init(&self, schema: &SyncSchema) -> StoreResult<()> {
        for (_, config) in schema.iter() {
            let table = checked_ident(&config.table)?;
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    data JSONB NOT NULL,
                    _version BIGINT NOT NULL,
                    _updated_at BIGINT NOT NULL,
                    _client_id TEXT,
                    _is_deleted BOOLEAN NOT NULL DEFAULT FALSE
                )"
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_updated_at_idx
                 ON {table} (_updated_at)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {SYNC_LOG_TABLE} (
                seq BIGSERIAL PRIMARY KEY,
                op_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                client_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                logged_at BIGINT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {CLIENT_STATE_TABLE} (
                client_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                last_sync BIGINT NOT NULL,
                last_active BIGINT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Physical table names come from server configuration, not from clients,
/// but they are interpolated into SQL, so reject anything that is not a
/// plain identifier.
fn checked_ident(name: &str) -> StoreResult<&str> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidRow(format!(
            "invalid physical table name: {name}"
        )))
    }
}

fn split_row(data: &Value) -> StoreResult<(String, Value, i64, i64, Option<String>, bool)> {
    let id = data
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidRow("row is missing string `id`".into()))?;
    Ok((
        id,
        record::strip_meta(data),
        record::version(data),
        record::updated_at(data),
        record::client_id(data).map(str::to_string),
        record::is_deleted(data),
    ))
}

fn merge_row(row: &sqlx::postgres::PgRow) -> StoreResult<Value> {
    let mut data: Value = row.try_get("data")?;
    let version: i64 = row.try_get("_version")?;
    let updated_at: i64 = row.try_get("_updated_at")?;
    let client_id: Option<String> = row.try_get("_client_id")?;
    let is_deleted: bool = row.try_get("_is_deleted")?;
    let id: String = row.try_get("id")?;

    let map = data
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidRow("stored payload is not an object".into()))?;
    map.insert("id".into(), id.into());
    map.insert(record::VERSION_FIELD.into(), version.into());
    map.insert(record::UPDATED_AT_FIELD.into(), updated_at.into());
    map.insert(
        record::CLIENT_ID_FIELD.into(),
        client_id.map(Value::from).unwrap_or(Value::Null),
    );
    map.insert(record::DELETED_FIELD.into(), is_deleted.into());
    Ok(data)
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &Value) {
    if let Some(fields) = filter.as_object() {
        for (key, expected) in fields {
            let text = match expected {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            builder.push(" AND data->>");
            builder.push_bind(key.clone());
            builder.push(" = ");
            builder.push_bind(text);
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl ServerStore for PgServerStore {
    async fn insert(&self, table: &str, data: Value) -> StoreResult<Value> {
        let table = checked_ident(table)?;
        let (id, payload, version, updated_at, client_id, is_deleted) = split_row(&data)?;

        let result = sqlx::query(&format!(
            "INSERT INTO {table} (id, data, _version, _updated_at, _client_id, _is_deleted)
             VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(&id)
        .bind(&payload)
        .bind(version)
        .bind(updated_at)
        .bind(&client_id)
        .bind(is_deleted)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(data),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Duplicate {
                table: table.to_string(),
                id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        expected_version: i64,
    ) -> StoreResult<Value> {
        let table = checked_ident(table)?;
        let (_, payload, version, updated_at, client_id, is_deleted) = split_row(&data)?;

        let result = sqlx::query(&format!(
            "UPDATE {table}
             SET data = $2, _version = $3, _updated_at = $4, _client_id = $5, _is_deleted = $6
             WHERE id = $1 AND _version = $7"
        ))
        .bind(id)
        .bind(&payload)
        .bind(version)
        .bind(updated_at)
        .bind(&client_id)
        .bind(is_deleted)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a vanished row from a concurrent writer.
            return match self.find_one(table, id).await? {
                Some(current) => Err(StoreError::VersionMismatch {
                    table: table.to_string(),
                    id: id.to_string(),
                    expected: expected_version,
                    found: record::version(&current),
                }),
                None => Err(StoreError::NotFound {
                    table: table.to_string(),
                    id: id.to_string(),
                }),
            };
        }
        Ok(data)
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        deleted_at: i64,
        client_id: Option<&str>,
    ) -> StoreResult<()> {
        let table = checked_ident(table)?;
        sqlx::query(&format!(
            "UPDATE {table}
             SET _version = _version + CASE WHEN _is_deleted THEN 0 ELSE 1 END,
                 _is_deleted = TRUE,
                 _updated_at = $2,
                 _client_id = $3
             WHERE id = $1"
        ))
        .bind(id)
        .bind(deleted_at)
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_one(&self, table: &str, id: &str) -> StoreResult<Option<Value>> {
        let table = checked_ident(table)?;
        let row = sqlx::query(&format!(
            "SELECT id, data, _version, _updated_at, _client_id, _is_deleted
             FROM {table} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(merge_row).transpose()
    }

    async fn find(&self, table: &str, filter: Option<&Value>) -> StoreResult<Vec<Value>> {
        let table = checked_ident(table)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT id, data, _version, _updated_at, _client_id, _is_deleted
             FROM {table} WHERE _is_deleted = FALSE"
        ));
        if let Some(filter) = filter {
            push_filter(&mut builder, filter);
        }
        builder.push(" ORDER BY _updated_at ASC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(merge_row).collect()
    }

    async fn get_changes_since(
        &self,
        table: &str,
        since: i64,
        filter: Option<&Value>,
        exclude_client_id: Option<&str>,
    ) -> StoreResult<Vec<Value>> {
        let table = checked_ident(table)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT id, data, _version, _updated_at, _client_id, _is_deleted
             FROM {table} WHERE _updated_at > "
        ));
        builder.push_bind(since);
        if let Some(filter) = filter {
            push_filter(&mut builder, filter);
        }
        if let Some(excluded) = exclude_client_id {
            builder.push(" AND (_client_id IS NULL OR _client_id <> ");
            builder.push_bind(excluded);
            builder.push(")");
        }
        builder.push(" ORDER BY _updated_at ASC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(merge_row).collect()
    }

    async fn batch_insert(&self, table: &str, rows: Vec<Value>) -> StoreResult<()> {
        for row in rows {
            self.insert(table, row).await?;
        }
        Ok(())
    }

    async fn batch_update(&self, table: &str, rows: Vec<(String, Value, i64)>) -> StoreResult<()> {
        for (id, data, expected_version) in rows {
            self.update(table, &id, data, expected_version).await?;
        }
        Ok(())
    }

    async fn check_conflict(
        &self,
        table: &str,
        id: &str,
        expected_version: i64,
    ) -> StoreResult<bool> {
        let table = checked_ident(table)?;
        let version: Option<i64> =
            sqlx::query_scalar(&format!("SELECT _version FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(|found| found != expected_version).unwrap_or(false))
    }

    async fn log_sync_operation(&self, operation: &Operation, user_id: &str) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {SYNC_LOG_TABLE}
                 (op_id, table_name, kind, client_id, user_id, payload, logged_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(&operation.id)
        .bind(&operation.table)
        .bind(operation.kind.as_str())
        .bind(&operation.client_id)
        .bind(user_id)
        .bind(&operation.data)
        .bind(time::now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_client_state(&self, client_id: &str, user_id: &str) -> StoreResult<()> {
        let now = time::now_millis();
        sqlx::query(&format!(
            "INSERT INTO {CLIENT_STATE_TABLE} (client_id, user_id, last_sync, last_active)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (client_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 last_sync = excluded.last_sync,
                 last_active = excluded.last_active"
        ))
        .bind(client_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_client_state(&self, client_id: &str) -> StoreResult<Option<ClientState>> {
        let row = sqlx::query(&format!(
            "SELECT client_id, user_id, last_sync, last_active
             FROM {CLIENT_STATE_TABLE} WHERE client_id = $1"
        ))
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ClientState {
                client_id: row.try_get("client_id")?,
                user_id: row.try_get("user_id")?,
                last_sync: row.try_get("last_sync")?,
                last_active: row.try_get("last_active")?,
            })
        })
        .transpose()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
