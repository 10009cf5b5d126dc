//! SQLite-backed client store.
//!
//! Rows are stored as JSON text keyed by id; the queue and metadata live in
//! dedicated tables so pending operations survive process restarts.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use tidepool_core::{Operation, OperationStatus};

use crate::error::{ClientError, Result};
use crate::store::{matches_filter, ClientStore};

const QUEUE_TABLE: &str = "tidepool_queue";
const META_TABLE: &str = "tidepool_meta";

pub struct SqliteClientStore {
    pool: SqlitePool,
}

impl SqliteClientStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Every pooled connection to `sqlite::memory:` would get its own
    /// private database, so the in-memory store pins the pool to one.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn checked_ident(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(ClientError::InvalidInput(format!(
            "invalid table name: {name}"
        )))
    }
}

fn row_id(data: &Value) -> Result<String> {
    data.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::InvalidInput("row is missing string `id`".into()))
}

impl SqliteClientStore {
    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(&format!("SELECT value FROM {META_TABLE} WHERE key = ?1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {META_TABLE} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ))
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ClientStore for SqliteClientStore {
    async fn init(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            let table = checked_ident(table)?;
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                )"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {QUEUE_TABLE} (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                enqueued_at INTEGER NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {META_TABLE} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert(&self, table: &str, data: Value) -> Result<Value> {
        let table = checked_ident(table)?;
        let id = row_id(&data)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
        ))
        .bind(&id)
        .bind(serde_json::to_string(&data)?)
        .execute(&self.pool)
        .await?;
        Ok(data)
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value> {
        let table = checked_ident(table)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
        ))
        .bind(id)
        .bind(serde_json::to_string(&data)?)
        .execute(&self.pool)
        .await?;
        Ok(data)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let table = checked_ident(table)?;
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>> {
        let table = checked_ident(table)?;
        let rows = sqlx::query(&format!("SELECT data FROM {table} ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Value = serde_json::from_str(&row.get::<String, _>("data"))?;
            if filter.is_none_or(|f| matches_filter(&data, f)) {
                results.push(data);
            }
        }
        Ok(results)
    }

    async fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let table = checked_ident(table)?;
        let row = sqlx::query(&format!("SELECT data FROM {table} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| serde_json::from_str(&row.get::<String, _>("data")).map_err(Into::into))
            .transpose()
    }

    async fn add_to_queue(&self, operation: &Operation) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {QUEUE_TABLE} (id, operation, status, error, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ))
        .bind(&operation.id)
        .bind(serde_json::to_string(operation)?)
        .bind(operation.status.as_str())
        .bind(&operation.error)
        .bind(operation.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_queue(&self) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT operation, status, error FROM {QUEUE_TABLE} ORDER BY rowid"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut queue = Vec::with_capacity(rows.len());
        for row in rows {
            let mut operation: Operation =
                serde_json::from_str(&row.get::<String, _>("operation"))?;
            operation.status = OperationStatus::from(row.get::<String, _>("status").as_str());
            operation.error = row.get::<Option<String>, _>("error");
            queue.push(operation);
        }
        Ok(queue)
    }

    async fn remove_from_queue(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query(&format!("DELETE FROM {QUEUE_TABLE} WHERE id = ?1"))
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn update_queue_status(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {QUEUE_TABLE} SET status = ?2, error = ?3 WHERE id = ?1"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_last_sync(&self) -> Result<i64> {
        Ok(self
            .get_meta("last_sync")
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0))
    }

    async fn set_last_sync(&self, timestamp: i64) -> Result<()> {
        self.set_meta("last_sync", &timestamp.to_string()).await
    }

    async fn get_client_id(&self) -> Result<String> {
        if let Some(existing) = self.get_meta("client_id").await? {
            return Ok(existing);
        }
        let generated = Uuid::new_v4().to_string();
        // INSERT OR IGNORE keeps the first writer's id under a race.
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {META_TABLE} (key, value) VALUES ('client_id', ?1)"
        ))
        .bind(&generated)
        .execute(&self.pool)
        .await?;
        self.get_meta("client_id")
            .await?
            .ok_or_else(|| ClientError::Database("client_id vanished after insert".into()))
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(self
            .get_meta("initialized")
            .await?
            .map(|value| value == "1")
            .unwrap_or(false))
    }

    async fn set_initialized(&self, initialized: bool) -> Result<()> {
        self.set_meta("initialized", if initialized { "1" } else { "0" })
            .await
    }
}
