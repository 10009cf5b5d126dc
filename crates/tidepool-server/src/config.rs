//! Environment-driven server configuration.
//!
//! Real deployments usually construct [`ServerConfig`] in code (the sync
//! schema carries closures); `load_config` covers the common case of a
//! standalone binary syncing plain user-scoped tables.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use tidepool_core::{SyncSchema, TableConfig};

use crate::realtime::RealtimeOptions;

pub struct ServerConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub max_db_connections: u32,
    /// Advisory push batch ceiling; oversized batches are logged.
    pub batch_size: usize,
    pub schema: SyncSchema,
    pub realtime: RealtimeOptions,
}

pub fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing env: {name}"))
}

pub fn socket_addr_from_env(name: &str, default: &str) -> Result<SocketAddr> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    SocketAddr::from_str(&value).map_err(|err| anyhow!("invalid socket addr for {name}: {err}"))
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn list_env(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builds the schema from `TIDEPOOL_TABLES`, a comma-separated list of
/// `logical` or `logical:physical` entries. Tables listed in
/// `TIDEPOOL_USER_SCOPED` are filtered to rows owned by the caller.
fn schema_from_env() -> Result<SyncSchema> {
    let entries = list_env("TIDEPOOL_TABLES");
    if entries.is_empty() {
        return Err(anyhow!("missing env: TIDEPOOL_TABLES"));
    }
    let scoped = list_env("TIDEPOOL_USER_SCOPED");

    let mut schema = SyncSchema::new();
    for entry in entries {
        let (logical, physical) = match entry.split_once(':') {
            Some((logical, physical)) => (logical.to_string(), physical.to_string()),
            None => (entry.clone(), entry.clone()),
        };
        let mut config = TableConfig::new(physical);
        if scoped.contains(&logical) {
            config = config.with_where(|user_id| json!({ "user_id": user_id }));
        }
        schema = schema.with_table(logical, config);
    }
    Ok(schema)
}

pub fn load_config() -> Result<ServerConfig> {
    let addr = socket_addr_from_env("TIDEPOOL_ADDR", "0.0.0.0:8087")?;
    let database_url = required_env("DATABASE_URL")?;
    let schema = schema_from_env()?;

    let allowed_tables = list_env("TIDEPOOL_ALLOWED_TABLES");
    let realtime = RealtimeOptions {
        enabled: parse_env("TIDEPOOL_REALTIME_ENABLED", true),
        heartbeat_interval_ms: parse_env("TIDEPOOL_HEARTBEAT_MS", 30_000),
        connection_timeout_ms: parse_env("TIDEPOOL_CONNECTION_TIMEOUT_MS", 0),
        max_connections_per_user: parse_env("TIDEPOOL_MAX_CONNECTIONS_PER_USER", 5),
        allowed_tables: (!allowed_tables.is_empty()).then_some(allowed_tables),
    };

    Ok(ServerConfig {
        addr,
        database_url,
        max_db_connections: parse_env("TIDEPOOL_DB_POOL", 10),
        batch_size: parse_env("TIDEPOOL_BATCH_SIZE", 50),
        schema,
        realtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.key);
        }
    }

    fn set_env(key: &'static str, value: &str) -> EnvGuard {
        env::set_var(key, value);
        EnvGuard { key }
    }

    #[test]
    fn required_env_missing_returns_error() {
        env::remove_var("TIDEPOOL_TEST_MISSING");
        assert!(required_env("TIDEPOOL_TEST_MISSING").is_err());
    }

    #[test]
    fn socket_addr_from_env_uses_default() {
        env::remove_var("TIDEPOOL_TEST_SOCKET");
        let addr = socket_addr_from_env("TIDEPOOL_TEST_SOCKET", "127.0.0.1:8087").unwrap();
        assert_eq!(addr, "127.0.0.1:8087".parse().unwrap());
    }

    #[test]
    fn socket_addr_from_env_invalid_returns_error() {
        let _guard = set_env("TIDEPOOL_TEST_SOCKET_BAD", "not-a-socket");
        assert!(socket_addr_from_env("TIDEPOOL_TEST_SOCKET_BAD", "127.0.0.1:1").is_err());
    }

    #[test]
    fn schema_from_env_parses_physical_names_and_scoping() {
        let _tables = set_env("TIDEPOOL_TABLES", "todos:app_todos, notes");
        let _scoped = set_env("TIDEPOOL_USER_SCOPED", "todos");

        let schema = schema_from_env().unwrap();
        assert_eq!(schema.len(), 2);

        let todos = schema.table("todos").unwrap();
        assert_eq!(todos.table, "app_todos");
        assert!(todos.is_user_scoped());

        let notes = schema.table("notes").unwrap();
        assert_eq!(notes.table, "notes");
        assert!(!notes.is_user_scoped());
    }
}
