//! Per-table sync configuration.
//!
//! The server consults the schema on every push and pull: tables not listed
//! here are refused, `where_filter` scopes rows to their owner, `transform`
//! redacts or reshapes every record leaving the server.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::conflict::ConflictStrategy;

/// Builds the row-level access filter document for a user, e.g.
/// `{"user_id": "<uid>"}`. Absence means the table is public/internal.
pub type RowFilter = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Projection applied to every record leaving the server.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Configuration of one synced logical table.
#[derive(Clone)]
pub struct TableConfig {
    /// Physical table name in the server store.
    pub table: String,
    /// Optional column projection; `None` exposes every column.
    pub columns: Option<Vec<String>>,
    pub where_filter: Option<RowFilter>,
    pub transform: Option<Transform>,
    pub conflict_resolution: ConflictStrategy,
}

impl TableConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: None,
            where_filter: None,
            transform: None,
            conflict_resolution: ConflictStrategy::default(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Scopes the table to rows owned by the authenticated user. The filter
    /// closure receives the user id and returns the filter document passed
    /// to the store adapter.
    pub fn with_where<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        self.where_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    /// True when the table enforces per-user ownership.
    pub fn is_user_scoped(&self) -> bool {
        self.where_filter.is_some()
    }
}

impl std::fmt::Debug for TableConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TableConfig")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("where_filter", &self.where_filter.is_some())
            .field("transform", &self.transform.is_some())
            .field("conflict_resolution", &self.conflict_resolution)
            .finish()
    }
}

/// The set of logical tables participating in sync, keyed by logical name.
#[derive(Debug, Clone, Default)]
pub struct SyncSchema {
    tables: HashMap<String, TableConfig>,
}

impl SyncSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, config: TableConfig) -> Self {
        self.tables.insert(name.into(), config);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableConfig)> {
        self.tables
            .iter()
            .map(|(name, config)| (name.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
