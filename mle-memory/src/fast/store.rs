//! Backing-store capability for the fast tier.
//!
//! A [`TableStore`] manages named tables of embedded records. Opening a
//! missing table yields `None` instead of an error so callers can treat
//! absence as an empty result.

use crate::error::Result;
use crate::types::MemoryRecord;
use async_trait::async_trait;

/// Row predicate supported by fast-tier tables.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    /// Exact id match
    Id(String),
    /// Equality on one top-level metadata field
    MetadataEq {
        key: String,
        value: serde_json::Value,
    },
}

impl RowFilter {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn metadata_eq(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::MetadataEq {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            Self::Id(id) => record.id == *id,
            Self::MetadataEq { key, value } => record.metadata_value(key) == Some(value),
        }
    }
}

/// Connection to a set of named vector tables.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Backend name (e.g., "sqlite")
    fn name(&self) -> &str;

    /// Names of all existing tables.
    async fn table_names(&self) -> Result<Vec<String>>;

    /// Open a table, or `None` if it does not exist.
    async fn open_table(&self, name: &str) -> Result<Option<Box<dyn Table>>>;

    /// Create a table holding `rows`. Fails if the name is taken.
    async fn create_table(&self, name: &str, rows: Vec<MemoryRecord>) -> Result<Box<dyn Table>>;

    /// Remove a table and all its rows.
    async fn drop_table(&self, name: &str) -> Result<()>;

    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.table_names().await?.iter().any(|t| t == name))
    }
}

/// An open table.
#[async_trait]
pub trait Table: Send + Sync {
    fn name(&self) -> &str;

    /// Append rows; a row whose id already exists replaces the stored row.
    async fn add(&self, rows: Vec<MemoryRecord>) -> Result<()>;

    /// Nearest neighbours of `vector`, closest first, with `distance` set.
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Rows in insertion order, optionally filtered and capped.
    async fn scan(&self, filter: Option<&RowFilter>, limit: Option<usize>)
        -> Result<Vec<MemoryRecord>>;

    /// Delete matching rows, returning how many were removed.
    async fn delete(&self, filter: &RowFilter) -> Result<usize>;

    async fn count_rows(&self) -> Result<usize>;
}
