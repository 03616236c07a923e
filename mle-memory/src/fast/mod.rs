//! Fast memory tier: embedding-indexed tables for low-latency recall.
//!
//! [`FastMemory`] embeds text through an [`EmbeddingProvider`] and keeps rows
//! in named tables of a [`TableStore`]. Reads against a missing table return
//! empty results; writes create the table on demand.

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteTableStore;
pub use store::{RowFilter, Table, TableStore};

use crate::embeddings::{create_embedding_provider, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::types::{BatchMetadata, MemoryRecord, Metadata};
use mle_common::config::DEFAULT_TABLE_NAME;
use mle_common::ProjectConfig;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Embedding-indexed local store.
pub struct FastMemory {
    store: Arc<dyn TableStore>,
    embedding: Arc<dyn EmbeddingProvider>,
    table_name: String,
}

impl FastMemory {
    pub fn new(
        store: Arc<dyn TableStore>,
        embedding: Arc<dyn EmbeddingProvider>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            embedding,
            table_name: table_name.into(),
        }
    }

    /// Open a SQLite-backed fast tier in `db_dir`.
    pub fn open(
        db_dir: &Path,
        embedding: Arc<dyn EmbeddingProvider>,
        table_name: Option<&str>,
    ) -> Result<Self> {
        let store = SqliteTableStore::open(db_dir)?;
        Ok(Self::new(
            Arc::new(store),
            embedding,
            table_name.unwrap_or(DEFAULT_TABLE_NAME),
        ))
    }

    /// Build the fast tier for a project from its configuration.
    pub fn from_config(project_path: &Path, config: &ProjectConfig) -> Result<Self> {
        let embedding = create_embedding_provider(config)?;
        Self::open(
            &config.db_dir(project_path),
            embedding,
            Some(&config.memory.table_name),
        )
    }

    /// Default table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn embedding(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedding
    }

    fn resolve<'a>(&'a self, table_name: Option<&'a str>) -> &'a str {
        table_name.unwrap_or(&self.table_name)
    }

    /// Embed and store `texts`, returning their ids in input order.
    ///
    /// Missing ids are generated. An existing table is appended to; otherwise
    /// it is created with these rows.
    pub async fn add<I, S>(
        &self,
        texts: I,
        metadata: impl Into<BatchMetadata>,
        table_name: Option<&str>,
        ids: Option<Vec<String>>,
    ) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let texts: Vec<String> = texts.into_iter().map(Into::into).collect();
        let metadata = expand_metadata(metadata.into(), texts.len())?;
        let ids = match ids {
            Some(ids) if ids.len() != texts.len() => {
                return Err(MemoryError::InvalidInput(format!(
                    "got {} ids for {} texts",
                    ids.len(),
                    texts.len()
                )));
            }
            Some(ids) if ids.iter().any(|id| id.is_empty()) => {
                return Err(MemoryError::InvalidInput("ids must be non-empty".into()));
            }
            Some(ids) => ids,
            None => texts.iter().map(|_| Uuid::new_v4().to_string()).collect(),
        };

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.embedding.embed(&refs).await?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "{} returned {} vectors for {} texts",
                self.embedding.name(),
                vectors.len(),
                texts.len()
            )));
        }

        let rows: Vec<MemoryRecord> = ids
            .iter()
            .zip(texts)
            .zip(vectors)
            .zip(metadata)
            .map(|(((id, text), vector), metadata)| {
                MemoryRecord::new(id.clone(), text, vector).with_metadata(metadata)
            })
            .collect();

        let table_name = self.resolve(table_name);
        let count = rows.len();
        match self.store.open_table(table_name).await? {
            Some(table) => table.add(rows).await?,
            None => self.create_or_append(table_name, rows).await?,
        }

        tracing::debug!(table = table_name, count, "Added fast memories");
        Ok(ids)
    }

    /// Create `table_name` with `rows`, appending instead if another writer
    /// created it first.
    async fn create_or_append(&self, table_name: &str, rows: Vec<MemoryRecord>) -> Result<()> {
        match self.store.create_table(table_name, rows.clone()).await {
            Ok(_) => Ok(()),
            Err(MemoryError::TableExists(_)) => {
                tracing::debug!(table = table_name, "Table created concurrently, appending");
                match self.store.open_table(table_name).await? {
                    Some(table) => table.add(rows).await,
                    None => Err(MemoryError::TableNotFound(table_name.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Store a single text and return its id.
    pub async fn add_text(
        &self,
        text: impl Into<String>,
        metadata: Option<Metadata>,
        table_name: Option<&str>,
    ) -> Result<String> {
        let text: String = text.into();
        let mut ids = self.add([text], metadata, table_name, None).await?;
        ids.pop()
            .ok_or_else(|| MemoryError::InvalidInput("no id returned for text".into()))
    }

    /// Top `n_results` rows per query text, closest first.
    pub async fn query<S: AsRef<str>>(
        &self,
        query_texts: &[S],
        table_name: Option<&str>,
        n_results: usize,
    ) -> Result<Vec<Vec<MemoryRecord>>> {
        let table_name = self.resolve(table_name);
        let Some(table) = self.store.open_table(table_name).await? else {
            return Ok(vec![Vec::new(); query_texts.len()]);
        };
        if query_texts.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = query_texts.iter().map(AsRef::as_ref).collect();
        let vectors = self.embedding.embed(&refs).await?;
        if vectors.len() != refs.len() {
            return Err(MemoryError::Embedding(format!(
                "{} returned {} vectors for {} queries",
                self.embedding.name(),
                vectors.len(),
                refs.len()
            )));
        }

        let mut results = Vec::with_capacity(vectors.len());
        for vector in &vectors {
            results.push(table.search(vector, n_results).await?);
        }

        tracing::debug!(table = table_name, queries = refs.len(), n_results, "Queried fast memory");
        Ok(results)
    }

    /// Every id in the table.
    pub async fn list_all_keys(&self, table_name: Option<&str>) -> Result<Vec<String>> {
        match self.store.open_table(self.resolve(table_name)).await? {
            Some(table) => Ok(table
                .scan(None, None)
                .await?
                .into_iter()
                .map(|r| r.id)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get(
        &self,
        record_id: &str,
        table_name: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        match self.store.open_table(self.resolve(table_name)).await? {
            Some(table) => Ok(table
                .scan(Some(&RowFilter::id(record_id)), Some(1))
                .await?
                .into_iter()
                .next()),
            None => Ok(None),
        }
    }

    /// Rows whose metadata field `key` equals `value`.
    pub async fn get_by_metadata(
        &self,
        key: &str,
        value: impl Into<serde_json::Value>,
        table_name: Option<&str>,
        n_results: usize,
    ) -> Result<Vec<MemoryRecord>> {
        match self.store.open_table(self.resolve(table_name)).await? {
            Some(table) => {
                table
                    .scan(Some(&RowFilter::metadata_eq(key, value)), Some(n_results))
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Delete a row by id. A missing table is a successful no-op.
    pub async fn delete(&self, record_id: &str, table_name: Option<&str>) -> Result<bool> {
        self.delete_matching(RowFilter::id(record_id), table_name)
            .await
    }

    /// Delete rows whose metadata field `key` equals `value`.
    pub async fn delete_by_metadata(
        &self,
        key: &str,
        value: impl Into<serde_json::Value>,
        table_name: Option<&str>,
    ) -> Result<bool> {
        self.delete_matching(RowFilter::metadata_eq(key, value), table_name)
            .await
    }

    async fn delete_matching(&self, filter: RowFilter, table_name: Option<&str>) -> Result<bool> {
        let table_name = self.resolve(table_name);
        if let Some(table) = self.store.open_table(table_name).await? {
            let removed = table.delete(&filter).await?;
            tracing::debug!(table = table_name, removed, "Deleted fast memories");
        }
        Ok(true)
    }

    /// Drop a table. An absent table counts as dropped.
    pub async fn drop(&self, table_name: Option<&str>) -> Result<bool> {
        let table_name = self.resolve(table_name);
        if self.store.table_exists(table_name).await? {
            self.store.drop_table(table_name).await?;
        }
        Ok(true)
    }

    pub async fn count(&self, table_name: Option<&str>) -> Result<usize> {
        match self.store.open_table(self.resolve(table_name)).await? {
            Some(table) => table.count_rows().await,
            None => Ok(0),
        }
    }

    /// Drop the default table.
    pub async fn reset(&self) -> Result<()> {
        self.drop(None).await?;
        Ok(())
    }
}

fn expand_metadata(metadata: BatchMetadata, len: usize) -> Result<Vec<Option<Metadata>>> {
    match metadata {
        BatchMetadata::None => Ok(vec![None; len]),
        BatchMetadata::Broadcast(m) => Ok(vec![Some(m); len]),
        BatchMetadata::PerItem(items) if items.len() == len => Ok(items),
        BatchMetadata::PerItem(items) => Err(MemoryError::InvalidInput(format!(
            "got {} metadata entries for {} texts",
            items.len(),
            len
        ))),
    }
}
