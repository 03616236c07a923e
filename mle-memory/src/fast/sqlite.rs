//! SQLite-backed vector tables for the fast tier.
//!
//! Features:
//! - Named tables registered in `memory_tables`; rows live in `memory_rows`
//!   keyed by `(table_name, id)`
//! - Embeddings stored as little-endian f32 blobs
//! - Brute-force cosine search over a table's rows

use crate::error::{MemoryError, Result};
use crate::fast::store::{RowFilter, Table, TableStore};
use crate::types::{MemoryRecord, Metadata};
use crate::vector::{bytes_to_vec, cosine_distance, vec_to_bytes};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database file name inside the project state directory.
pub const FAST_DB_FILE: &str = "fast_memory.db";

const ROW_COLUMNS: &str = "id, text, vector, metadata";

/// How long a writer waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite store of named vector tables.
pub struct SqliteTableStore {
    db_path: PathBuf,
}

impl SqliteTableStore {
    /// Open (creating if needed) the store at `{dir}/fast_memory.db`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(FAST_DB_FILE);
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memory_tables (
                name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memory_rows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                text TEXT NOT NULL,
                vector BLOB NOT NULL,
                metadata TEXT,
                UNIQUE(table_name, id)
            );
            "#,
        )?;

        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn table(&self, name: &str) -> Box<dyn Table> {
        Box::new(SqliteTable {
            db_path: self.db_path.clone(),
            name: name.to_string(),
        })
    }
}

/// Run `f` against a fresh connection on the blocking pool.
async fn blocking<T, F>(db_path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let db_path = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        f(&mut conn)
    })
    .await?
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM memory_tables WHERE name = ?1)",
        params![name],
        |row| row.get(0),
    )
}

fn insert_rows(conn: &Connection, table: &str, rows: &[MemoryRecord]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO memory_rows (table_name, id, text, vector, metadata)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(table_name, id) DO UPDATE SET
            text = excluded.text,
            vector = excluded.vector,
            metadata = excluded.metadata
        "#,
    )?;

    for row in rows {
        let metadata = row
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        stmt.execute(params![
            table,
            row.id,
            row.text,
            vec_to_bytes(&row.vector),
            metadata
        ])?;
    }
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let id: String = row.get(0)?;
    let text: String = row.get(1)?;
    let vector: Vec<u8> = row.get(2)?;
    let metadata: Option<String> = row.get(3)?;

    let metadata = metadata
        .map(|m| serde_json::from_str::<Metadata>(&m))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(MemoryRecord {
        id,
        text,
        vector: bytes_to_vec(&vector),
        metadata,
        distance: None,
    })
}

fn all_rows(conn: &Connection, table: &str) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROW_COLUMNS} FROM memory_rows WHERE table_name = ?1 ORDER BY seq"
    ))?;
    let rows = stmt
        .query_map(params![table], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[async_trait]
impl TableStore for SqliteTableStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        blocking(&self.db_path, |conn| {
            let mut stmt = conn.prepare("SELECT name FROM memory_tables ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        blocking(&self.db_path, move |conn| Ok(table_exists(conn, &name)?)).await
    }

    async fn open_table(&self, name: &str) -> Result<Option<Box<dyn Table>>> {
        Ok(self
            .table_exists(name)
            .await?
            .then(|| self.table(name)))
    }

    async fn create_table(&self, name: &str, rows: Vec<MemoryRecord>) -> Result<Box<dyn Table>> {
        let table_name = name.to_string();
        blocking(&self.db_path, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if table_exists(&tx, &table_name)? {
                return Err(MemoryError::TableExists(table_name));
            }
            tx.execute(
                "INSERT INTO memory_tables (name, created_at) VALUES (?1, ?2)",
                params![table_name, chrono::Utc::now().to_rfc3339()],
            )?;
            insert_rows(&tx, &table_name, &rows)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(table = name, "Created fast memory table");
        Ok(self.table(name))
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        let table_name = name.to_string();
        blocking(&self.db_path, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM memory_rows WHERE table_name = ?1",
                params![table_name],
            )?;
            tx.execute(
                "DELETE FROM memory_tables WHERE name = ?1",
                params![table_name],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(table = name, "Dropped fast memory table");
        Ok(())
    }
}

/// A table inside a [`SqliteTableStore`].
struct SqliteTable {
    db_path: PathBuf,
    name: String,
}

#[async_trait]
impl Table for SqliteTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, rows: Vec<MemoryRecord>) -> Result<()> {
        let table_name = self.name.clone();
        blocking(&self.db_path, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !table_exists(&tx, &table_name)? {
                return Err(MemoryError::TableNotFound(table_name));
            }
            insert_rows(&tx, &table_name, &rows)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<MemoryRecord>> {
        let table_name = self.name.clone();
        let query = vector.to_vec();
        blocking(&self.db_path, move |conn| {
            let mut rows = all_rows(conn, &table_name)?;
            for row in &mut rows {
                row.distance = Some(cosine_distance(&query, &row.vector));
            }
            rows.sort_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            rows.truncate(limit);
            Ok(rows)
        })
        .await
    }

    async fn scan(
        &self,
        filter: Option<&RowFilter>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        let table_name = self.name.clone();
        let filter = filter.cloned();
        blocking(&self.db_path, move |conn| {
            let rows: Vec<MemoryRecord> = match &filter {
                Some(RowFilter::Id(id)) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {ROW_COLUMNS} FROM memory_rows WHERE table_name = ?1 AND id = ?2"
                    ))?;
                    stmt.query_row(params![table_name, id], row_to_record)
                        .optional()?
                        .into_iter()
                        .collect()
                }
                Some(other) => all_rows(conn, &table_name)?
                    .into_iter()
                    .filter(|r| other.matches(r))
                    .collect(),
                None => all_rows(conn, &table_name)?,
            };

            Ok(match limit {
                Some(limit) => rows.into_iter().take(limit).collect(),
                None => rows,
            })
        })
        .await
    }

    async fn delete(&self, filter: &RowFilter) -> Result<usize> {
        let table_name = self.name.clone();
        let filter = filter.clone();
        blocking(&self.db_path, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let affected = match &filter {
                RowFilter::Id(id) => tx.execute(
                    "DELETE FROM memory_rows WHERE table_name = ?1 AND id = ?2",
                    params![table_name, id],
                )?,
                other => {
                    let ids: Vec<String> = all_rows(&tx, &table_name)?
                        .into_iter()
                        .filter(|r| other.matches(r))
                        .map(|r| r.id)
                        .collect();
                    let mut affected = 0;
                    for id in ids {
                        affected += tx.execute(
                            "DELETE FROM memory_rows WHERE table_name = ?1 AND id = ?2",
                            params![table_name, id],
                        )?;
                    }
                    affected
                }
            };
            tx.commit()?;
            Ok(affected)
        })
        .await
    }

    async fn count_rows(&self) -> Result<usize> {
        let table_name = self.name.clone();
        blocking(&self.db_path, move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memory_rows WHERE table_name = ?1",
                params![table_name],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}
