//! Embedded slow-tier engine on SQLite.
//!
//! Messages are stored verbatim, or, with `infer`, reduced to facts by a
//! [`CompletionModel`] first. Facts already known for the agent are not
//! duplicated; only their `updated_at` moves.

use crate::embeddings::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::model::CompletionModel;
use crate::slow::SlowMemoryBackend;
use crate::types::{AddOutcome, EventKind, MemoryEvent, Message, Metadata, SlowMemoryItem};
use crate::vector::{bytes_to_vec, cosine_similarity, vec_to_bytes};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::sync::Arc;
use uuid::Uuid;

/// Database file name inside the project state directory.
pub const SLOW_DB_FILE: &str = "slow_memory.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// System prompt for fact extraction when the caller gives none.
pub const FACT_EXTRACTION_PROMPT: &str = "You extract durable facts from a conversation \
between a user and an ML engineering assistant. Keep preferences, decisions, project \
details and results worth remembering; skip greetings and small talk. Reply with JSON \
only, in the form {\"facts\": [\"fact one\", \"fact two\"]}. Reply {\"facts\": []} when \
nothing is worth keeping.";

#[derive(Debug, Deserialize)]
struct ExtractedFacts {
    #[serde(default)]
    facts: Vec<String>,
}

/// SQLite-backed slow memory.
pub struct LocalMemoryEngine {
    db_path: PathBuf,
    embedding: Arc<dyn EmbeddingProvider>,
    model: Option<Arc<dyn CompletionModel>>,
}

impl LocalMemoryEngine {
    /// Open (creating if needed) `{dir}/slow_memory.db`.
    pub fn open(dir: &Path, embedding: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(SLOW_DB_FILE);
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                memory TEXT NOT NULL,
                metadata TEXT,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_memories_agent ON memories(agent_id);
            "#,
        )?;

        Ok(Self {
            db_path,
            embedding,
            model: None,
        })
    }

    /// Model used to extract facts when `infer` is requested.
    pub fn with_model(mut self, model: Arc<dyn CompletionModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn extract_facts(&self, messages: &[Message], prompt: Option<&str>) -> Result<Vec<String>> {
        let model = self.model.as_ref().ok_or_else(|| {
            MemoryError::Config("fact extraction requires a completion model".into())
        })?;

        let conversation = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let reply = model
            .query(Some(prompt.unwrap_or(FACT_EXTRACTION_PROMPT)), &conversation)
            .await?;

        parse_facts(&reply)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            f(&mut conn)
        })
        .await?
    }
}

/// Parse `{"facts": [...]}` from a model reply, tolerating code fences and
/// surrounding prose.
fn parse_facts(reply: &str) -> Result<Vec<String>> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            return Err(MemoryError::Model(format!(
                "fact extraction reply is not JSON: {reply}"
            )))
        }
    };

    let parsed: ExtractedFacts = serde_json::from_str(json)
        .map_err(|e| MemoryError::Model(format!("invalid fact extraction reply: {e}")))?;
    Ok(parsed
        .facts
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect())
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<(SlowMemoryItem, Vec<u8>)> {
    let metadata: Option<String> = row.get(3)?;
    let metadata = metadata
        .map(|m| serde_json::from_str::<Metadata>(&m))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?
        .unwrap_or_default();

    let item = SlowMemoryItem {
        id: row.get(0)?,
        agent_id: Some(row.get(1)?),
        memory: row.get(2)?,
        metadata,
        created_at: Some(row.get(5)?),
        updated_at: Some(row.get(6)?),
        score: None,
    };
    Ok((item, row.get(4)?))
}

fn agent_rows(conn: &Connection, agent_id: &str) -> Result<Vec<(SlowMemoryItem, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, agent_id, memory, metadata, embedding, created_at, updated_at
        FROM memories
        WHERE agent_id = ?1
        ORDER BY created_at, rowid
        "#,
    )?;
    let rows = stmt
        .query_map(params![agent_id], row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[async_trait]
impl SlowMemoryBackend for LocalMemoryEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn add(
        &self,
        agent_id: &str,
        messages: &[Message],
        metadata: Option<&Metadata>,
        prompt: Option<&str>,
        infer: bool,
    ) -> Result<AddOutcome> {
        let texts: Vec<String> = if infer {
            self.extract_facts(messages, prompt).await?
        } else {
            messages
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .map(|m| m.content.clone())
                .collect()
        };
        if texts.is_empty() {
            return Ok(AddOutcome::default());
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.embedding.embed(&refs).await?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "{} returned {} vectors for {} memories",
                self.embedding.name(),
                vectors.len(),
                texts.len()
            )));
        }

        let agent_id = agent_id.to_string();
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        let results = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
                let mut results = Vec::with_capacity(texts.len());

                for (text, vector) in texts.into_iter().zip(vectors) {
                    if infer {
                        let existing: Option<String> = tx
                            .query_row(
                                "SELECT id FROM memories WHERE agent_id = ?1 AND memory = ?2",
                                params![agent_id, text],
                                |row| row.get(0),
                            )
                            .optional()?;
                        if let Some(id) = existing {
                            tx.execute(
                                "UPDATE memories SET updated_at = ?1 WHERE id = ?2",
                                params![now, id],
                            )?;
                            results.push(MemoryEvent {
                                id,
                                memory: text,
                                event: EventKind::None,
                            });
                            continue;
                        }
                    }

                    let id = Uuid::new_v4().to_string();
                    tx.execute(
                        r#"
                        INSERT INTO memories
                            (id, agent_id, memory, metadata, embedding, created_at, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                        "#,
                        params![id, agent_id, text, metadata, vec_to_bytes(&vector), now],
                    )?;
                    results.push(MemoryEvent {
                        id,
                        memory: text,
                        event: EventKind::Add,
                    });
                }

                tx.commit()?;
                Ok(results)
            })
            .await?;

        Ok(AddOutcome { results })
    }

    async fn search(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SlowMemoryItem>> {
        let query_vec = self.embedding.embed_one(query).await?;
        let agent_id = agent_id.to_string();
        self.blocking(move |conn| {
            let mut scored: Vec<SlowMemoryItem> = agent_rows(conn, &agent_id)?
                .into_iter()
                .map(|(mut item, blob)| {
                    item.score = Some(cosine_similarity(&query_vec, &bytes_to_vec(&blob)));
                    item
                })
                .collect();
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    async fn get_all(
        &self,
        agent_id: &str,
        filters: Option<&Metadata>,
        limit: usize,
    ) -> Result<Vec<SlowMemoryItem>> {
        let agent_id = agent_id.to_string();
        let filters = filters.cloned();
        self.blocking(move |conn| {
            Ok(agent_rows(conn, &agent_id)?
                .into_iter()
                .map(|(item, _)| item)
                .filter(|item| {
                    filters.as_ref().map_or(true, |f| {
                        f.iter().all(|(k, v)| item.metadata.get(k) == Some(v))
                    })
                })
                .take(limit)
                .collect())
        })
        .await
    }

    async fn reset(&self, agent_id: &str) -> Result<()> {
        let agent_id = agent_id.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM memories WHERE agent_id = ?1", params![agent_id])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::tests::MockEmbedding;
    use crate::model::tests::ScriptedModel;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalMemoryEngine) {
        let tmp = TempDir::new().unwrap();
        let engine = LocalMemoryEngine::open(tmp.path(), Arc::new(MockEmbedding::new(32))).unwrap();
        (tmp, engine)
    }

    #[tokio::test]
    async fn raw_add_stores_each_message() {
        let (_tmp, engine) = setup();
        let metadata: Metadata = serde_json::from_value(json!({ "stage": "eda" })).unwrap();
        let outcome = engine
            .add(
                "default",
                &[Message::user("plot the loss"), Message::assistant("done")],
                Some(&metadata),
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|e| e.event == EventKind::Add));

        let items = engine.get_all("default", None, 100).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].memory, "plot the loss");
        assert_eq!(items[0].metadata.get("stage"), Some(&json!("eda")));
        assert!(items[0].created_at.is_some());
        assert_eq!(items[0].created_at, items[0].updated_at);
    }

    #[tokio::test]
    async fn infer_without_model_is_config_error() {
        let (_tmp, engine) = setup();
        let err = engine
            .add("default", &[Message::user("hi")], None, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[tokio::test]
    async fn infer_stores_facts_and_skips_known_ones() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::replying(
            "```json\n{\"facts\": [\"Uses polars\", \"Trains on GPU\"]}\n```",
        ));
        let engine = LocalMemoryEngine::open(tmp.path(), Arc::new(MockEmbedding::new(32)))
            .unwrap()
            .with_model(model.clone());

        let first = engine
            .add("default", &[Message::user("I use polars on a GPU")], None, Some("keep tools"), true)
            .await
            .unwrap();
        assert_eq!(first.written_ids().len(), 2);

        let second = engine
            .add("default", &[Message::user("still polars")], None, None, true)
            .await
            .unwrap();
        assert!(second.results.iter().all(|e| e.event == EventKind::None));
        assert_eq!(second.results[0].id, first.results[0].id);
        assert_eq!(engine.get_all("default", None, 100).await.unwrap().len(), 2);

        let prompts = model.prompts.lock().unwrap().clone();
        assert_eq!(prompts[0].0.as_deref(), Some("keep tools"));
        assert_eq!(prompts[0].1, "user: I use polars on a GPU");
        assert_eq!(prompts[1].0.as_deref(), Some(FACT_EXTRACTION_PROMPT));
    }

    #[tokio::test]
    async fn unparsable_extraction_is_model_error() {
        let tmp = TempDir::new().unwrap();
        let engine = LocalMemoryEngine::open(tmp.path(), Arc::new(MockEmbedding::new(8)))
            .unwrap()
            .with_model(Arc::new(ScriptedModel::replying("no facts here")));
        let err = engine
            .add("default", &[Message::user("hi")], None, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Model(_)));
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_within_agent() {
        let (_tmp, engine) = setup();
        engine
            .add(
                "a1",
                &[Message::user("xxxx"), Message::user("aaaa"), Message::user("aaab")],
                None,
                None,
                false,
            )
            .await
            .unwrap();
        engine
            .add("a2", &[Message::user("aaaa")], None, None, false)
            .await
            .unwrap();

        let hits = engine.search("a1", "aaaa", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory, "aaaa");
        assert_eq!(hits[1].memory, "aaab");
        assert!(hits[0].score.unwrap() >= hits[1].score.unwrap());
        assert!(hits.iter().all(|h| h.agent_id.as_deref() == Some("a1")));
    }

    #[tokio::test]
    async fn get_all_filters_and_caps() {
        let (_tmp, engine) = setup();
        let data: Metadata = serde_json::from_value(json!({ "topic": "data" })).unwrap();
        let model: Metadata = serde_json::from_value(json!({ "topic": "model" })).unwrap();
        engine
            .add("default", &[Message::user("one"), Message::user("two")], Some(&data), None, false)
            .await
            .unwrap();
        engine
            .add("default", &[Message::user("three")], Some(&model), None, false)
            .await
            .unwrap();

        assert_eq!(engine.get_all("default", Some(&data), 100).await.unwrap().len(), 2);
        assert_eq!(engine.get_all("default", Some(&model), 100).await.unwrap().len(), 1);
        assert_eq!(engine.get_all("default", None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_clears_only_the_agent() {
        let (_tmp, engine) = setup();
        engine
            .add("a1", &[Message::user("mine")], None, None, false)
            .await
            .unwrap();
        engine
            .add("a2", &[Message::user("theirs")], None, None, false)
            .await
            .unwrap();

        engine.reset("a1").await.unwrap();
        assert!(engine.get_all("a1", None, 100).await.unwrap().is_empty());
        assert_eq!(engine.get_all("a2", None, 100).await.unwrap().len(), 1);
    }

    #[test]
    fn parse_facts_handles_prose_and_blanks() {
        let facts = parse_facts("Sure! {\"facts\": [\" a \", \"\", \"b\"]} hope that helps").unwrap();
        assert_eq!(facts, vec!["a", "b"]);
        assert!(parse_facts("{\"facts\": []}").unwrap().is_empty());
    }
}
