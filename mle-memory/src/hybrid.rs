//! Hybrid memory: slow-tier writes, fast-tier reads, and consolidation.
//!
//! ```text
//! add ─────────────────────────────→ SlowMemory
//! query ──→ FastMemory ──┬─────────→ results (fast first)
//!           SlowMemory ──┘ (when broadened)
//! consolidate: SlowMemory.get_all → rank → FastMemory.add_text
//! ```
//!
//! Consolidation copies; slow-tier originals are never touched.

use crate::embeddings::create_embedding_provider;
use crate::error::{MemoryError, Result};
use crate::fast::FastMemory;
use crate::slow::SlowMemory;
use crate::types::{AddOutcome, Message, Metadata, RecalledMemory, SlowMemoryItem};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mle_common::get_config;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::path::Path;

/// Default number of slow-tier items a consolidation run pulls.
pub const DEFAULT_CONSOLIDATION_LIMIT: usize = 1000;

/// Coordinator over a fast and a slow memory tier.
pub struct HybridMemory {
    slow: SlowMemory,
    fast: FastMemory,
    carry_metadata: bool,
}

impl HybridMemory {
    pub fn new(slow: SlowMemory, fast: FastMemory) -> Self {
        Self {
            slow,
            fast,
            carry_metadata: false,
        }
    }

    /// Copy slow-tier metadata onto consolidated fast-tier rows.
    pub fn with_carry_metadata(mut self, carry: bool) -> Self {
        self.carry_metadata = carry;
        self
    }

    /// Wire both tiers from `<project>/.mle/project.yml`.
    pub fn from_config(project_path: &Path) -> Result<Self> {
        let config = get_config(project_path)?;
        let embedding = create_embedding_provider(&config)?;
        let fast = FastMemory::open(
            &config.db_dir(project_path),
            embedding.clone(),
            Some(&config.memory.table_name),
        )?;
        let slow = SlowMemory::from_config(project_path, &config, embedding)?;

        tracing::info!(
            project = %project_path.display(),
            agent_id = slow.agent_id(),
            slow_backend = slow.backend().name(),
            "Hybrid memory ready"
        );
        Ok(Self::new(slow, fast))
    }

    pub fn slow(&self) -> &SlowMemory {
        &self.slow
    }

    pub fn fast(&self) -> &FastMemory {
        &self.fast
    }

    /// Write to the slow tier. A prompt turns on fact extraction.
    pub async fn add(
        &self,
        messages: &[Message],
        metadata: Option<&Metadata>,
        prompt: Option<&str>,
    ) -> Result<AddOutcome> {
        self.slow
            .add(messages, metadata, prompt, prompt.is_some())
            .await
    }

    /// Recall from the fast tier; with `fast_query == false` the slow tier's
    /// hits are appended after the fast ones.
    pub async fn query(
        &self,
        query: &str,
        n_results: usize,
        fast_query: bool,
    ) -> Result<Vec<RecalledMemory>> {
        let mut results: Vec<RecalledMemory> = self
            .fast
            .query(&[query], None, n_results)
            .await?
            .into_iter()
            .flatten()
            .map(RecalledMemory::Fast)
            .collect();

        if !fast_query {
            let slow = self.slow.query(query, n_results).await?;
            results.extend(slow.into_iter().map(RecalledMemory::Slow));
        }
        Ok(results)
    }

    /// Clear the slow tier, and the fast tier too unless `only_reset_slow_memory`.
    pub async fn reset(&self, only_reset_slow_memory: bool) -> Result<()> {
        self.slow.reset().await?;
        if !only_reset_slow_memory {
            self.fast.reset().await?;
        }
        Ok(())
    }

    /// Copy the `n` most recently updated slow-tier items into the fast tier.
    ///
    /// Sorts up to `limit` items in memory.
    pub async fn last_n_consolidate(&self, n: usize, limit: usize) -> Result<Vec<SlowMemoryItem>> {
        let items = self.slow.get_all(None, limit).await?;
        let pulled = items.len();

        let mut keyed = items
            .into_iter()
            .map(|item| Ok((recency(&item)?, item)))
            .collect::<Result<Vec<_>>>()?;
        keyed.sort_by(|a, b| b.0.cmp(&a.0));

        let selected: Vec<SlowMemoryItem> = keyed.into_iter().take(n).map(|(_, i)| i).collect();
        self.push(&selected).await?;

        tracing::info!(pulled, consolidated = selected.len(), n, "last_n consolidation done");
        Ok(selected)
    }

    /// Copy the first `k` slow-tier items ordered by `metadata_key` into the
    /// fast tier; ascending unless `reverse`.
    pub async fn top_k_consolidate(
        &self,
        k: usize,
        metadata_key: &str,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<SlowMemoryItem>> {
        let items = self.slow.get_all(None, limit).await?;
        let pulled = items.len();

        let mut selected = items;
        if selected.len() > 1 {
            let keys = sort_keys(&selected, metadata_key)?;
            let mut keyed: Vec<_> = keys.into_iter().zip(selected).collect();
            keyed.sort_by(|a, b| {
                if reverse {
                    b.0.cmp_same_kind(&a.0)
                } else {
                    a.0.cmp_same_kind(&b.0)
                }
            });
            selected = keyed.into_iter().map(|(_, i)| i).collect();
        }
        selected.truncate(k);
        self.push(&selected).await?;

        tracing::info!(
            pulled,
            consolidated = selected.len(),
            k,
            metadata_key,
            reverse,
            "top_k consolidation done"
        );
        Ok(selected)
    }

    /// Consolidation steered by a free-form prompt. Not available.
    pub async fn prompt_based_consolidate(&self, _prompt: &str) -> Result<Vec<SlowMemoryItem>> {
        Err(MemoryError::NotImplemented("prompt_based_consolidate"))
    }

    /// Add items to the fast tier one at a time. Earlier pushes stay on failure.
    async fn push(&self, items: &[SlowMemoryItem]) -> Result<()> {
        for item in items {
            let metadata = (self.carry_metadata && !item.metadata.is_empty())
                .then(|| item.metadata.clone());
            self.fast.add_text(item.memory.clone(), metadata, None).await?;
        }
        Ok(())
    }
}

fn recency(item: &SlowMemoryItem) -> Result<DateTime<Utc>> {
    let raw = item.recency_timestamp().ok_or_else(|| {
        MemoryError::InvalidInput(format!("memory {} has no updated_at or created_at", item.id))
    })?;
    parse_timestamp(raw).ok_or_else(|| {
        MemoryError::InvalidInput(format!("memory {} has unparsable timestamp '{raw}'", item.id))
    })
}

/// RFC 3339, naive date-time (either separator), or bare date. Naive values are UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Orderable metadata value.
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Number(Number),
    Text(String),
    Bool(bool),
}

impl SortKey {
    fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "string",
            Self::Bool(_) => "boolean",
        }
    }

    /// Keys are validated to share one kind before sorting.
    fn cmp_same_kind(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => cmp_numbers(a, b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Integers compare exactly; anything involving a float goes through f64.
fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    x.total_cmp(&y)
}

fn sort_keys(items: &[SlowMemoryItem], key: &str) -> Result<Vec<SortKey>> {
    let incomparable = |reason: String| MemoryError::IncomparableMetadata {
        key: key.to_string(),
        reason,
    };

    let mut keys: Vec<SortKey> = Vec::with_capacity(items.len());
    for item in items {
        let sort_key = match item.metadata.get(key) {
            None | Some(Value::Null) => {
                return Err(incomparable(format!("memory {} has no value", item.id)))
            }
            Some(Value::Number(n)) if n.as_f64().is_some() => SortKey::Number(n.clone()),
            Some(Value::Number(_)) => {
                return Err(incomparable(format!("memory {} has non-finite number", item.id)))
            }
            Some(Value::String(s)) => SortKey::Text(s.clone()),
            Some(Value::Bool(b)) => SortKey::Bool(*b),
            Some(Value::Array(_) | Value::Object(_)) => {
                return Err(incomparable(format!("memory {} has a non-scalar value", item.id)))
            }
        };

        if let Some(first) = keys.first() {
            if first.kind() != sort_key.kind() {
                return Err(incomparable(format!(
                    "mixed {} and {} values",
                    first.kind(),
                    sort_key.kind()
                )));
            }
        }
        keys.push(sort_key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::tests::MockEmbedding;
    use crate::embeddings::EmbeddingProvider;
    use crate::slow::tests::{item, InMemoryBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(items: Vec<SlowMemoryItem>) -> (TempDir, Arc<InMemoryBackend>, HybridMemory) {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::seeded(items));
        let slow = SlowMemory::new("default", backend.clone());
        let fast = FastMemory::open(tmp.path(), Arc::new(MockEmbedding::new(32)), None).unwrap();
        (tmp, backend, HybridMemory::new(slow, fast))
    }

    fn dated(id: &str, memory: &str, updated_at: &str) -> SlowMemoryItem {
        let mut item = item(id, memory, json!({}));
        item.updated_at = Some(updated_at.to_string());
        item
    }

    async fn fast_texts(memory: &HybridMemory) -> Vec<String> {
        let mut texts = Vec::new();
        for id in memory.fast().list_all_keys(None).await.unwrap() {
            texts.push(memory.fast().get(&id, None).await.unwrap().unwrap().text);
        }
        texts
    }

    #[tokio::test]
    async fn add_writes_only_to_slow_tier() {
        let (_tmp, backend, memory) = setup(vec![]);
        memory.add(&[Message::user("hello")], None, None).await.unwrap();
        memory
            .add(&[Message::user("extract me")], None, Some("facts please"))
            .await
            .unwrap();

        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["add:default:false", "add:default:true"]);
        assert_eq!(memory.fast().count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn query_fast_only_skips_slow_tier() {
        let (_tmp, backend, memory) = setup(vec![item("s1", "slow hello", json!({}))]);
        memory.fast().add_text("fast hello", None, None).await.unwrap();

        let hits = memory.query("hello", 5, true).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_fast());
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadened_query_appends_slow_hits() {
        let (_tmp, _backend, memory) = setup(vec![item("s1", "slow hello", json!({}))]);
        memory.fast().add_text("fast hello", None, None).await.unwrap();

        let hits = memory.query("hello", 5, false).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].is_fast());
        assert_eq!(hits[1].id(), "s1");
        assert!(!hits[1].is_fast());
    }

    #[tokio::test]
    async fn query_before_any_fast_write_is_empty() {
        let (_tmp, _backend, memory) = setup(vec![]);
        assert!(memory.query("anything", 3, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_defaults_to_slow_tier_only() {
        let (_tmp, backend, memory) = setup(vec![item("s1", "slow", json!({}))]);
        memory.fast().add_text("fast", None, None).await.unwrap();

        memory.reset(true).await.unwrap();
        assert!(backend.items.lock().unwrap().is_empty());
        assert_eq!(memory.fast().count(None).await.unwrap(), 1);

        memory.reset(false).await.unwrap();
        assert_eq!(memory.fast().count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_n_takes_most_recent() {
        let (_tmp, backend, memory) = setup(vec![
            dated("a", "january", "2024-01-01"),
            dated("b", "march", "2024-03-01"),
            dated("c", "february", "2024-02-01"),
        ]);

        let selected = memory.last_n_consolidate(2, DEFAULT_CONSOLIDATION_LIMIT).await.unwrap();
        let ids: Vec<_> = selected.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let mut texts = fast_texts(&memory).await;
        texts.sort();
        assert_eq!(texts, vec!["february", "march"]);
        assert_eq!(backend.items.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn last_n_falls_back_to_created_at_and_mixed_formats() {
        let mut created = item("old", "created only", json!({}));
        created.created_at = Some("2023-12-31T23:00:00Z".into());
        let (_tmp, _backend, memory) = setup(vec![
            created,
            dated("naive", "naive", "2024-01-01 08:00:00"),
            dated("offset", "offset", "2024-01-01T09:00:00+02:00"),
        ]);

        let selected = memory.last_n_consolidate(3, 10).await.unwrap();
        let ids: Vec<_> = selected.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["naive", "offset", "old"]);
    }

    #[tokio::test]
    async fn last_n_without_timestamps_is_invalid_input() {
        let (_tmp, _backend, memory) = setup(vec![
            dated("a", "dated", "2024-01-01"),
            item("b", "undated", json!({})),
        ]);
        let err = memory.last_n_consolidate(1, 10).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
        assert_eq!(memory.fast().count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_n_respects_pull_limit() {
        let (_tmp, backend, memory) = setup(vec![
            dated("a", "one", "2024-01-01"),
            dated("b", "two", "2024-02-01"),
        ]);
        let selected = memory.last_n_consolidate(5, 1).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert!(backend.calls.lock().unwrap().contains(&"get_all:default:1".to_string()));
    }

    #[tokio::test]
    async fn top_k_reverse_takes_highest() {
        let (_tmp, _backend, memory) = setup(vec![
            item("low", "low", json!({"priority": 1})),
            item("high", "high", json!({"priority": 5})),
            item("mid", "mid", json!({"priority": 3})),
        ]);

        let selected = memory.top_k_consolidate(1, "priority", true, 100).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "high");
        assert_eq!(fast_texts(&memory).await, vec!["high"]);
    }

    #[tokio::test]
    async fn top_k_ascending_orders_strings_lexically() {
        let (_tmp, _backend, memory) = setup(vec![
            item("c", "c", json!({"stage": "train"})),
            item("a", "a", json!({"stage": "eda"})),
            item("b", "b", json!({"stage": "feature"})),
        ]);

        let selected = memory.top_k_consolidate(2, "stage", false, 100).await.unwrap();
        let ids: Vec<_> = selected.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn top_k_orders_large_integers_exactly() {
        let (_tmp, _backend, memory) = setup(vec![
            item("low", "low", json!({"rank": 9007199254740992u64})),
            item("high", "high", json!({"rank": 9007199254740993u64})),
            item("max", "max", json!({"rank": u64::MAX})),
            item("neg", "neg", json!({"rank": -1})),
            item("frac", "frac", json!({"rank": 0.5})),
        ]);

        let selected = memory.top_k_consolidate(5, "rank", true, 100).await.unwrap();
        let ids: Vec<_> = selected.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["max", "high", "low", "frac", "neg"]);
    }

    #[tokio::test]
    async fn top_k_rejects_missing_and_mixed_values() {
        let (_tmp, _backend, memory) = setup(vec![
            item("a", "a", json!({"priority": 1})),
            item("b", "b", json!({})),
        ]);
        let err = memory.top_k_consolidate(1, "priority", false, 100).await.unwrap_err();
        assert!(matches!(err, MemoryError::IncomparableMetadata { .. }));

        let (_tmp, _backend, memory) = setup(vec![
            item("a", "a", json!({"priority": 1})),
            item("b", "b", json!({"priority": "high"})),
        ]);
        let err = memory.top_k_consolidate(1, "priority", false, 100).await.unwrap_err();
        assert!(matches!(err, MemoryError::IncomparableMetadata { key, .. } if key == "priority"));
        assert_eq!(memory.fast().count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consolidation_pushes_text_only_by_default() {
        let (_tmp, _backend, memory) = setup(vec![item("a", "tagged", json!({"priority": 2}))]);
        memory.top_k_consolidate(1, "priority", false, 100).await.unwrap();

        let id = memory.fast().list_all_keys(None).await.unwrap().remove(0);
        assert_ne!(id, "a");
        let record = memory.fast().get(&id, None).await.unwrap().unwrap();
        assert!(record.metadata.is_none());
    }

    #[tokio::test]
    async fn carry_metadata_copies_slow_metadata() {
        let (_tmp, _backend, memory) = setup(vec![{
            let mut i = item("a", "tagged", json!({"priority": 2}));
            i.updated_at = Some("2024-01-01".into());
            i
        }]);
        let memory = memory.with_carry_metadata(true);
        memory.last_n_consolidate(1, 100).await.unwrap();

        let hits = memory.fast().get_by_metadata("priority", 2, None, 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "tagged");
    }

    /// Embeds normally until the `fail_on`-th call, then errors.
    struct FailingEmbedding {
        inner: MockEmbedding,
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedding {
        fn name(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if call == self.fail_on {
                return Err(MemoryError::Embedding("upstream unavailable".into()));
            }
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn failed_push_keeps_consolidated_prefix() {
        let tmp = TempDir::new().unwrap();
        let seeded = vec![
            dated("a", "first", "2024-01-03T00:00:00Z"),
            dated("b", "second", "2024-01-02T00:00:00Z"),
            dated("c", "third", "2024-01-01T00:00:00Z"),
        ];
        let backend = Arc::new(InMemoryBackend::seeded(seeded.clone()));
        let slow = SlowMemory::new("default", backend.clone());
        let embedding = Arc::new(FailingEmbedding {
            inner: MockEmbedding::new(32),
            calls: AtomicUsize::new(0),
            fail_on: 3,
        });
        let fast = FastMemory::open(tmp.path(), embedding, None).unwrap();
        let memory = HybridMemory::new(slow, fast);

        let err = memory.last_n_consolidate(3, 100).await.unwrap_err();
        assert!(matches!(err, MemoryError::Embedding(_)));
        assert_eq!(memory.fast().count(None).await.unwrap(), 2);

        let mut texts = fast_texts(&memory).await;
        texts.sort();
        assert_eq!(texts, vec!["first", "second"]);

        assert_eq!(*backend.items.lock().unwrap(), seeded);
    }

    #[tokio::test]
    async fn prompt_based_consolidate_is_not_implemented() {
        let (_tmp, _backend, memory) = setup(vec![]);
        let err = memory.prompt_based_consolidate("keep the important bits").await.unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn parse_timestamp_formats() {
        let expected = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z").unwrap();
        assert_eq!(parse_timestamp("2024-03-01"), Some(expected.with_timezone(&Utc)));
        assert_eq!(parse_timestamp("2024-03-01T00:00:00"), Some(expected.with_timezone(&Utc)));
        assert_eq!(parse_timestamp("2024-03-01 00:00:00.000"), Some(expected.with_timezone(&Utc)));
        assert!(parse_timestamp("yesterday").is_none());
    }
}
