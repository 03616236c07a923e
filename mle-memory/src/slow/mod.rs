//! Slow memory tier: durable, agent-scoped long-term memory.
//!
//! [`SlowMemory`] binds an agent id to a [`SlowMemoryBackend`]. Two backends
//! are provided:
//! - [`Mem0Client`] for the hosted Mem0 REST API
//! - [`LocalMemoryEngine`] for an embedded SQLite store with optional fact
//!   extraction

pub mod local;
pub mod remote;

pub use local::LocalMemoryEngine;
pub use remote::Mem0Client;

use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::model::load_model;
use crate::types::{AddOutcome, Message, Metadata, SlowMemoryItem};
use async_trait::async_trait;
use mle_common::{ProjectConfig, TracingObserver};
use std::path::Path;
use std::sync::Arc;

/// Default cap for [`SlowMemory::get_all`].
pub const DEFAULT_GET_ALL_LIMIT: usize = 100;

/// Storage service behind the slow tier. Every call names its agent.
#[async_trait]
pub trait SlowMemoryBackend: Send + Sync {
    /// Backend name (e.g., "mem0", "local")
    fn name(&self) -> &str;

    /// Store messages. With `infer`, the backend extracts facts itself and
    /// decides what to add, update or delete.
    async fn add(
        &self,
        agent_id: &str,
        messages: &[Message],
        metadata: Option<&Metadata>,
        prompt: Option<&str>,
        infer: bool,
    ) -> Result<AddOutcome>;

    /// Similarity search, best match first.
    async fn search(&self, agent_id: &str, query: &str, limit: usize)
        -> Result<Vec<SlowMemoryItem>>;

    /// Memories matching every `filters` entry exactly, capped at `limit`.
    async fn get_all(
        &self,
        agent_id: &str,
        filters: Option<&Metadata>,
        limit: usize,
    ) -> Result<Vec<SlowMemoryItem>>;

    /// Forget everything stored for the agent.
    async fn reset(&self, agent_id: &str) -> Result<()>;
}

/// Slow-tier handle scoped to one agent.
#[derive(Clone)]
pub struct SlowMemory {
    agent_id: String,
    backend: Arc<dyn SlowMemoryBackend>,
}

impl SlowMemory {
    pub fn new(agent_id: impl Into<String>, backend: Arc<dyn SlowMemoryBackend>) -> Self {
        Self {
            agent_id: agent_id.into(),
            backend,
        }
    }

    /// Build the slow tier for a project.
    ///
    /// A configured Mem0 token selects the hosted service; otherwise memories
    /// live in `<db_dir>/slow_memory.db`. The local engine gets a completion
    /// model when the platform is usable, so `infer` can extract facts.
    pub fn from_config(
        project_path: &Path,
        config: &ProjectConfig,
        embedding: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let settings = &config.memory;
        let backend: Arc<dyn SlowMemoryBackend> = match settings.mem0_api_key.as_deref() {
            Some(token) => {
                tracing::debug!(base_url = %settings.mem0_base_url, "Using hosted Mem0 slow memory");
                Arc::new(Mem0Client::new(token).with_base_url(&settings.mem0_base_url))
            }
            None => {
                let mut engine = LocalMemoryEngine::open(&config.db_dir(project_path), embedding)?;
                match load_model(config, Some(Arc::new(TracingObserver))) {
                    Ok(model) => engine = engine.with_model(model),
                    Err(e) => {
                        tracing::warn!(error = %e, "No completion model; fact extraction disabled");
                    }
                }
                Arc::new(engine)
            }
        };

        Ok(Self::new(settings.agent_id.clone(), backend))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn backend(&self) -> &Arc<dyn SlowMemoryBackend> {
        &self.backend
    }

    pub async fn add(
        &self,
        messages: &[Message],
        metadata: Option<&Metadata>,
        prompt: Option<&str>,
        infer: bool,
    ) -> Result<AddOutcome> {
        tracing::debug!(
            agent_id = %self.agent_id,
            backend = self.backend.name(),
            messages = messages.len(),
            infer,
            "Adding slow memories"
        );
        self.backend
            .add(&self.agent_id, messages, metadata, prompt, infer)
            .await
    }

    pub async fn query(&self, query_text: &str, n_results: usize) -> Result<Vec<SlowMemoryItem>> {
        self.backend
            .search(&self.agent_id, query_text, n_results)
            .await
    }

    pub async fn get_all(
        &self,
        filters: Option<&Metadata>,
        n_results: usize,
    ) -> Result<Vec<SlowMemoryItem>> {
        self.backend
            .get_all(&self.agent_id, filters, n_results)
            .await
    }

    /// Clear all memory for this agent.
    pub async fn reset(&self) -> Result<()> {
        tracing::debug!(agent_id = %self.agent_id, backend = self.backend.name(), "Resetting slow memory");
        self.backend.reset(&self.agent_id).await
    }
}
