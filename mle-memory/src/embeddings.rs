//! Embedding providers for the fast tier and the embedded slow-tier engine.
//!
//! The provider is chosen once from the project platform:
//! - `OpenAI` projects embed through the OpenAI embeddings API
//! - every other platform uses a local sentence-embedding model (fastembed),
//!   available with the `local-embeddings` feature (on by default)

use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use mle_common::{Platform, ProjectConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default OpenAI embedding model.
pub const DEFAULT_OPENAI_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

/// Default local sentence-embedding model.
pub const DEFAULT_LOCAL_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (e.g., "openai", "fastembed")
    fn name(&self) -> &str;

    /// Length of produced vectors.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts; one vector per input, in input order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Embedding("provider returned no vector".into()))
    }
}

/// Select the embedding provider for a project.
pub fn create_embedding_provider(config: &ProjectConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let model = config.memory.embedding_model.as_deref();
    match config.platform {
        Platform::OpenAi => {
            let api_key = config.api_key.as_deref().ok_or_else(|| {
                MemoryError::Config("OpenAI embeddings require an api_key".into())
            })?;
            let mut provider = OpenAiEmbedding::new(api_key);
            if let Some(base_url) = config.base_url.as_deref() {
                provider = provider.with_base_url(base_url);
            }
            if let Some(model) = model {
                provider = provider.with_model(model, dimensions_for_openai_model(model));
            }
            tracing::debug!(model = provider.model(), "Using OpenAI embeddings");
            Ok(Arc::new(provider))
        }
        other => {
            tracing::debug!(platform = %other, "Using local sentence embeddings");
            let provider = LocalEmbedding::new(model.unwrap_or(DEFAULT_LOCAL_EMBEDDING_MODEL))?;
            Ok(Arc::new(provider))
        }
    }
}

fn dimensions_for_openai_model(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

// ============================================================================
// OpenAI
// ============================================================================

/// Embeddings through the OpenAI `/embeddings` endpoint.
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedding {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_OPENAI_EMBEDDING_MODEL.to_string(),
            dimensions: 1536,
        }
    }

    /// Point at a different OpenAI-compatible endpoint (includes `/v1`).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str, dimensions: usize) -> Self {
        self.model = model.to_string();
        self.dimensions = dimensions;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?
            .error_for_status()?;

        let mut body: EmbeddingResponse = response.json().await?;
        body.data.sort_by_key(|d| d.index);

        if body.data.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ============================================================================
// Local (fastembed)
// ============================================================================

/// Local sentence embeddings using ONNX models through fastembed.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedding {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    dimensions: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedding {
    /// Load (downloading on first use) the named model.
    pub fn new(model_name: &str) -> Result<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let (model_enum, dimensions) = match model_name {
            "sentence-transformers/all-MiniLM-L6-v2" | "all-MiniLM-L6-v2" => {
                (EmbeddingModel::AllMiniLML6V2, 384)
            }
            "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2" => {
                (EmbeddingModel::ParaphraseMLMiniLML12V2, 384)
            }
            "BAAI/bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "BAAI/bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            other => {
                return Err(MemoryError::Config(format!(
                    "unsupported local embedding model '{other}'"
                )))
            }
        };

        let model = TextEmbedding::try_new(
            InitOptions::new(model_enum).with_show_download_progress(false),
        )
        .map_err(|e| MemoryError::Embedding(format!("failed to load {model_name}: {e}")))?;

        tracing::info!(model = model_name, dimensions, "Initialized local embedding model");

        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    fn name(&self) -> &str {
        "fastembed"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let owned: Vec<String> = texts.iter().map(|t| (*t).to_string()).collect();

        tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model = model
                .lock()
                .map_err(|e| MemoryError::Embedding(format!("model lock poisoned: {e}")))?;
            model
                .embed(owned, None)
                .map_err(|e| MemoryError::Embedding(e.to_string()))
        })
        .await?
    }
}

/// Placeholder when the `local-embeddings` feature is disabled.
#[cfg(not(feature = "local-embeddings"))]
pub struct LocalEmbedding {
    _private: (),
}

#[cfg(not(feature = "local-embeddings"))]
impl LocalEmbedding {
    pub fn new(model_name: &str) -> Result<Self> {
        Err(MemoryError::Config(format!(
            "local embedding model '{model_name}' requires the 'local-embeddings' feature"
        )))
    }
}

#[cfg(not(feature = "local-embeddings"))]
#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    fn name(&self) -> &str {
        "fastembed"
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Err(MemoryError::Config(
            "local embeddings require the 'local-embeddings' feature".into(),
        ))
    }
}
