//! Text-completion capability consumed by the embedded slow-tier engine.
//!
//! Every supported platform exposes an OpenAI-compatible chat completions
//! endpoint, so a single adapter covers them; the platform only decides the
//! default endpoint and model. Observability is opt-in through
//! [`ObservableModel`], which wraps any model with a [`ModelObserver`].

use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use mle_common::{ModelObserver, Observation, Outcome, ProjectConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// A model that turns a prompt into text.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Model identifier.
    fn name(&self) -> &str;

    /// Complete `prompt`, optionally steered by a system prompt.
    async fn query(&self, system: Option<&str>, prompt: &str) -> Result<String>;
}

// ============================================================================
// OpenAI-compatible adapter
// ============================================================================

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct CompatibleModel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl CompatibleModel {
    /// Create a client; `base_url` includes the `/v1` segment.
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            model: model.to_string(),
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl CompletionModel for CompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn query(&self, system: Option<&str>, prompt: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        });
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response: ChatResponse = req.send().await?.error_for_status()?.json().await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| MemoryError::Model(format!("{} returned no content", self.model)))
    }
}

// ============================================================================
// Observability decorator
// ============================================================================

/// Wraps a model so every call is reported to an observer.
pub struct ObservableModel<M> {
    inner: M,
    observer: Arc<dyn ModelObserver>,
}

impl<M: CompletionModel> ObservableModel<M> {
    pub fn new(inner: M, observer: Arc<dyn ModelObserver>) -> Self {
        Self { inner, observer }
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

#[async_trait]
impl<M: CompletionModel> CompletionModel for ObservableModel<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn query(&self, system: Option<&str>, prompt: &str) -> Result<String> {
        let observation = Observation {
            operation: "query",
            target: self.inner.name().to_string(),
            input_chars: system.map_or(0, str::len) + prompt.len(),
        };
        self.observer.on_start(&observation);

        let start = Instant::now();
        let result = self.inner.query(system, prompt).await;
        let outcome = match &result {
            Ok(text) => Outcome::Success {
                output_chars: text.len(),
            },
            Err(e) => Outcome::Failure {
                error: e.to_string(),
            },
        };
        self.observer
            .on_finish(&observation, start.elapsed(), &outcome);

        result
    }
}

/// Build the completion model for a project.
///
/// With an observer the model is wrapped in [`ObservableModel`]; without one
/// the bare adapter is returned.
pub fn load_model(
    config: &ProjectConfig,
    observer: Option<Arc<dyn ModelObserver>>,
) -> Result<Arc<dyn CompletionModel>> {
    if config.platform.requires_api_key() && config.api_key.is_none() {
        return Err(MemoryError::Config(format!(
            "{} requires an api_key",
            config.platform
        )));
    }

    let model = CompatibleModel::new(config.base_url(), config.api_key.as_deref(), config.model());
    tracing::debug!(
        platform = %config.platform,
        model = config.model(),
        observed = observer.is_some(),
        "Loaded completion model"
    );

    Ok(match observer {
        Some(observer) => Arc::new(ObservableModel::new(model, observer)),
        None => Arc::new(model),
    })
}
