//! Project configuration for MLE.
//!
//! A project keeps its settings in `<project>/.mle/project.yml`. Only the
//! fields the memory subsystem consumes are modelled here; unknown keys are
//! ignored so the file can carry settings owned by other tools.

use crate::error::{Error, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Directory (relative to the project root) holding MLE state.
pub const DEFAULT_DB_NAME: &str = ".mle";

/// Default fast-tier table name.
pub const DEFAULT_TABLE_NAME: &str = "memory";

/// Default slow-tier agent scope.
pub const DEFAULT_AGENT_ID: &str = "default";

/// Default hosted Mem0 endpoint.
pub const DEFAULT_MEM0_BASE_URL: &str = "https://api.mem0.ai";

/// Project configuration file name inside [`DEFAULT_DB_NAME`].
pub const PROJECT_CONFIG_FILE: &str = "project.yml";

/// Model platforms a project can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "OpenAI")]
    OpenAi,
    #[serde(rename = "Claude")]
    Claude,
    #[serde(rename = "MistralAI")]
    MistralAi,
    #[serde(rename = "DeepSeek")]
    DeepSeek,
    #[serde(rename = "Gemini")]
    Gemini,
    #[serde(rename = "Ollama")]
    Ollama,
    #[serde(rename = "vLLM")]
    Vllm,
}

impl Platform {
    /// Every supported platform, in display order.
    pub const ALL: [Platform; 7] = [
        Self::OpenAi,
        Self::Claude,
        Self::MistralAi,
        Self::DeepSeek,
        Self::Gemini,
        Self::Ollama,
        Self::Vllm,
    ];

    /// Name as written in `project.yml`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Claude => "Claude",
            Self::MistralAi => "MistralAI",
            Self::DeepSeek => "DeepSeek",
            Self::Gemini => "Gemini",
            Self::Ollama => "Ollama",
            Self::Vllm => "vLLM",
        }
    }

    /// Base URL of the platform's OpenAI-compatible API (includes `/v1`).
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Claude => "https://api.anthropic.com/v1",
            Self::MistralAi => "https://api.mistral.ai/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Self::Ollama => "http://localhost:11434/v1",
            Self::Vllm => "http://localhost:8000/v1",
        }
    }

    /// Chat model used when the project does not name one.
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Claude => "claude-3-5-sonnet-20240620",
            Self::MistralAi => "mistral-large-latest",
            Self::DeepSeek => "deepseek-chat",
            Self::Gemini => "gemini-1.5-flash",
            Self::Ollama => "llama3",
            Self::Vllm => "mistralai/Mistral-7B-Instruct-v0.3",
        }
    }

    /// Self-hosted platforms accept requests without an API key.
    pub const fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama | Self::Vllm)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Config(format!("unknown platform '{s}'")))
    }
}

/// Memory subsystem settings (`memory:` section of `project.yml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySettings {
    /// State directory relative to the project root
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Default fast-tier table
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Slow-tier agent scope
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Token for the hosted Mem0 service; local engine is used when absent
    #[serde(default)]
    pub mem0_api_key: Option<String>,

    /// Hosted Mem0 endpoint
    #[serde(default = "default_mem0_base_url")]
    pub mem0_base_url: String,

    /// Embedding model override for the selected provider
    #[serde(default)]
    pub embedding_model: Option<String>,
}

fn default_db_name() -> String {
    DEFAULT_DB_NAME.to_string()
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_agent_id() -> String {
    DEFAULT_AGENT_ID.to_string()
}

fn default_mem0_base_url() -> String {
    DEFAULT_MEM0_BASE_URL.to_string()
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            db_name: default_db_name(),
            table_name: default_table_name(),
            agent_id: default_agent_id(),
            mem0_api_key: None,
            mem0_base_url: default_mem0_base_url(),
            embedding_model: None,
        }
    }
}

/// Settings read from `<project>/.mle/project.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Primary model platform
    pub platform: Platform,

    /// API key for the platform
    #[serde(default)]
    pub api_key: Option<String>,

    /// Chat model name
    #[serde(default)]
    pub model: Option<String>,

    /// Endpoint override (Ollama, vLLM, proxies)
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub memory: MemorySettings,
}

impl ProjectConfig {
    /// Create a configuration for a platform with all other fields defaulted.
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            api_key: None,
            model: None,
            base_url: None,
            memory: MemorySettings::default(),
        }
    }

    /// Parse a configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Effective endpoint for the platform.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.platform.default_base_url())
    }

    /// Effective chat model.
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.platform.default_model())
    }

    /// Directory holding memory databases for a project.
    pub fn db_dir(&self, project_path: &Path) -> PathBuf {
        project_path.join(&self.memory.db_name)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("MLE_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(key) = lookup("MEM0_API_KEY").filter(|k| !k.is_empty()) {
            self.memory.mem0_api_key = Some(key);
        }
    }
}

/// Path of the project configuration file.
pub fn config_path(project_path: &Path) -> PathBuf {
    project_path.join(DEFAULT_DB_NAME).join(PROJECT_CONFIG_FILE)
}

/// Load the configuration of the project rooted at `project_path`.
///
/// Environment overrides (`MLE_API_KEY`, `MEM0_API_KEY`) are applied on top of
/// the file contents.
pub fn get_config(project_path: &Path) -> Result<ProjectConfig> {
    let path = config_path(project_path);
    if !path.exists() {
        return Err(Error::Config(format!(
            "project config not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)
        .context(format!("Failed to read {}", path.display()))?;
    let mut config = ProjectConfig::from_yaml_str(&content)
        .context(format!("Failed to parse {}", path.display()))?;
    config.apply_env_overrides();

    tracing::debug!(
        path = %path.display(),
        platform = %config.platform,
        "Loaded project config"
    );

    Ok(config)
}
