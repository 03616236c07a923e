//! Core record types shared by both memory tiers.

use serde::{Deserialize, Deserializer, Serialize};

/// Free-form metadata attached to a memory.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A row of a fast-tier table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique id within the table
    pub id: String,
    /// The stored text
    pub text: String,
    /// Embedding of `text`
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Cosine distance to the query (similarity results only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl MemoryRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            vector,
            metadata: None,
            distance: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Look up a top-level metadata field.
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// A memory held by the slow tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowMemoryItem {
    pub id: String,
    /// The stored text (raw message or extracted fact)
    pub memory: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Metadata,
    /// ISO-8601 creation time
    #[serde(default)]
    pub created_at: Option<String>,
    /// ISO-8601 last update time
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Similarity score (search results only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Metadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Metadata>::deserialize(deserializer)?.unwrap_or_default())
}

impl SlowMemoryItem {
    /// Timestamp used for recency ordering: `updated_at`, else `created_at`.
    pub fn recency_timestamp(&self) -> Option<&str> {
        self.updated_at
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.created_at.as_deref().filter(|s| !s.is_empty()))
    }
}

/// A conversational turn handed to the slow tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// What the slow tier did with an added memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Add,
    Update,
    Delete,
    None,
}

/// One memory touched by an add call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: String,
    pub memory: String,
    pub event: EventKind,
}

/// Result of a slow-tier add.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddOutcome {
    pub results: Vec<MemoryEvent>,
}

impl AddOutcome {
    /// Ids of memories that were added or updated.
    pub fn written_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|e| matches!(e.event, EventKind::Add | EventKind::Update))
            .map(|e| e.id.as_str())
            .collect()
    }
}

/// Metadata argument of a fast-tier batch add.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BatchMetadata {
    /// No metadata on any row
    #[default]
    None,
    /// The same metadata on every row
    Broadcast(Metadata),
    /// One entry per text; length must match
    PerItem(Vec<Option<Metadata>>),
}

impl From<Metadata> for BatchMetadata {
    fn from(metadata: Metadata) -> Self {
        Self::Broadcast(metadata)
    }
}

impl From<Option<Metadata>> for BatchMetadata {
    fn from(metadata: Option<Metadata>) -> Self {
        metadata.map_or(Self::None, Self::Broadcast)
    }
}

impl From<Vec<Metadata>> for BatchMetadata {
    fn from(metadata: Vec<Metadata>) -> Self {
        Self::PerItem(metadata.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<Metadata>>> for BatchMetadata {
    fn from(metadata: Vec<Option<Metadata>>) -> Self {
        Self::PerItem(metadata)
    }
}

/// A hit returned by the hybrid coordinator's query.
#[derive(Debug, Clone, PartialEq)]
pub enum RecalledMemory {
    Fast(MemoryRecord),
    Slow(SlowMemoryItem),
}

impl RecalledMemory {
    pub fn id(&self) -> &str {
        match self {
            Self::Fast(r) => &r.id,
            Self::Slow(m) => &m.id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Fast(r) => &r.text,
            Self::Slow(m) => &m.memory,
        }
    }

    pub fn is_fast(&self) -> bool {
        matches!(self, Self::Fast(_))
    }
}
