//! MLE Memory - two-tier conversational memory for the MLE assistant.
//!
//! This crate provides:
//! - A fast tier of embedding-indexed SQLite tables (`FastMemory`)
//! - A slow, agent-scoped tier backed by hosted Mem0 or an embedded engine
//!   (`SlowMemory`)
//! - A coordinator that writes slow, reads fast, and consolidates slow items
//!   into the fast tier (`HybridMemory`)
//!
//! ## Architecture
//!
//! ```text
//! add ──────────────────→ SlowMemory ──→ Mem0Client | LocalMemoryEngine
//!                              │
//!                   last_n / top_k consolidation
//!                              ↓
//! query ────────────────→ FastMemory ──→ SqliteTableStore
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod embeddings;
pub mod error;
pub mod fast;
pub mod hybrid;
pub mod model;
pub mod slow;
pub mod types;
pub mod vector;

// Re-export commonly used types
pub use embeddings::{create_embedding_provider, EmbeddingProvider, LocalEmbedding, OpenAiEmbedding};
pub use error::{MemoryError, Result};
pub use fast::{FastMemory, RowFilter, SqliteTableStore, Table, TableStore};
pub use hybrid::{HybridMemory, DEFAULT_CONSOLIDATION_LIMIT};
pub use model::{load_model, CompatibleModel, CompletionModel, ObservableModel};
pub use slow::{LocalMemoryEngine, Mem0Client, SlowMemory, SlowMemoryBackend, DEFAULT_GET_ALL_LIMIT};
pub use types::{
    AddOutcome, BatchMetadata, EventKind, MemoryEvent, MemoryRecord, Message, Metadata,
    RecalledMemory, SlowMemoryItem,
};
pub use vector::{bytes_to_vec, cosine_distance, cosine_similarity, vec_to_bytes};
