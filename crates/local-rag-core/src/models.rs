//! Core data models shared by ingestion, retrieval, and chat.
//!
//! These types describe the chunks written to the vector index, the
//! passages read back from it, and the conversation turns handed to the
//! generation layer.

use serde::{Deserialize, Serialize};

/// Version tag stamped on every chunk written by the current chunking pass.
pub const CHUNK_VERSION: &str = "v1.0";

/// A bounded text segment of a document, before it has been embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `{document_id}_{chunk_index}`.
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    /// Character offset of the first char of `text` in the normalized document.
    pub char_start: usize,
    /// Character offset one past the last char of `text`.
    pub char_end: usize,
}

/// A chunk together with its embedding and the schema-versioned metadata
/// written to the [`VectorIndex`](crate::store::VectorIndex).
///
/// Records are immutable once written: nothing in the index updates a
/// record in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    /// Display name of the originating file.
    pub source: String,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
    /// Dimension observed on `embedding` at write time.
    pub embedding_dim: usize,
    pub chunk_version: String,
}

impl ChunkRecord {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

/// A record returned from a nearest-neighbour query, with its distance to
/// the query vector (lower is closer).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source: String,
    pub chunk_index: i64,
    pub text: String,
    pub distance: f32,
}

/// A passage produced for one query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub content: String,
    pub source_document_id: String,
    /// Cosine distance to the query; lower means more similar.
    pub similarity_score: f32,
}

/// One entry of the per-document listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub source: String,
    pub chunks: usize,
}

/// Speaker of a [`ConversationTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single message of caller-owned conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}
