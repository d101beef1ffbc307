//! Vector index abstraction for Local RAG.
//!
//! The [`VectorIndex`] trait defines the storage operations needed by the
//! ingestion pipeline and the retrieval service, enabling pluggable
//! backends (SQLite, in-memory).
//!
//! Implementations must be `Send + Sync`; one handle is shared by every
//! in-flight request and the backend does its own locking.

pub mod memory;

use async_trait::async_trait;

use crate::error::IndexError;
use crate::models::{ChunkRecord, DocumentSummary, ScoredChunk};

/// Metadata filter applied to index reads.
///
/// Every `Some` field must match for a record to be considered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub document_id: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
}

impl RecordFilter {
    /// Match every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match records of one document.
    pub fn document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Self::default()
        }
    }

    /// Match records embedded with the given model and dimension.
    pub fn embedded_with(model: impl Into<String>, dim: usize) -> Self {
        Self {
            embedding_model: Some(model.into()),
            embedding_dim: Some(dim),
            ..Self::default()
        }
    }

    /// Returns `true` when `record` satisfies every set field.
    pub fn matches(&self, record: &ChunkRecord) -> bool {
        self.document_id
            .as_deref()
            .map_or(true, |d| d == record.document_id())
            && self
                .embedding_model
                .as_deref()
                .map_or(true, |m| m == record.embedding_model)
            && self.embedding_dim.map_or(true, |d| d == record.embedding_dim)
    }
}

/// Abstract persistent store of chunk records.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`write_batch`](VectorIndex::write_batch) | Insert a batch of new records |
/// | [`query`](VectorIndex::query) | Nearest-neighbour search |
/// | [`replace_document`](VectorIndex::replace_document) | Swap a document's records atomically |
/// | [`delete_document`](VectorIndex::delete_document) | Remove all records of a document |
/// | [`list_documents`](VectorIndex::list_documents) | One summary per distinct document |
/// | [`count_chunks`](VectorIndex::count_chunks) | Count records matching a filter |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write a batch of records and return how many were written.
    ///
    /// Records are immutable: an id that already exists fails the batch with
    /// [`IndexError::Conflict`]. A batch is either written entirely or not
    /// at all; a backend that cannot guarantee that must report
    /// [`IndexError::PartialWrite`] listing which ids landed. Readers never
    /// observe a batch before it is complete.
    async fn write_batch(&self, records: Vec<ChunkRecord>) -> Result<usize, IndexError>;

    /// Return up to `k` records matching `filter`, ordered by ascending
    /// cosine distance to `vector`. Ties keep insertion order.
    ///
    /// An empty index yields an empty vector, not an error.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError>;

    /// Swap every record of `document_id` for `records` in one step and
    /// return how many old records were removed.
    ///
    /// Readers see either the old set or the new one, never neither. On
    /// any error the old set is left in place.
    async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<ChunkRecord>,
    ) -> Result<usize, IndexError>;

    /// Delete every record of `document_id`, returning how many were removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Summaries of every distinct document, ordered by `document_id`.
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, IndexError>;

    /// Count records matching `filter`.
    async fn count_chunks(&self, filter: &RecordFilter) -> Result<usize, IndexError>;
}
