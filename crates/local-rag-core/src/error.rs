//! Error taxonomy for conversion, embedding, indexing, and retrieval.
//!
//! Each collaborator boundary has its own enum so callers can branch on
//! the failure class instead of matching on message text.

use thiserror::Error;

/// Failure to turn a source file into normalized text.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("document is not valid UTF-8 text: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to compute embeddings.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("{0} not set")]
    MissingCredential(String),

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedder returned {returned} vectors for {expected} inputs")]
    CountMismatch { expected: usize, returned: usize },

    #[error("embedding dimension mismatch for model '{model}': expected {expected}, observed {observed}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        observed: usize,
    },
}

/// Failure reported by a [`VectorIndex`](crate::store::VectorIndex).
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    /// The batch was rejected as a whole; nothing was written.
    #[error("index write failed, no records written: {0}")]
    Write(String),

    /// The batch contained an id that already exists; nothing was written.
    #[error("chunk id already exists: {0}")]
    Conflict(String),

    /// Some records were written and some were not. The caller may retry
    /// only `failed`.
    #[error("partial index write: {} written, {} failed: {message}", written.len(), failed.len())]
    PartialWrite {
        written: Vec<String>,
        failed: Vec<String>,
        message: String,
    },

    #[error("index query failed: {0}")]
    Query(String),
}

/// Failure of a retrieval call. An empty result set is never an error.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}
