//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! plus pure helpers for vector serialization and distance computation.
//!
//! Concrete embedders (local fastembed, OpenAI, Ollama) live in the
//! `local-rag` app crate.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// Turns text into fixed-dimension vectors.
///
/// One instance is created at startup and shared by every request, so
/// implementations must be safe for concurrent use.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;

    /// Returns the declared embedding dimensionality (e.g. `384`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Embed a single query text and check it against the declared dimension.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let vector = embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            returned: 0,
        })?;
    check_dimension(embedder, vector.len())?;
    Ok(vector)
}

/// Fail with [`EmbeddingError::DimensionMismatch`] when `observed` differs
/// from the embedder's declared dimension.
pub fn check_dimension(embedder: &dyn Embedder, observed: usize) -> Result<(), EmbeddingError> {
    if observed != embedder.dims() {
        return Err(EmbeddingError::DimensionMismatch {
            model: embedder.model_name().to_string(),
            expected: embedder.dims(),
            observed,
        });
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use local_rag_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance: `1 - cosine_similarity`, in `[0.0, 2.0]`. Lower is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
