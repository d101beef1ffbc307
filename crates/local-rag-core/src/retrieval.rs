//! Nearest-neighbour retrieval over the vector index.
//!
//! [`RetrievalService`] embeds a query with the same [`Embedder`] used at
//! ingestion time and asks the [`VectorIndex`] for the `k` closest chunks
//! embedded by that model. Only records whose `embedding_model` and
//! `embedding_dim` match the active embedder are candidates, so a model
//! change never mixes incompatible vectors into one ranking.

use std::sync::Arc;

use crate::embedding::{embed_query, Embedder};
use crate::error::RetrievalError;
use crate::models::RetrievedPassage;
use crate::store::{RecordFilter, VectorIndex};

/// Query-time half of the pipeline.
#[derive(Clone)]
pub struct RetrievalService {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl RetrievalService {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Return up to `k` passages closest to `text`, most similar first.
    ///
    /// Blank queries and `k == 0` return an empty list without touching the
    /// embedder. An empty index also yields an empty list.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        if k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let vector = embed_query(self.embedder.as_ref(), text).await?;
        let filter = RecordFilter::embedded_with(self.embedder.model_name(), self.embedder.dims());
        let hits = self.index.query(&vector, k, &filter).await?;

        tracing::debug!(
            k,
            hits = hits.len(),
            model = self.embedder.model_name(),
            "retrieval query"
        );

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedPassage {
                chunk_id: hit.chunk_id,
                content: hit.text,
                source_document_id: hit.document_id,
                similarity_score: hit.distance,
            })
            .collect())
    }
}
