//! Ingestion pipeline: convert → chunk → embed → write.
//!
//! [`IngestionPipeline::ingest_file`] turns one source file into chunk
//! records in the [`VectorIndex`]:
//!
//! 1. Convert the file to normalized text on a blocking worker.
//! 2. Split it with the overlapping chunker (2500 / 400 by default).
//! 3. Embed every chunk text in one [`Embedder::embed`] call.
//! 4. Stamp each record with the model name, the observed dimension, and
//!    the chunk version, then write them with one `write_batch`.
//!
//! A document with no text yields a report with `chunk_count == 0` and
//! nothing is written. Records are immutable: re-ingesting a document that
//! already has chunks fails with [`IngestError::AlreadyIngested`] unless
//! [`IngestOptions::replace`] is set, in which case the embedded new set
//! takes the old one's place through [`VectorIndex::replace_document`]. A
//! failed replacement leaves the previous version searchable.
//!
//! Ingest and delete calls for the same `document_id` are serialized
//! through [`DocumentLocks`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use local_rag_core::chunk::{chunk_text, ChunkParams};
use local_rag_core::convert::DocumentConverter;
use local_rag_core::embedding::{check_dimension, Embedder};
use local_rag_core::error::{ConversionError, EmbeddingError, IndexError};
use local_rag_core::models::{ChunkRecord, CHUNK_VERSION};
use local_rag_core::store::{RecordFilter, VectorIndex};

use crate::context::DocumentLocks;
use crate::extract;

/// Per-call ingestion switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Swap out the document's existing chunks for the new set.
    pub replace: bool,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub embedding_model: String,
    /// Observed vector dimension; 0 when nothing was embedded.
    pub embedding_dim: usize,
    /// Chunks of a previous version removed by `replace`.
    pub replaced_chunks: usize,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("cannot derive a document id from path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(IndexError),

    /// Some records of the batch were written. The index holds an
    /// incomplete version of the document until it is deleted or the
    /// failed ids are retried.
    #[error(
        "document '{document_id}' partially written: {} chunks written, {} failed: {message}",
        written.len(),
        failed.len()
    )]
    PartialWrite {
        document_id: String,
        written: Vec<String>,
        failed: Vec<String>,
        message: String,
    },

    #[error("document '{document_id}' is already ingested ({chunks} chunks); delete it first or ingest with replace")]
    AlreadyIngested { document_id: String, chunks: usize },

    #[error("ingestion worker failed: {0}")]
    Worker(String),
}

impl IngestError {
    fn from_index(document_id: &str, err: IndexError) -> Self {
        match err {
            IndexError::PartialWrite {
                written,
                failed,
                message,
            } => IngestError::PartialWrite {
                document_id: document_id.to_string(),
                written,
                failed,
                message,
            },
            other => IngestError::Index(other),
        }
    }
}

/// Derive the document id of a source file: its base name.
pub fn document_id_for(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| IngestError::InvalidPath(path.display().to_string()))
}

/// Write-side half of the pipeline.
#[derive(Clone)]
pub struct IngestionPipeline {
    converter: Arc<dyn DocumentConverter>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    params: ChunkParams,
    locks: DocumentLocks,
}

impl IngestionPipeline {
    pub fn new(
        converter: Arc<dyn DocumentConverter>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        params: ChunkParams,
        locks: DocumentLocks,
    ) -> Self {
        Self {
            converter,
            embedder,
            index,
            params,
            locks,
        }
    }

    /// Convert, chunk, embed, and write the file at `path`.
    pub async fn ingest_file(
        &self,
        path: &Path,
        options: &IngestOptions,
    ) -> Result<IngestReport, IngestError> {
        let document_id = document_id_for(path)?;
        let _guard = self.locks.lock(&document_id).await;

        let existing = self.existing_chunks(&document_id, options).await?;

        let converter = Arc::clone(&self.converter);
        let owned: PathBuf = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || converter.convert(&owned))
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))??;

        self.write_document(&document_id, &document_id, &text, existing)
            .await
    }

    /// Chunk, embed, and write already-converted `text`.
    pub async fn ingest_text(
        &self,
        document_id: &str,
        text: &str,
        options: &IngestOptions,
    ) -> Result<IngestReport, IngestError> {
        let _guard = self.locks.lock(document_id).await;
        let existing = self.existing_chunks(document_id, options).await?;
        self.write_document(document_id, document_id, text, existing)
            .await
    }

    /// Chunk count of a prior version, failing when `replace` is off.
    async fn existing_chunks(
        &self,
        document_id: &str,
        options: &IngestOptions,
    ) -> Result<usize, IngestError> {
        let existing = self
            .index
            .count_chunks(&RecordFilter::document(document_id))
            .await
            .map_err(IngestError::Index)?;
        if existing > 0 && !options.replace {
            return Err(IngestError::AlreadyIngested {
                document_id: document_id.to_string(),
                chunks: existing,
            });
        }
        Ok(existing)
    }

    async fn write_document(
        &self,
        document_id: &str,
        source: &str,
        text: &str,
        existing: usize,
    ) -> Result<IngestReport, IngestError> {
        let chunks = chunk_text(document_id, text, &self.params);
        let model = self.embedder.model_name().to_string();

        if chunks.is_empty() {
            tracing::info!(document_id, "document has no text; nothing to index");
            return Ok(IngestReport {
                document_id: document_id.to_string(),
                chunk_count: 0,
                embedding_model: model,
                embedding_dim: 0,
                replaced_chunks: 0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: chunks.len(),
                returned: vectors.len(),
            }
            .into());
        }
        for v in &vectors {
            check_dimension(self.embedder.as_ref(), v.len())?;
        }
        let observed_dim = vectors.first().map(Vec::len).unwrap_or(0);

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| ChunkRecord {
                chunk,
                source: source.to_string(),
                embedding,
                embedding_model: model.clone(),
                embedding_dim: observed_dim,
                chunk_version: CHUNK_VERSION.to_string(),
            })
            .collect();
        let chunk_count = records.len();

        let replaced_chunks = if existing > 0 {
            let removed = self
                .index
                .replace_document(document_id, records)
                .await
                .map_err(|e| IngestError::from_index(document_id, e))?;
            tracing::info!(document_id, removed, "replaced previous version");
            removed
        } else {
            self.index
                .write_batch(records)
                .await
                .map_err(|e| IngestError::from_index(document_id, e))?;
            0
        };

        tracing::info!(
            document_id,
            chunks = chunk_count,
            model = %model,
            dim = observed_dim,
            "ingested document"
        );

        Ok(IngestReport {
            document_id: document_id.to_string(),
            chunk_count,
            embedding_model: model,
            embedding_dim: observed_dim,
            replaced_chunks,
        })
    }
}

/// Files under `root` that the converter supports and that match one of
/// `include_globs` (all supported files when empty), sorted by path.
///
/// A `root` that is a file is returned as-is.
pub fn collect_files(root: &Path, include_globs: &[String]) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.exists() {
        anyhow::bail!("Path does not exist: {}", root.display());
    }

    let include_set = if include_globs.is_empty() {
        None
    } else {
        Some(build_globset(include_globs)?)
    };
    let exclude_set = build_globset(&[
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ])?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if let Some(set) = &include_set {
            if !set.is_match(&rel_str) {
                continue;
            }
        }
        if !extract::is_supported(path) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    // Sort for deterministic ordering
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
