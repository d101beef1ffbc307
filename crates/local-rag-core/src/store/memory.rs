//! In-memory [`VectorIndex`] implementation for tests and ephemeral use.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`, in insertion order.
//! Queries are brute-force cosine distance over every matching record.

use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::IndexError;
use crate::models::{ChunkRecord, DocumentSummary, ScoredChunk};

use super::{RecordFilter, VectorIndex};

/// In-memory vector index.
pub struct InMemoryIndex {
    records: RwLock<Vec<ChunkRecord>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<ChunkRecord>>, IndexError> {
        self.records
            .read()
            .map_err(|_| IndexError::Unavailable("in-memory index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<ChunkRecord>>, IndexError> {
        self.records
            .write()
            .map_err(|_| IndexError::Unavailable("in-memory index lock poisoned".into()))
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn write_batch(&self, records: Vec<ChunkRecord>) -> Result<usize, IndexError> {
        let mut stored = self.write()?;

        let mut seen: HashSet<&str> = stored.iter().map(|r| r.id()).collect();
        for record in &records {
            if !seen.insert(record.id()) {
                return Err(IndexError::Conflict(record.id().to_string()));
            }
        }

        let written = records.len();
        stored.extend(records);
        Ok(written)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let stored = self.read()?;

        let mut scored: Vec<(f32, &ChunkRecord)> = stored
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| (cosine_distance(vector, &r.embedding), r))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, r)| ScoredChunk {
                chunk_id: r.chunk.id.clone(),
                document_id: r.chunk.document_id.clone(),
                source: r.source.clone(),
                chunk_index: r.chunk.chunk_index,
                text: r.chunk.text.clone(),
                distance,
            })
            .collect())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<ChunkRecord>,
    ) -> Result<usize, IndexError> {
        let mut stored = self.write()?;

        let mut seen: HashSet<&str> = stored
            .iter()
            .filter(|r| r.document_id() != document_id)
            .map(|r| r.id())
            .collect();
        for record in &records {
            if !seen.insert(record.id()) {
                return Err(IndexError::Conflict(record.id().to_string()));
            }
        }

        let before = stored.len();
        stored.retain(|r| r.document_id() != document_id);
        let removed = before - stored.len();
        stored.extend(records);
        Ok(removed)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|r| r.document_id() != document_id);
        Ok(before - stored.len())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, IndexError> {
        let stored = self.read()?;
        let mut docs: BTreeMap<&str, DocumentSummary> = BTreeMap::new();
        for r in stored.iter() {
            docs.entry(r.document_id())
                .or_insert_with(|| DocumentSummary {
                    document_id: r.document_id().to_string(),
                    source: r.source.clone(),
                    chunks: 0,
                })
                .chunks += 1;
        }
        Ok(docs.into_values().collect())
    }

    async fn count_chunks(&self, filter: &RecordFilter) -> Result<usize, IndexError> {
        Ok(self.read()?.iter().filter(|r| filter.matches(r)).count())
    }
}
