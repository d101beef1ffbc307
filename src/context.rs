//! Process-wide wiring of the pipeline's collaborators.
//!
//! [`RagContext`] is built once at startup from a [`Config`] and shared by
//! `Arc`. It owns the embedder, the vector index, the generation gateway,
//! and the per-document locks, and exposes the user-level operations:
//! ingest, query, chat, list, and delete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use local_rag_core::embedding::Embedder;
use local_rag_core::error::{IndexError, RetrievalError};
use local_rag_core::models::{ConversationTurn, DocumentSummary, RetrievedPassage};
use local_rag_core::retrieval::RetrievalService;
use local_rag_core::store::VectorIndex;

use crate::chat::{ChatAnswer, ChatError, ChatOrchestrator};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::extract::FileConverter;
use crate::generation::GenerationGateway;
use crate::ingest::{IngestError, IngestOptions, IngestReport, IngestionPipeline};
use crate::sqlite_index::SqliteIndex;
use crate::{db, migrate};

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Async mutex per `document_id`.
///
/// Holding the guard serializes ingest and delete calls for one document;
/// different documents never contend. An entry lives only while some task
/// holds or awaits its lock.
#[derive(Clone, Default)]
pub struct DocumentLocks {
    inner: LockMap,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, document_id: &str) -> DocumentGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(document_id.to_string()).or_default())
        };
        DocumentGuard {
            guard: Some(slot.lock_owned().await),
            document_id: document_id.to_string(),
            map: Arc::clone(&self.inner),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held lock on one document. Dropping it releases the lock and forgets
/// the entry when nobody else is waiting on it.
pub struct DocumentGuard {
    guard: Option<OwnedMutexGuard<()>>,
    document_id: String,
    map: LockMap,
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        // Release first so our own handle is not counted below.
        drop(self.guard.take());
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only taken under the map lock, so a count of one means
        // the map holds the last handle.
        if map
            .get(&self.document_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            map.remove(&self.document_id);
        }
    }
}

/// Result of deleting a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// No chunk carried the id; the index is unchanged.
    NotFound,
    Deleted { chunks: usize, file_removed: bool },
}

pub struct RagContext {
    config: Config,
    index: Arc<dyn VectorIndex>,
    retrieval: RetrievalService,
    ingestion: IngestionPipeline,
    chat: ChatOrchestrator,
    gateway: Arc<GenerationGateway>,
    locks: DocumentLocks,
}

impl RagContext {
    /// Open the SQLite index, create the configured embedder, and register
    /// every generation backend. API keys are resolved from the
    /// environment here, once.
    pub async fn open(mut config: Config) -> Result<Self> {
        config.providers.resolve_env();

        let pool = db::connect(&config).await?;
        migrate::ensure_schema(&pool).await?;
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool));
        let embedder = create_embedder(&config.embedding, &config.providers)?;
        let gateway = GenerationGateway::from_config(&config.providers)?;

        Ok(Self::from_parts(config, embedder, index, gateway))
    }

    /// Assemble a context from ready-made collaborators.
    pub fn from_parts(
        config: Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        gateway: GenerationGateway,
    ) -> Self {
        let locks = DocumentLocks::new();
        let gateway = Arc::new(gateway);
        let retrieval = RetrievalService::new(Arc::clone(&embedder), Arc::clone(&index));
        let ingestion = IngestionPipeline::new(
            Arc::new(FileConverter::new()),
            embedder,
            Arc::clone(&index),
            config.chunking.params(),
            locks.clone(),
        );
        let chat = ChatOrchestrator::new(
            retrieval.clone(),
            Arc::clone(&gateway),
            config.retrieval.top_k,
        );

        Self {
            config,
            index,
            retrieval,
            ingestion,
            chat,
            gateway,
            locks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &GenerationGateway {
        &self.gateway
    }

    pub fn chat_orchestrator(&self) -> &ChatOrchestrator {
        &self.chat
    }

    pub fn ingestion(&self) -> &IngestionPipeline {
        &self.ingestion
    }

    pub async fn ingest_file(
        &self,
        path: &Path,
        options: &IngestOptions,
    ) -> Result<IngestReport, IngestError> {
        self.ingestion.ingest_file(path, options).await
    }

    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        self.retrieval.query(text, k).await
    }

    pub async fn chat(
        &self,
        message: &str,
        history: &[ConversationTurn],
        backend: &str,
        model: Option<&str>,
    ) -> Result<ChatAnswer, ChatError> {
        self.chat.answer(message, history, backend, model).await
    }

    pub async fn documents(&self) -> Result<Vec<DocumentSummary>, IndexError> {
        self.index.list_documents().await
    }

    /// Delete every chunk of `document_id`. With `remove_file`, also delete
    /// the backing file of that name in `storage.upload_dir`.
    ///
    /// An unknown id yields [`DeleteOutcome::NotFound`] and touches nothing.
    pub async fn delete_document(
        &self,
        document_id: &str,
        remove_file: bool,
    ) -> Result<DeleteOutcome> {
        let _guard = self.locks.lock(document_id).await;

        let chunks = self.index.delete_document(document_id).await?;
        if chunks == 0 {
            return Ok(DeleteOutcome::NotFound);
        }

        let file_removed = match (remove_file, self.backing_file(document_id)) {
            (true, Some(path)) if path.is_file() => {
                std::fs::remove_file(&path)?;
                true
            }
            _ => false,
        };

        tracing::info!(document_id, chunks, file_removed, "deleted document");
        Ok(DeleteOutcome::Deleted {
            chunks,
            file_removed,
        })
    }

    /// `upload_dir/<document_id>`, or `None` when the id is not a plain
    /// file name.
    fn backing_file(&self, document_id: &str) -> Option<PathBuf> {
        let name = Path::new(document_id).file_name()?;
        if name != document_id {
            return None;
        }
        Some(self.config.storage.upload_dir.join(name))
    }
}
