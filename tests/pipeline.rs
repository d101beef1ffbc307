//! End-to-end tests of ingestion, retrieval, deletion, and chat through the
//! library API, using the in-memory index, a deterministic bag-of-words
//! embedder, and scripted generation backends.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tempfile::TempDir;

use local_rag::chat::ChatOutcome;
use local_rag::config::{Config, RemoteProviderConfig};
use local_rag::context::{DeleteOutcome, RagContext};
use local_rag::generation::{
    BackendKind, Fragment, FragmentStream, GenerationBackend, GenerationFailure, GenerationGateway,
    OpenAiBackend,
};
use local_rag::ingest::{IngestError, IngestOptions};
use local_rag_core::embedding::Embedder;
use local_rag_core::error::{EmbeddingError, IndexError};
use local_rag_core::models::{ChunkRecord, ConversationTurn, DocumentSummary, Role, ScoredChunk};
use local_rag_core::store::memory::InMemoryIndex;
use local_rag_core::store::{RecordFilter, VectorIndex};

// ─── Test collaborators ─────────────────────────────────────────────

const DIMS: usize = 64;

/// Hashes lowercase words into a fixed number of buckets.
struct BagOfWordsEmbedder;

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h = DefaultHasher::new();
        word.to_lowercase().hash(&mut h);
        v[(h.finish() % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Declares more dimensions than it returns.
struct ShortVectorEmbedder;

#[async_trait]
impl Embedder for ShortVectorEmbedder {
    fn model_name(&self) -> &str {
        "short"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|_| vec![1.0; 4]).collect())
    }
}

/// Lands the first record of every batch and fails the rest.
struct HalfBrokenIndex;

#[async_trait]
impl VectorIndex for HalfBrokenIndex {
    async fn write_batch(&self, records: Vec<ChunkRecord>) -> Result<usize, IndexError> {
        let ids: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
        Err(IndexError::PartialWrite {
            written: ids[..1].to_vec(),
            failed: ids[1..].to_vec(),
            message: "disk full".into(),
        })
    }
    async fn query(
        &self,
        _vector: &[f32],
        _k: usize,
        _filter: &RecordFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        Ok(Vec::new())
    }
    async fn replace_document(
        &self,
        _document_id: &str,
        _records: Vec<ChunkRecord>,
    ) -> Result<usize, IndexError> {
        Err(IndexError::Write("disk full".into()))
    }
    async fn delete_document(&self, _document_id: &str) -> Result<usize, IndexError> {
        Ok(0)
    }
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, IndexError> {
        Ok(Vec::new())
    }
    async fn count_chunks(&self, _filter: &RecordFilter) -> Result<usize, IndexError> {
        Ok(0)
    }
}

/// In-memory index whose writes start failing once `broken` is set.
#[derive(Default)]
struct FailingWritesIndex {
    inner: InMemoryIndex,
    broken: AtomicBool,
}

impl FailingWritesIndex {
    fn check(&self) -> Result<(), IndexError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(IndexError::Write("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FailingWritesIndex {
    async fn write_batch(&self, records: Vec<ChunkRecord>) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.write_batch(records).await
    }
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        self.inner.query(vector, k, filter).await
    }
    async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<ChunkRecord>,
    ) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.replace_document(document_id, records).await
    }
    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.delete_document(document_id).await
    }
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, IndexError> {
        self.inner.list_documents().await
    }
    async fn count_chunks(&self, filter: &RecordFilter) -> Result<usize, IndexError> {
        self.inner.count_chunks(filter).await
    }
}

/// Replays fixed fragments and records the turns it was given.
struct ScriptedBackend {
    kind: BackendKind,
    script: Vec<Fragment>,
    seen: Arc<Mutex<Vec<ConversationTurn>>>,
}

impl ScriptedBackend {
    fn new(kind: BackendKind, script: Vec<Fragment>) -> (Self, Arc<Mutex<Vec<ConversationTurn>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                kind,
                script,
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

impl GenerationBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }
    fn stream_chat(&self, turns: Vec<ConversationTurn>, _model: &str) -> FragmentStream {
        *self.seen.lock().unwrap() = turns;
        futures_util::stream::iter(self.script.clone()).boxed()
    }
}

fn context_with(gateway: GenerationGateway) -> (RagContext, Arc<InMemoryIndex>) {
    let index = Arc::new(InMemoryIndex::new());
    let ctx = RagContext::from_parts(
        Config::minimal(),
        Arc::new(BagOfWordsEmbedder),
        index.clone(),
        gateway,
    );
    (ctx, index)
}

fn context() -> (RagContext, Arc<InMemoryIndex>) {
    context_with(GenerationGateway::new())
}

fn write_doc(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    path
}

async fn ingest_corpus(ctx: &RagContext, dir: &TempDir) {
    let opts = IngestOptions::default();
    for (name, body) in [
        ("france.md", "Paris is the capital of France."),
        ("rust.md", "Rust is a systems programming language with ownership."),
        ("ocean.txt", "The Pacific is the largest ocean on Earth."),
    ] {
        ctx.ingest_file(&write_doc(dir, name, body), &opts)
            .await
            .unwrap();
    }
}

// ─── Ingestion & retrieval ─────────────────────────────────────────

#[tokio::test]
async fn paris_ranks_first_for_capital_of_france() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _) = context();
    ingest_corpus(&ctx, &tmp).await;

    let hits = ctx.query("capital of France", 3).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].source_document_id, "france.md");
    assert_eq!(hits[0].content, "Paris is the capital of France.");
    assert!(hits[0].similarity_score <= hits[1].similarity_score);
    assert!(hits[1].similarity_score <= hits[2].similarity_score);

    assert_eq!(ctx.query("capital of France", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_index_returns_nothing() {
    let (ctx, _) = context();
    assert!(ctx.query("anything", 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn long_document_is_chunked_with_overlap() {
    let tmp = TempDir::new().unwrap();
    let (ctx, index) = context();
    let body = "lorem ipsum dolor sit amet ".repeat(223);
    let body = &body[..6000];
    assert!(!body.contains("\n\n"));

    let report = ctx
        .ingest_file(&write_doc(&tmp, "long.txt", body), &IngestOptions::default())
        .await
        .unwrap();
    assert!(report.chunk_count >= 2);
    assert_eq!(report.embedding_model, "bag-of-words");
    assert_eq!(report.embedding_dim, DIMS);

    let hits = index
        .query(&bag_of_words("lorem"), 100, &RecordFilter::document("long.txt"))
        .await
        .unwrap();
    assert_eq!(hits.len(), report.chunk_count);
    let mut indices: Vec<i64> = hits.iter().map(|h| h.chunk_index).collect();
    indices.sort();
    assert_eq!(indices, (0..report.chunk_count as i64).collect::<Vec<_>>());
    for hit in &hits {
        assert!(hit.text.chars().count() <= 2500);
        assert_eq!(hit.chunk_id, format!("long.txt_{}", hit.chunk_index));
    }
}

#[tokio::test]
async fn empty_document_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _) = context();
    let report = ctx
        .ingest_file(&write_doc(&tmp, "blank.md", "  \n\n  "), &IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 0);
    assert!(ctx.documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn reingest_requires_replace() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _) = context();
    let path = write_doc(&tmp, "notes.md", "First version of the notes.");
    ctx.ingest_file(&path, &IngestOptions::default()).await.unwrap();

    fs::write(&path, "Second version of the notes.").unwrap();
    let err = ctx
        .ingest_file(&path, &IngestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::AlreadyIngested { chunks: 1, .. }));

    let report = ctx
        .ingest_file(&path, &IngestOptions { replace: true })
        .await
        .unwrap();
    assert_eq!(report.replaced_chunks, 1);
    let hits = ctx.query("notes version", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "Second version of the notes.");
}

#[tokio::test]
async fn failed_replace_keeps_previous_version() {
    let index = Arc::new(FailingWritesIndex::default());
    let ctx = RagContext::from_parts(
        Config::minimal(),
        Arc::new(BagOfWordsEmbedder),
        index.clone(),
        GenerationGateway::new(),
    );
    ctx.ingestion()
        .ingest_text("doc.md", "version one", &IngestOptions::default())
        .await
        .unwrap();

    index.broken.store(true, Ordering::SeqCst);
    let err = ctx
        .ingestion()
        .ingest_text("doc.md", "version two", &IngestOptions { replace: true })
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Index(IndexError::Write(_))));

    assert_eq!(
        index
            .count_chunks(&RecordFilter::document("doc.md"))
            .await
            .unwrap(),
        1
    );
    let hits = ctx.query("version one", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "version one");
}

#[tokio::test]
async fn unsupported_file_is_rejected_without_writes() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _) = context();
    let err = ctx
        .ingest_file(&write_doc(&tmp, "image.png", "not text"), &IngestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Conversion(_)));
    assert!(ctx.documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn dimension_mismatch_fails_ingest() {
    let index = Arc::new(InMemoryIndex::new());
    let ctx = RagContext::from_parts(
        Config::minimal(),
        Arc::new(ShortVectorEmbedder),
        index.clone(),
        GenerationGateway::new(),
    );
    let err = ctx
        .ingestion()
        .ingest_text("doc.md", "Some text.", &IngestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::Embedding(EmbeddingError::DimensionMismatch {
            expected: 8,
            observed: 4,
            ..
        })
    ));
    assert_eq!(index.count_chunks(&RecordFilter::all()).await.unwrap(), 0);
}

#[tokio::test]
async fn partial_index_write_is_reported() {
    let ctx = RagContext::from_parts(
        Config::minimal(),
        Arc::new(BagOfWordsEmbedder),
        Arc::new(HalfBrokenIndex),
        GenerationGateway::new(),
    );
    let text = "alpha beta gamma. ".repeat(300);
    let err = ctx
        .ingestion()
        .ingest_text("big.md", &text, &IngestOptions::default())
        .await
        .unwrap_err();
    match err {
        IngestError::PartialWrite {
            document_id,
            written,
            failed,
            ..
        } => {
            assert_eq!(document_id, "big.md");
            assert_eq!(written, vec!["big.md_0"]);
            assert!(!failed.is_empty());
            assert_eq!(failed[0], "big.md_1");
        }
        other => panic!("expected PartialWrite, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_queries_see_only_whole_documents() {
    let (ctx, index) = context();
    let ctx = Arc::new(ctx);
    let text = "river delta sediment flow. ".repeat(900);
    let expected = local_rag_core::chunk::chunk_text("river.md", &text, &ctx.config().chunking.params()).len();
    assert!(expected > 3);

    let writer = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            ctx.ingestion()
                .ingest_text("river.md", &text, &IngestOptions::default())
                .await
                .unwrap()
        })
    };

    let filter = RecordFilter::document("river.md");
    loop {
        let seen = index.count_chunks(&filter).await.unwrap();
        assert!(seen == 0 || seen == expected, "observed {seen} of {expected} chunks");
        let hits = ctx.query("river sediment", 1000).await.unwrap();
        assert!(hits.is_empty() || hits.len() == expected);
        if writer.is_finished() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let report = writer.await.unwrap();
    assert_eq!(report.chunk_count, expected);
    assert_eq!(index.count_chunks(&filter).await.unwrap(), expected);
}

// ─── Deletion ──────────────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_exactly_one_document() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _) = context();
    ingest_corpus(&ctx, &tmp).await;

    let outcome = ctx.delete_document("rust.md", false).await.unwrap();
    assert_eq!(
        outcome,
        DeleteOutcome::Deleted {
            chunks: 1,
            file_removed: false
        }
    );
    let ids: Vec<String> = ctx
        .documents()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.document_id)
        .collect();
    assert_eq!(ids, vec!["france.md", "ocean.txt"]);
}

#[tokio::test]
async fn delete_unknown_document_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let (ctx, _) = context();
    ingest_corpus(&ctx, &tmp).await;

    assert_eq!(
        ctx.delete_document("missing.md", true).await.unwrap(),
        DeleteOutcome::NotFound
    );
    assert_eq!(ctx.documents().await.unwrap().len(), 3);
}

#[tokio::test]
async fn delete_can_remove_backing_file() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.storage.upload_dir = tmp.path().to_path_buf();
    let ctx = RagContext::from_parts(
        config,
        Arc::new(BagOfWordsEmbedder),
        Arc::new(InMemoryIndex::new()),
        GenerationGateway::new(),
    );
    let path = write_doc(&tmp, "upload.md", "Uploaded content.");
    ctx.ingest_file(&path, &IngestOptions::default()).await.unwrap();

    let outcome = ctx.delete_document("upload.md", true).await.unwrap();
    assert_eq!(
        outcome,
        DeleteOutcome::Deleted {
            chunks: 1,
            file_removed: true
        }
    );
    assert!(!path.exists());
}

// ─── Generation & chat ─────────────────────────────────────────────

#[tokio::test]
async fn missing_credential_is_a_single_fragment() {
    let gateway = GenerationGateway::new().with_backend(Arc::new(OpenAiBackend::new(
        reqwest::Client::new(),
        &RemoteProviderConfig::default(),
    )));
    let fragments: Vec<Fragment> = gateway
        .stream(&[ConversationTurn::user("hello")], "openai", None)
        .unwrap()
        .collect()
        .await;
    assert_eq!(fragments.len(), 1);
    assert!(matches!(
        &fragments[0],
        Fragment::Failure(GenerationFailure::CredentialMissing {
            backend: BackendKind::OpenAi
        })
    ));
    assert_eq!(fragments[0].as_text(), "Error: OpenAI API Key not configured.");
}

#[tokio::test]
async fn chat_grounds_prompt_and_cites_sources() {
    let tmp = TempDir::new().unwrap();
    let (backend, seen) = ScriptedBackend::new(
        BackendKind::Ollama,
        vec![Fragment::Text("Paris".into()), Fragment::Text(".".into())],
    );
    let (ctx, _) = context_with(GenerationGateway::new().with_backend(Arc::new(backend)));
    ingest_corpus(&ctx, &tmp).await;
    ctx.ingestion()
        .ingest_text("long.md", &"France capital facts. ".repeat(20), &IngestOptions::default())
        .await
        .unwrap();

    let history = vec![
        ConversationTurn::user("Hi"),
        ConversationTurn::assistant("Hello! Ask me anything."),
    ];
    let answer = ctx
        .chat("What is the capital of France?", &history, "ollama", None)
        .await
        .unwrap();

    assert_eq!(answer.text, "Paris.");
    assert_eq!(answer.outcome, ChatOutcome::Completed);
    assert_eq!(answer.sources.len(), 3);
    assert!(answer
        .sources
        .iter()
        .all(|s| s.content_snippet.chars().count() <= 200));
    assert!(answer.sources.iter().any(|s| s.source_document_id == "france.md"));

    let turns = seen.lock().unwrap().clone();
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[0].role, Role::System);
    assert!(turns[0]
        .content
        .contains("Source: france.md\nContent: Paris is the capital of France."));
    assert_eq!(turns[1].content, "Hi");
    assert_eq!(turns[3].role, Role::User);
    assert_eq!(turns[3].content, "What is the capital of France?");
}

#[tokio::test]
async fn chat_reports_generation_failure() {
    let tmp = TempDir::new().unwrap();
    let failure = GenerationFailure::Transport {
        backend: BackendKind::Gemini,
        message: "connection reset".into(),
    };
    let (backend, _) = ScriptedBackend::new(
        BackendKind::Gemini,
        vec![
            Fragment::Text("Par".into()),
            Fragment::Failure(failure.clone()),
            Fragment::Text("never delivered".into()),
        ],
    );
    let (ctx, _) = context_with(GenerationGateway::new().with_backend(Arc::new(backend)));
    ingest_corpus(&ctx, &tmp).await;

    let answer = ctx
        .chat("capital of France", &[], "gemini", Some("gemini-pro"))
        .await
        .unwrap();
    assert_eq!(answer.text, "Par");
    assert!(!answer.is_complete());
    assert_eq!(answer.outcome, ChatOutcome::Failed(failure));
}

#[tokio::test]
async fn chat_with_unknown_backend_errors() {
    let (ctx, _) = context();
    let err = ctx.chat("hello", &[], "watson", None).await.unwrap_err();
    assert!(err.to_string().contains("unknown generation backend 'watson'"));
}
