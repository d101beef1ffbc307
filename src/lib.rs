//! # Local RAG
//!
//! A local retrieval-augmented generation pipeline: documents are
//! converted to text, split into overlapping chunks, embedded, and stored
//! in a SQLite vector index. Chat questions are answered by retrieving the
//! closest chunks and streaming a grounded reply from one of several LLM
//! backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Convert   │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! │ PDF/OOXML  │   │  2500 / 400  │   │  vectors  │
//! └────────────┘   └──────────────┘   └─────┬─────┘
//!                                           │ top-k
//!                  ┌──────────────┐   ┌─────▼─────┐
//!                  │  Generation  │◀──│   Chat    │
//!                  │   Gateway    │   │  prompt   │
//!                  └──────────────┘   └───────────┘
//!                  ollama · openai · anthropic · gemini
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag init
//! rag ingest ./docs
//! rag query "capital of France"
//! rag chat "What is the capital of France?" --backend ollama
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`extract`] | PDF, DOCX, PPTX, XLSX, and text conversion |
//! | [`embedding`] | Embedder construction (local, OpenAI, Ollama) |
//! | [`ingest`] | Convert → chunk → embed → write pipeline |
//! | [`sqlite_index`] | SQLite-backed vector index |
//! | [`generation`] | Streaming LLM backends |
//! | [`chat`] | Retrieval-augmented answers |
//! | [`context`] | Process-wide wiring |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//!
//! Storage-independent types, the chunker, and the in-memory index live in
//! the `local-rag-core` crate.

pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod sqlite_index;
