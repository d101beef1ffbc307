//! # Local RAG Core
//!
//! Runtime-agnostic logic for Local RAG: data models, the overlapping
//! recursive chunker, the [`Embedder`](embedding::Embedder) and
//! [`VectorIndex`](store::VectorIndex) traits, the document conversion
//! trait, and the retrieval service.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! embedders, the SQLite index, document converters, and generation
//! backends live in the `local-rag` app crate.

pub mod chunk;
pub mod convert;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieval;
pub mod store;
