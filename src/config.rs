//! Configuration parsing and validation.
//!
//! Local RAG is configured through a TOML file (default `./config/rag.toml`).
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [db]
//! path = "./data/rag.sqlite"
//!
//! [chunking]
//! chunk_size = 2500
//! chunk_overlap = 400
//!
//! [retrieval]
//! top_k = 3
//!
//! [embedding]
//! provider = "local"            # local | openai | ollama | disabled
//! model = "all-minilm-l6-v2"
//! dims = 384
//!
//! [providers.ollama]
//! base_url = "http://localhost:11434"
//! mode = "chat"                 # chat | generate
//!
//! [providers.openai]
//! api_key = "sk-..."            # falls back to OPENAI_API_KEY
//!
//! [storage]
//! upload_dir = "./uploaded_docs"
//! ```
//!
//! API keys missing from the file are read from `OPENAI_API_KEY`,
//! `ANTHROPIC_API_KEY`, and `GEMINI_API_KEY` once, by
//! [`ProvidersConfig::resolve_env`]. After that the configuration is
//! read-only.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use local_rag_core::chunk::ChunkParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/rag.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

fn default_chunk_size() -> usize {
    2500
}
fn default_chunk_overlap() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Per-backend generation settings.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub openai: RemoteProviderConfig,
    #[serde(default)]
    pub anthropic: RemoteProviderConfig,
    #[serde(default)]
    pub gemini: RemoteProviderConfig,
}

impl ProvidersConfig {
    /// Fill unset API keys from the environment.
    pub fn resolve_env(&mut self) {
        self.resolve_with(|name| std::env::var(name).ok());
    }

    fn resolve_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (cfg, var) in [
            (&mut self.openai, "OPENAI_API_KEY"),
            (&mut self.anthropic, "ANTHROPIC_API_KEY"),
            (&mut self.gemini, "GEMINI_API_KEY"),
        ] {
            if cfg.api_key.as_deref().map_or(true, str::is_empty) {
                cfg.api_key = lookup(var).filter(|k| !k.is_empty());
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default)]
    pub mode: OllamaMode,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            mode: OllamaMode::default(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

/// Which Ollama endpoint serves chat requests.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OllamaMode {
    /// `/api/chat` with native roles.
    #[default]
    Chat,
    /// `/api/generate` with history flattened into one prompt.
    Generate,
}

/// Credentials and endpoint for a hosted backend.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RemoteProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides the public API endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploaded_docs")
}

impl Config {
    /// Defaults for use when no config file is present.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate(&config)?;
    Ok(config)
}

fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, openai, or ollama.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}
