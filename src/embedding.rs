//! Concrete [`Embedder`] implementations.
//!
//! - **[`DisabledEmbedder`]**: fails every call; used when `embedding.provider = "disabled"`.
//! - **[`OpenAiEmbedder`]**: `POST {base}/embeddings` with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//! - **[`LocalEmbedder`]**: fastembed ONNX inference on a blocking worker; no
//!   network after the first model download.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use local_rag::config::{EmbeddingConfig, ProvidersConfig};
//! # use local_rag::embedding::create_embedder;
//! let mut config = EmbeddingConfig::default();
//! config.provider = "disabled".to_string();
//! let embedder = create_embedder(&config, &ProvidersConfig::default()).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! The HTTP embedders retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff 1s, 2s, 4s, … capped at 32s

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use local_rag_core::embedding::Embedder;
use local_rag_core::error::EmbeddingError;

use crate::config::{EmbeddingConfig, ProvidersConfig};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Build the embedder selected by `config.provider`.
///
/// | Config value | Embedder |
/// |--------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | [`LocalEmbedder`] (requires the `local-embeddings-fastembed` feature) |
pub fn create_embedder(
    config: &EmbeddingConfig,
    providers: &ProvidersConfig,
) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config, providers)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// Embedder that refuses every call.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ HTTP helpers ============

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// POST `body` to `url`, retrying rate limits, server errors, and network
/// failures up to `max_retries` times.
async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value, EmbeddingError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(attempt, ?delay, "{} embedding retry", label);
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()));
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = EmbeddingError::Request(format!(
                    "{} API error {}: {}",
                    label, status, body_text
                ));

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(EmbeddingError::Request(format!(
                    "{} connection error ({}): {}",
                    label, url, e
                )));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| EmbeddingError::Request(format!("{} embedding failed after retries", label))))
}

fn json_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>, EmbeddingError> {
    let items = value
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse(format!("{} is not an array", what)))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse(format!("non-numeric value in {}", what)))
        })
        .collect()
}

// ============ OpenAI ============

/// Embeddings from the OpenAI API.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// A missing API key is not an error here; [`Embedder::embed`] reports
    /// it as [`EmbeddingError::MissingCredential`].
    pub fn new(config: &EmbeddingConfig, providers: &ProvidersConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let base = providers
            .openai
            .base_url
            .as_deref()
            .unwrap_or(OPENAI_API_BASE)
            .trim_end_matches('/');

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: providers.openai.api_key.clone(),
            endpoint: format!("{}/embeddings", base),
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EmbeddingError::MissingCredential("OPENAI_API_KEY".to_string()))?;

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = post_json_with_retry(
                &self.client,
                &self.endpoint,
                Some(api_key),
                &body,
                self.max_retries,
                "OpenAI",
            )
            .await?;
            out.extend(parse_openai_response(&json)?);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".to_string()))?;
        indexed.push((index, json_vector(embedding, "embedding")?));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance.
///
/// Requires an embedding model to be pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let endpoint = format!("{}/api/embed", self.url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = post_json_with_retry(
                &self.client,
                &endpoint,
                None,
                &body,
                self.max_retries,
                "Ollama",
            )
            .await?;
            out.extend(parse_ollama_response(&json)?);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing embeddings array".to_string()))?
        .iter()
        .map(|v| json_vector(v, "embedding"))
        .collect()
}

// ============ Local (fastembed) ============

/// Declared dimension of a known local model, 384 when unknown.
pub fn local_model_dims(model_name: &str) -> usize {
    match model_name {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

/// In-process embeddings via fastembed.
///
/// The ONNX model is downloaded and loaded on first use, then kept for the
/// life of the process. Inference runs on a blocking worker so it never
/// stalls the async runtime.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    fastembed_model: fastembed::EmbeddingModel,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let dims = config.dims.unwrap_or_else(|| local_model_dims(&model_name));
        let fastembed_model = config_to_fastembed_model(&model_name)?;

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
            fastembed_model,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let texts = texts.to_vec();
        let slot = Arc::clone(&self.model);
        let fastembed_model = self.fastembed_model.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| EmbeddingError::Request("local embedding model lock poisoned".into()))?;
            if guard.is_none() {
                tracing::info!(model = ?fastembed_model, "loading local embedding model");
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
                )
                .map_err(|e| {
                    EmbeddingError::Request(format!(
                        "Failed to initialize local embedding model: {}",
                        e
                    ))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| EmbeddingError::Request("local embedding model unavailable".into()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| EmbeddingError::Request(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingError::Request(format!("embedding worker failed: {}", e)))?
    }
}
