//! Uniform streaming interface over LLM backends.
//!
//! Every backend implements [`GenerationBackend::stream_chat`], which takes
//! an ordered list of [`ConversationTurn`]s and returns a lazy, finite
//! [`FragmentStream`]. The [`GenerationGateway`] resolves a backend id,
//! moves system turns to the front, and fills in the default model.
//!
//! | Backend | Wire protocol | System turns |
//! |---------|---------------|--------------|
//! | `ollama` | NDJSON on `/api/chat` or `/api/generate` | native role, or `system` field in generate mode |
//! | `openai` | SSE `data:` lines, `[DONE]` sentinel | native role |
//! | `anthropic` | SSE `content_block_delta` events | top-level `system` parameter |
//! | `gemini` | SSE from `streamGenerateContent?alt=sse` | `systemInstruction` |
//!
//! # Failure delivery
//!
//! Expected failures never surface as `Err`: a missing API key, a
//! connection error, or an HTTP error yields exactly one terminal
//! [`Fragment::Failure`] and the stream ends. Fragments already delivered
//! are not replayed. A body that ends before the backend's end-of-reply
//! marker (`[DONE]`, `message_stop`, `done: true`, a Gemini
//! `finishReason`) counts as a transport failure.
//!
//! # Cancellation
//!
//! A backend's HTTP work runs in a spawned task that feeds a bounded
//! channel. Dropping the stream closes the channel. The task races every
//! network wait against the closed channel, so it stops at once even when
//! the server has gone quiet, and dropping the response closes the
//! connection.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
mod sse;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use local_rag_core::models::{ConversationTurn, Role};

use crate::config::ProvidersConfig;

pub use anthropic::AnthropicBackend;
pub use gemini::GeminiBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

/// Fragments buffered between a backend task and its consumer.
const FRAGMENT_BUFFER: usize = 32;

/// Identifier of a generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    OpenAi,
    Anthropic,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Ollama,
        BackendKind::OpenAi,
        BackendKind::Anthropic,
        BackendKind::Gemini,
    ];

    /// Identifier used in config and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Gemini => "gemini",
        }
    }

    /// Product name used in user-facing messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "Ollama",
            BackendKind::OpenAi => "OpenAI",
            BackendKind::Anthropic => "Anthropic",
            BackendKind::Gemini => "Gemini",
        }
    }

    /// Model used when the caller names none.
    pub fn default_model(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "llama3",
            BackendKind::OpenAi => "gpt-4o",
            BackendKind::Anthropic => "claude-3-opus-20240229",
            BackendKind::Gemini => "gemini-pro",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "openai" => Ok(BackendKind::OpenAi),
            "anthropic" => Ok(BackendKind::Anthropic),
            "gemini" => Ok(BackendKind::Gemini),
            _ => Err(GenerationError::UnknownBackend(s.to_string())),
        }
    }
}

/// Error raised before any stream exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("unknown generation backend '{0}'; expected one of: ollama, openai, anthropic, gemini")]
    UnknownBackend(String),

    #[error("generation backend '{0}' is not registered")]
    NotRegistered(BackendKind),
}

/// Terminal failure delivered inside a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationFailure {
    #[error("Error: {} API Key not configured.", backend.display_name())]
    CredentialMissing { backend: BackendKind },

    #[error("Error connecting to {}: {message}", backend.display_name())]
    Transport {
        backend: BackendKind,
        message: String,
    },

    /// The backend answered with an error: an HTTP error status, or an
    /// error event in the middle of a stream (`status` is `None`).
    #[error("Error from {}: {message}", backend.display_name())]
    Backend {
        backend: BackendKind,
        status: Option<u16>,
        message: String,
    },
}

impl GenerationFailure {
    pub fn backend(&self) -> BackendKind {
        match self {
            GenerationFailure::CredentialMissing { backend }
            | GenerationFailure::Transport { backend, .. }
            | GenerationFailure::Backend { backend, .. } => *backend,
        }
    }
}

/// One item of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Failure(GenerationFailure),
}

impl Fragment {
    /// Display text of the fragment; failures render their message.
    pub fn as_text(&self) -> String {
        match self {
            Fragment::Text(t) => t.clone(),
            Fragment::Failure(f) => f.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Fragment::Failure(_))
    }
}

/// Lazy, finite, non-restartable sequence of fragments.
pub type FragmentStream = BoxStream<'static, Fragment>;

/// A chat-completion backend.
///
/// Implementations receive turns with system turns already moved to the
/// front and translate roles to their own wire format.
pub trait GenerationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn default_model(&self) -> &str {
        self.kind().default_model()
    }

    fn stream_chat(&self, turns: Vec<ConversationTurn>, model: &str) -> FragmentStream;
}

/// A stream holding a single failure.
pub fn failure_stream(failure: GenerationFailure) -> FragmentStream {
    futures_util::stream::once(async move { Fragment::Failure(failure) }).boxed()
}

/// Build a stream fed by `producer`, which is spawned on first poll.
///
/// The producer must stop once a send on its channel fails: that means the
/// consumer dropped the stream.
pub(crate) fn channel_stream<F, Fut>(producer: F) -> FragmentStream
where
    F: FnOnce(mpsc::Sender<Fragment>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    futures_util::stream::once(async move {
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        tokio::spawn(producer(tx));
        ReceiverStream::new(rx)
    })
    .flatten()
    .boxed()
}

/// Move system turns to the front, keeping the relative order of both
/// groups.
pub fn order_system_first(turns: &[ConversationTurn]) -> Vec<ConversationTurn> {
    let (system, rest): (Vec<_>, Vec<_>) = turns
        .iter()
        .cloned()
        .partition(|t| t.role == Role::System);
    system.into_iter().chain(rest).collect()
}

/// Split off system turns for backends without a system role.
///
/// Returns the system contents joined by a blank line (`None` when there
/// are none) and the remaining turns in order.
pub fn split_system(turns: &[ConversationTurn]) -> (Option<String>, Vec<ConversationTurn>) {
    let mut system = Vec::new();
    let mut rest = Vec::new();
    for turn in turns {
        if turn.role == Role::System {
            system.push(turn.content.as_str());
        } else {
            rest.push(turn.clone());
        }
    }
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, rest)
}

/// Registry of backends keyed by [`BackendKind`].
#[derive(Clone, Default)]
pub struct GenerationGateway {
    backends: HashMap<BackendKind, Arc<dyn GenerationBackend>>,
}

impl GenerationGateway {
    /// An empty gateway; add backends with [`register`](Self::register).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all four HTTP backends from resolved provider settings.
    pub fn from_config(providers: &ProvidersConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let mut gateway = Self::new();
        gateway.register(Arc::new(OllamaBackend::new(client.clone(), &providers.ollama)));
        gateway.register(Arc::new(OpenAiBackend::new(client.clone(), &providers.openai)));
        gateway.register(Arc::new(AnthropicBackend::new(
            client.clone(),
            &providers.anthropic,
        )));
        gateway.register(Arc::new(GeminiBackend::new(client, &providers.gemini)));
        Ok(gateway)
    }

    /// Add or replace the backend for its kind.
    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn backend(&self, kind: BackendKind) -> Result<Arc<dyn GenerationBackend>, GenerationError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(GenerationError::NotRegistered(kind))
    }

    /// Stream a reply from `backend` (an id such as `"openai"`).
    ///
    /// `model` falls back to the backend's default when `None` or empty.
    pub fn stream(
        &self,
        turns: &[ConversationTurn],
        backend: &str,
        model: Option<&str>,
    ) -> Result<FragmentStream, GenerationError> {
        let kind: BackendKind = backend.parse()?;
        let backend = self.backend(kind)?;
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| backend.default_model())
            .to_string();

        tracing::debug!(backend = %kind, model = %model, turns = turns.len(), "starting generation");
        Ok(backend.stream_chat(order_system_first(turns), &model))
    }
}

// ============ Shared HTTP plumbing ============

/// What one line of a streaming response means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineEvent {
    /// Nothing to forward (keep-alive, metadata, empty delta).
    Skip,
    Text(String),
    /// Text that also closes the reply.
    Last(String),
    /// The backend signalled the end of the reply.
    Done,
    /// The backend reported an error in-band.
    Error(String),
}

/// Message of the failure sent when the body ends without the backend's
/// end-of-reply marker.
pub(crate) const TRUNCATED_REPLY: &str = "stream ended before the reply was complete";

async fn send_failure(tx: &mpsc::Sender<Fragment>, failure: GenerationFailure) {
    let _ = tx.send(Fragment::Failure(failure)).await;
}

/// Send `request`; on success return the response, otherwise push one
/// failure fragment and return `None`.
///
/// Gives up without a fragment as soon as the consumer drops the stream.
pub(crate) async fn send_request(
    kind: BackendKind,
    request: reqwest::RequestBuilder,
    tx: &mpsc::Sender<Fragment>,
) -> Option<reqwest::Response> {
    let sent = tokio::select! {
        _ = tx.closed() => {
            tracing::debug!(backend = %kind, "consumer dropped stream before the response");
            return None;
        }
        sent = request.send() => sent,
    };
    let response = match sent {
        Ok(r) => r,
        Err(e) => {
            send_failure(
                tx,
                GenerationFailure::Transport {
                    backend: kind,
                    message: e.to_string(),
                },
            )
            .await;
            return None;
        }
    };

    let status = response.status();
    if status.is_success() {
        return Some(response);
    }

    let body = tokio::select! {
        _ = tx.closed() => return None,
        body = response.text() => body.unwrap_or_default(),
    };
    send_failure(
        tx,
        GenerationFailure::Backend {
            backend: kind,
            status: Some(status.as_u16()),
            message: format!("HTTP {}: {}", status.as_u16(), error_message(&body)),
        },
    )
    .await;
    None
}

/// Best-effort human message from an error body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let error = json.get("error").unwrap_or(&json);
        if let Some(msg) = error.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = error.as_str() {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}

/// Read `response` line by line, forwarding what `parse` extracts.
///
/// Stops at [`LineEvent::Done`] or [`LineEvent::Last`], at the first
/// in-band error, on a transport error, or when the consumer has gone
/// away. A body that ends before the backend marked the reply complete
/// yields one [`GenerationFailure::Transport`].
pub(crate) async fn pump_lines<P>(
    kind: BackendKind,
    response: reqwest::Response,
    tx: &mpsc::Sender<Fragment>,
    mut parse: P,
) where
    P: FnMut(&str) -> LineEvent,
{
    let mut stream = response.bytes_stream();
    let mut lines = sse::LineBuffer::new();

    loop {
        // Waiting on the network must not outlive the consumer.
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(backend = %kind, "consumer dropped stream");
                return;
            }
            next = stream.next() => next,
        };
        let (batch, finished) = match next {
            Some(Ok(bytes)) => (lines.push(&bytes), false),
            Some(Err(e)) => {
                send_failure(
                    tx,
                    GenerationFailure::Transport {
                        backend: kind,
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
            None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in batch {
            match parse(&line) {
                LineEvent::Skip => {}
                LineEvent::Text(text) => {
                    if tx.send(Fragment::Text(text)).await.is_err() {
                        tracing::debug!(backend = %kind, "consumer dropped stream");
                        return;
                    }
                }
                LineEvent::Last(text) => {
                    let _ = tx.send(Fragment::Text(text)).await;
                    return;
                }
                LineEvent::Done => return,
                LineEvent::Error(message) => {
                    send_failure(
                        tx,
                        GenerationFailure::Backend {
                            backend: kind,
                            status: None,
                            message,
                        },
                    )
                    .await;
                    return;
                }
            }
        }

        if finished {
            tracing::debug!(backend = %kind, "body ended without an end-of-reply marker");
            send_failure(
                tx,
                GenerationFailure::Transport {
                    backend: kind,
                    message: TRUNCATED_REPLY.to_string(),
                },
            )
            .await;
            return;
        }
    }
}
