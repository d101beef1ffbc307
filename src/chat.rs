//! Retrieval-augmented chat.
//!
//! [`ChatOrchestrator::answer`] retrieves the top passages for the user's
//! message, builds a grounding system prompt from them, and drains one
//! generation stream into a [`ChatAnswer`]. A failure fragment ends the
//! answer with [`ChatOutcome::Failed`]; it is never reported as success.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;

use local_rag_core::error::RetrievalError;
use local_rag_core::models::{ConversationTurn, RetrievedPassage};
use local_rag_core::retrieval::RetrievalService;

use crate::generation::{Fragment, FragmentStream, GenerationError, GenerationFailure, GenerationGateway};

/// Characters of passage content quoted in a [`SourceSnippet`].
pub const SNIPPET_CHARS: usize = 200;

const PROMPT_PREAMBLE: &str = "You are a helpful assistant. Use the following context to answer the user's question. If the answer is not in the context, say you don't know.\n\nContext:\n";

/// A passage cited in an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSnippet {
    pub source_document_id: String,
    /// First [`SNIPPET_CHARS`] characters of the passage.
    pub content_snippet: String,
}

impl From<&RetrievedPassage> for SourceSnippet {
    fn from(p: &RetrievedPassage) -> Self {
        Self {
            source_document_id: p.source_document_id.clone(),
            content_snippet: p.content.chars().take(SNIPPET_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum ChatOutcome {
    Completed,
    Failed(GenerationFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    /// Text fragments received before the stream ended. Failure messages
    /// are carried by `outcome`, not appended here.
    pub text: String,
    pub sources: Vec<SourceSnippet>,
    pub outcome: ChatOutcome,
}

impl ChatAnswer {
    pub fn is_complete(&self) -> bool {
        self.outcome == ChatOutcome::Completed
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Grounding prompt: each passage as `Source: ..\nContent: ..`, separated
/// by blank lines.
pub fn build_system_prompt(passages: &[RetrievedPassage]) -> String {
    let context = passages
        .iter()
        .map(|p| format!("Source: {}\nContent: {}", p.source_document_id, p.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{PROMPT_PREAMBLE}{context}")
}

/// Turns sent to the backend: the system prompt, the history, then the
/// user's message.
pub fn build_turns(
    system_prompt: String,
    history: &[ConversationTurn],
    message: &str,
) -> Vec<ConversationTurn> {
    let mut turns = Vec::with_capacity(history.len() + 2);
    turns.push(ConversationTurn::system(system_prompt));
    turns.extend(history.iter().cloned());
    turns.push(ConversationTurn::user(message));
    turns
}

/// A reply being generated, with the sources it is grounded on.
pub struct ChatStream {
    pub sources: Vec<SourceSnippet>,
    pub fragments: FragmentStream,
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    retrieval: RetrievalService,
    gateway: Arc<GenerationGateway>,
    top_k: usize,
}

impl ChatOrchestrator {
    pub fn new(retrieval: RetrievalService, gateway: Arc<GenerationGateway>, top_k: usize) -> Self {
        Self {
            retrieval,
            gateway,
            top_k,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Retrieve context and start generation without draining the reply.
    pub async fn answer_stream(
        &self,
        message: &str,
        history: &[ConversationTurn],
        backend: &str,
        model: Option<&str>,
    ) -> Result<ChatStream, ChatError> {
        let passages = self.retrieval.query(message, self.top_k).await?;
        let sources = passages.iter().map(SourceSnippet::from).collect();
        let turns = build_turns(build_system_prompt(&passages), history, message);
        let fragments = self.gateway.stream(&turns, backend, model)?;
        Ok(ChatStream { sources, fragments })
    }

    /// Answer `message` in full.
    pub async fn answer(
        &self,
        message: &str,
        history: &[ConversationTurn],
        backend: &str,
        model: Option<&str>,
    ) -> Result<ChatAnswer, ChatError> {
        let ChatStream {
            sources,
            mut fragments,
        } = self.answer_stream(message, history, backend, model).await?;

        let mut text = String::new();
        let mut outcome = ChatOutcome::Completed;
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Fragment::Text(t) => text.push_str(&t),
                Fragment::Failure(failure) => {
                    tracing::warn!(
                        backend = %failure.backend(),
                        error = %failure,
                        "generation failed"
                    );
                    outcome = ChatOutcome::Failed(failure);
                    break;
                }
            }
        }

        Ok(ChatAnswer {
            text,
            sources,
            outcome,
        })
    }
}
