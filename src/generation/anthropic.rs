//! Anthropic messages backend.
//!
//! `POST {base}/v1/messages` with `stream: true`. System turns are joined
//! into the top-level `system` parameter. Text arrives in
//! `content_block_delta` events; `message_stop` ends the reply.

use serde_json::{json, Value};

use local_rag_core::models::ConversationTurn;

use super::sse::sse_data;
use super::{
    channel_stream, failure_stream, pump_lines, send_request, split_system, BackendKind,
    FragmentStream, GenerationBackend, GenerationFailure, LineEvent,
};
use crate::config::RemoteProviderConfig;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(client: reqwest::Client, config: &RemoteProviderConfig) -> Self {
        Self {
            client,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

pub(crate) fn request_body(turns: &[ConversationTurn], model: &str) -> Value {
    let (system, rest) = split_system(turns);
    let messages: Vec<Value> = rest
        .iter()
        .map(|t| json!({"role": t.role.as_str(), "content": t.content}))
        .collect();
    let mut body = json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": messages,
        "stream": true,
    });
    if let Some(system) = system {
        body["system"] = Value::String(system);
    }
    body
}

pub(crate) fn parse_line(line: &str) -> LineEvent {
    let Some(data) = sse_data(line) else {
        return LineEvent::Skip;
    };
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return LineEvent::Skip;
    };
    match json.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => match json.pointer("/delta/text").and_then(|t| t.as_str()) {
            Some(text) if !text.is_empty() => LineEvent::Text(text.to_string()),
            _ => LineEvent::Skip,
        },
        Some("message_stop") => LineEvent::Done,
        Some("error") => LineEvent::Error(
            json.pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        ),
        _ => LineEvent::Skip,
    }
}

impl GenerationBackend for AnthropicBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
    }

    fn stream_chat(&self, turns: Vec<ConversationTurn>, model: &str) -> FragmentStream {
        let Some(api_key) = self.api_key.clone() else {
            return failure_stream(GenerationFailure::CredentialMissing {
                backend: BackendKind::Anthropic,
            });
        };
        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body(&turns, model));

        channel_stream(move |tx| async move {
            if let Some(response) = send_request(BackendKind::Anthropic, request, &tx).await {
                pump_lines(BackendKind::Anthropic, response, &tx, parse_line).await;
            }
        })
    }
}
