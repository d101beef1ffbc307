//! Google Gemini backend.
//!
//! `POST {base}/models/{model}:streamGenerateContent?alt=sse`. Turns map
//! to `contents` with roles `user` and `model`; system turns become the
//! `systemInstruction`. Each SSE event carries a candidate whose text parts
//! are forwarded in order; the event that sets `finishReason` ends the
//! reply.

use serde_json::{json, Value};

use local_rag_core::models::{ConversationTurn, Role};

use super::sse::sse_data;
use super::{
    channel_stream, failure_stream, pump_lines, send_request, split_system, BackendKind,
    FragmentStream, GenerationBackend, GenerationFailure, LineEvent,
};
use crate::config::RemoteProviderConfig;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl GeminiBackend {
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

pub(crate) fn request_body(turns: &[ConversationTurn]) -> Value {
    let (system, rest) = split_system(turns);
    let contents: Vec<Value> = rest
        .iter()
        .map(|t| {
            let role = if t.role == Role::Assistant { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": t.content}]})
        })
        .collect();
    let mut body = json!({ "contents": contents });
    if let Some(system) = system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
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
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return LineEvent::Error(message.to_string());
    }
    let text: String = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();
    let finished = json
        .pointer("/candidates/0/finishReason")
        .is_some_and(|r| !r.is_null());
    match (text.is_empty(), finished) {
        (false, true) => LineEvent::Last(text),
        (false, false) => LineEvent::Text(text),
        (true, true) => LineEvent::Done,
        (true, false) => LineEvent::Skip,
    }
}

impl GenerationBackend for GeminiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }

    fn stream_chat(&self, turns: Vec<ConversationTurn>, model: &str) -> FragmentStream {
        let Some(api_key) = self.api_key.clone() else {
            return failure_stream(GenerationFailure::CredentialMissing {
                backend: BackendKind::Gemini,
            });
        };
        let request = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, model
            ))
            .header("x-goog-api-key", api_key)
            .json(&request_body(&turns));

        channel_stream(move |tx| async move {
            if let Some(response) = send_request(BackendKind::Gemini, request, &tx).await {
                pump_lines(BackendKind::Gemini, response, &tx, parse_line).await;
            }
        })
    }
}
