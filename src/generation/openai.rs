//! OpenAI chat completions backend.
//!
//! `POST {base}/chat/completions` with `stream: true`. The reply arrives as
//! SSE `data:` lines carrying `choices[0].delta.content`, terminated by
//! `data: [DONE]`. System turns are sent with the native `system` role.

use serde_json::{json, Value};

use local_rag_core::models::ConversationTurn;

use super::sse::sse_data;
use super::{
    channel_stream, failure_stream, pump_lines, send_request, BackendKind, FragmentStream,
    GenerationBackend, GenerationFailure, LineEvent,
};
use crate::config::RemoteProviderConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiBackend {
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

/// Request body with turns sent verbatim.
pub(crate) fn request_body(turns: &[ConversationTurn], model: &str) -> Value {
    let messages: Vec<Value> = turns
        .iter()
        .map(|t| json!({"role": t.role.as_str(), "content": t.content}))
        .collect();
    json!({
        "model": model,
        "messages": messages,
        "stream": true,
    })
}

pub(crate) fn parse_line(line: &str) -> LineEvent {
    let Some(data) = sse_data(line) else {
        return LineEvent::Skip;
    };
    if data.trim() == "[DONE]" {
        return LineEvent::Done;
    }
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
    match json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => LineEvent::Text(text.to_string()),
        _ => LineEvent::Skip,
    }
}

impl GenerationBackend for OpenAiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    fn stream_chat(&self, turns: Vec<ConversationTurn>, model: &str) -> FragmentStream {
        let Some(api_key) = self.api_key.clone() else {
            return failure_stream(GenerationFailure::CredentialMissing {
                backend: BackendKind::OpenAi,
            });
        };
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request_body(&turns, model));

        channel_stream(move |tx| async move {
            if let Some(response) = send_request(BackendKind::OpenAi, request, &tx).await {
                pump_lines(BackendKind::OpenAi, response, &tx, parse_line).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Fragment;
    use futures_util::StreamExt;

    #[test]
    fn body_keeps_roles() {
        let turns = vec![
            ConversationTurn::system("ctx"),
            ConversationTurn::user("q"),
            ConversationTurn::assistant("a"),
        ];
        let body = request_body(&turns, "gpt-4o");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["messages"][1]["content"], "q");
    }

    #[test]
    fn parses_sse_lines() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            LineEvent::Text("Hel".into())
        );
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            LineEvent::Skip
        );
        assert_eq!(parse_line("data: [DONE]"), LineEvent::Done);
        assert_eq!(parse_line(": ping"), LineEvent::Skip);
        assert_eq!(
            parse_line(r#"data: {"error":{"message":"overloaded"}}"#),
            LineEvent::Error("overloaded".into())
        );
    }

    #[tokio::test]
    async fn missing_key_yields_single_failure() {
        let backend = OpenAiBackend::new(reqwest::Client::new(), &RemoteProviderConfig::default());
        let items: Vec<Fragment> = backend
            .stream_chat(vec![ConversationTurn::user("hi")], "gpt-4o")
            .collect()
            .await;
        assert_eq!(
            items,
            vec![Fragment::Failure(GenerationFailure::CredentialMissing {
                backend: BackendKind::OpenAi
            })]
        );
    }
}
