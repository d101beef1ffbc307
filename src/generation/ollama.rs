//! Ollama backend.
//!
//! In [`OllamaMode::Chat`] turns go to `POST /api/chat` with native roles.
//! In [`OllamaMode::Generate`] the history is flattened into a single
//! prompt for `POST /api/generate` and system turns travel in the `system`
//! field. Both endpoints stream newline-delimited JSON objects.
//!
//! No credential is needed; an unreachable server surfaces as
//! `Error connecting to Ollama: ...`.

use serde::Deserialize;
use serde_json::{json, Value};

use local_rag_core::models::{ConversationTurn, Role};

use super::{
    channel_stream, pump_lines, send_request, split_system, BackendKind, FragmentStream,
    GenerationBackend, LineEvent,
};
use crate::config::{OllamaConfig, OllamaMode};

/// Returned by [`OllamaBackend::list_models`] when the server cannot be
/// asked.
pub const FALLBACK_MODELS: &[&str] = &["llama3"];

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    mode: OllamaMode,
}

impl OllamaBackend {
    pub fn new(client: reqwest::Client, config: &OllamaConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            mode: config.mode,
        }
    }

    pub fn mode(&self) -> OllamaMode {
        self.mode
    }

    /// Names of the models installed on the server (`GET /api/tags`).
    ///
    /// Falls back to [`FALLBACK_MODELS`] when the server is unreachable or
    /// answers with an error.
    pub async fn list_models(&self) -> Vec<String> {
        match self.fetch_tags().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(error = %e, "could not list Ollama models; using fallback");
                FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
            }
        }
    }

    async fn fetch_tags(&self) -> anyhow::Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("Ollama /api/tags returned {}", response.status());
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

pub(crate) fn chat_body(turns: &[ConversationTurn], model: &str) -> Value {
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

pub(crate) fn generate_body(turns: &[ConversationTurn], model: &str) -> Value {
    let (system, rest) = split_system(turns);
    let mut body = json!({
        "model": model,
        "prompt": flatten_prompt(&rest),
        "stream": true,
    });
    if let Some(system) = system {
        body["system"] = Value::String(system);
    }
    body
}

/// `User: ...` / `Assistant: ...` lines ending with an open `Assistant:`.
pub(crate) fn flatten_prompt(turns: &[ConversationTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        let speaker = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => continue,
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

/// Parse one NDJSON line. `field` selects the text pointer:
/// `/message/content` for chat, `/response` for generate.
fn parse_ndjson(line: &str, field: &str) -> LineEvent {
    let Ok(json) = serde_json::from_str::<Value>(line) else {
        return LineEvent::Skip;
    };
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        return LineEvent::Error(err.to_string());
    }
    let text = json
        .pointer(field)
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty());
    let done = json.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    match (text, done) {
        (Some(text), true) => LineEvent::Last(text.to_string()),
        (Some(text), false) => LineEvent::Text(text.to_string()),
        (None, true) => LineEvent::Done,
        (None, false) => LineEvent::Skip,
    }
}

pub(crate) fn parse_chat_line(line: &str) -> LineEvent {
    parse_ndjson(line, "/message/content")
}

pub(crate) fn parse_generate_line(line: &str) -> LineEvent {
    parse_ndjson(line, "/response")
}

impl GenerationBackend for OllamaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn stream_chat(&self, turns: Vec<ConversationTurn>, model: &str) -> FragmentStream {
        let (url, body, parse): (String, Value, fn(&str) -> LineEvent) = match self.mode {
            OllamaMode::Chat => (
                format!("{}/api/chat", self.base_url),
                chat_body(&turns, model),
                parse_chat_line,
            ),
            OllamaMode::Generate => (
                format!("{}/api/generate", self.base_url),
                generate_body(&turns, model),
                parse_generate_line,
            ),
        };
        let request = self.client.post(url).json(&body);

        channel_stream(move |tx| async move {
            if let Some(response) = send_request(BackendKind::Ollama, request, &tx).await {
                pump_lines(BackendKind::Ollama, response, &tx, parse).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{Fragment, GenerationFailure};
    use futures_util::StreamExt;

    fn turns() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::system("Context: Paris."),
            ConversationTurn::user("Capital of France?"),
            ConversationTurn::assistant("Paris."),
            ConversationTurn::user("Sure?"),
        ]
    }

    #[test]
    fn chat_body_keeps_roles() {
        let body = chat_body(&turns(), "llama3");
        assert_eq!(body["messages"].as_array().unwrap().len(), 4);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn generate_body_flattens_history() {
        let body = generate_body(&turns(), "llama3");
        assert_eq!(body["system"], "Context: Paris.");
        assert_eq!(
            body["prompt"],
            "User: Capital of France?\nAssistant: Paris.\nUser: Sure?\nAssistant:"
        );

        let no_system = generate_body(&[ConversationTurn::user("hi")], "llama3");
        assert!(no_system.get("system").is_none());
    }

    #[test]
    fn parses_ndjson_lines() {
        assert_eq!(
            parse_chat_line(r#"{"message":{"role":"assistant","content":"Par"},"done":false}"#),
            LineEvent::Text("Par".into())
        );
        assert_eq!(
            parse_chat_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#),
            LineEvent::Done
        );
        assert_eq!(
            parse_generate_line(r#"{"response":"is","done":false}"#),
            LineEvent::Text("is".into())
        );
        assert_eq!(
            parse_generate_line(r#"{"response":".","done":true}"#),
            LineEvent::Last(".".into())
        );
        assert_eq!(
            parse_chat_line(r#"{"error":"model 'x' not found"}"#),
            LineEvent::Error("model 'x' not found".into())
        );
        assert_eq!(parse_chat_line("not json"), LineEvent::Skip);
    }

    #[tokio::test]
    async fn unreachable_server_yields_transport_failure() {
        let backend = OllamaBackend::new(
            reqwest::Client::new(),
            &OllamaConfig {
                base_url: "http://127.0.0.1:1".into(),
                mode: OllamaMode::Chat,
            },
        );
        let items: Vec<Fragment> = backend
            .stream_chat(vec![ConversationTurn::user("hi")], "llama3")
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Fragment::Failure(GenerationFailure::Transport { backend: BackendKind::Ollama, .. })
        ));
        assert!(items[0].as_text().starts_with("Error connecting to Ollama: "));
    }

    #[tokio::test]
    async fn list_models_falls_back() {
        let backend = OllamaBackend::new(
            reqwest::Client::new(),
            &OllamaConfig {
                base_url: "http://127.0.0.1:1".into(),
                mode: OllamaMode::Chat,
            },
        );
        assert_eq!(backend.list_models().await, vec!["llama3"]);
    }
}
