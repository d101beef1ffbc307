//! Generation backends against a scripted HTTP server on localhost.
//!
//! Each test accepts one connection, reads the request, and writes a raw
//! HTTP/1.1 response so status codes, partial bodies, and dropped sockets
//! can be replayed exactly.

use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use local_rag::config::{OllamaConfig, OllamaMode, RemoteProviderConfig};
use local_rag::generation::{
    BackendKind, Fragment, GeminiBackend, GenerationBackend, GenerationFailure, OllamaBackend,
    OpenAiBackend,
};
use local_rag_core::models::ConversationTurn;

const NDJSON_CLOSE: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n";
const NDJSON_CHUNKED: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n";
const SSE_CLOSE: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

/// Read one request head plus its `Content-Length` body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                return;
            }
        }
    }
}

/// Serve a single connection with `respond` and return the base URL.
async fn serve_once<F, Fut>(respond: F) -> (String, JoinHandle<Fut::Output>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        respond(socket).await
    });
    (url, handle)
}

fn chunk(data: &str) -> String {
    format!("{:x}\r\n{}\r\n", data.len(), data)
}

fn ollama(url: &str) -> OllamaBackend {
    OllamaBackend::new(
        reqwest::Client::new(),
        &OllamaConfig {
            base_url: url.to_string(),
            mode: OllamaMode::Chat,
        },
    )
}

fn remote(url: &str) -> RemoteProviderConfig {
    RemoteProviderConfig {
        api_key: Some("test-key".into()),
        base_url: Some(url.to_string()),
    }
}

fn question() -> Vec<ConversationTurn> {
    vec![ConversationTurn::user("Capital of France?")]
}

#[tokio::test]
async fn complete_reply_has_no_failure() {
    let (url, server) = serve_once(|mut socket| async move {
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Par"},"done":false}"#,
            "\n",
            r#"{"message":{"role":"assistant","content":"is"},"done":false}"#,
            "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
            "\n",
        );
        socket.write_all(NDJSON_CLOSE.as_bytes()).await.unwrap();
        socket.write_all(body.as_bytes()).await.unwrap();
    })
    .await;

    let items: Vec<Fragment> = ollama(&url).stream_chat(question(), "llama3").collect().await;
    assert_eq!(
        items,
        vec![Fragment::Text("Par".into()), Fragment::Text("is".into())]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn http_error_status_is_backend_failure() {
    let (url, server) = serve_once(|mut socket| async move {
        let body = r#"{"error":"model 'nope' not found"}"#;
        let response = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    })
    .await;

    let items: Vec<Fragment> = ollama(&url).stream_chat(question(), "nope").collect().await;
    assert_eq!(
        items,
        vec![Fragment::Failure(GenerationFailure::Backend {
            backend: BackendKind::Ollama,
            status: Some(404),
            message: "HTTP 404: model 'nope' not found".into(),
        })]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn sse_backend_reports_http_status() {
    let (url, server) = serve_once(|mut socket| async move {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        let response = format!(
            "HTTP/1.1 401 Unauthorized\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    })
    .await;

    let backend = OpenAiBackend::new(reqwest::Client::new(), &remote(&url));
    let items: Vec<Fragment> = backend.stream_chat(question(), "gpt-4o").collect().await;
    assert_eq!(items.len(), 1);
    assert!(matches!(
        &items[0],
        Fragment::Failure(GenerationFailure::Backend {
            backend: BackendKind::OpenAi,
            status: Some(401),
            message,
        }) if message.contains("Incorrect API key")
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn in_band_error_follows_delivered_text() {
    let (url, server) = serve_once(|mut socket| async move {
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Par"},"done":false}"#,
            "\n",
            r#"{"error":"out of memory"}"#,
            "\n",
        );
        socket.write_all(NDJSON_CLOSE.as_bytes()).await.unwrap();
        socket.write_all(body.as_bytes()).await.unwrap();
    })
    .await;

    let items: Vec<Fragment> = ollama(&url).stream_chat(question(), "llama3").collect().await;
    assert_eq!(
        items,
        vec![
            Fragment::Text("Par".into()),
            Fragment::Failure(GenerationFailure::Backend {
                backend: BackendKind::Ollama,
                status: None,
                message: "out of memory".into(),
            }),
        ]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn broken_connection_ends_with_one_transport_failure() {
    let (url, server) = serve_once(|mut socket| async move {
        socket.write_all(NDJSON_CHUNKED.as_bytes()).await.unwrap();
        let line = concat!(
            r#"{"message":{"role":"assistant","content":"Par"},"done":false}"#,
            "\n"
        );
        socket.write_all(chunk(line).as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        // Dropped before the terminating zero-length chunk.
    })
    .await;

    let items: Vec<Fragment> = ollama(&url).stream_chat(question(), "llama3").collect().await;
    assert_eq!(items.len(), 2, "got {items:?}");
    assert_eq!(items[0], Fragment::Text("Par".into()));
    assert!(matches!(
        &items[1],
        Fragment::Failure(GenerationFailure::Transport {
            backend: BackendKind::Ollama,
            ..
        })
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn body_without_end_marker_is_transport_failure() {
    let (url, server) = serve_once(|mut socket| async move {
        socket.write_all(SSE_CLOSE.as_bytes()).await.unwrap();
        let body = concat!(
            r#"data: {"choices":[{"delta":{"content":"Paris"}}]}"#,
            "\n\n",
        );
        socket.write_all(body.as_bytes()).await.unwrap();
    })
    .await;

    let backend = OpenAiBackend::new(reqwest::Client::new(), &remote(&url));
    let items: Vec<Fragment> = backend.stream_chat(question(), "gpt-4o").collect().await;
    assert_eq!(
        items,
        vec![
            Fragment::Text("Paris".into()),
            Fragment::Failure(GenerationFailure::Transport {
                backend: BackendKind::OpenAi,
                message: "stream ended before the reply was complete".into(),
            }),
        ]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn gemini_finish_reason_completes_reply() {
    let (url, server) = serve_once(|mut socket| async move {
        socket.write_all(SSE_CLOSE.as_bytes()).await.unwrap();
        let body = concat!(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Par"}],"role":"model"}}]}"#,
            "\n\n",
            r#"data: {"candidates":[{"content":{"parts":[{"text":"is"}],"role":"model"},"finishReason":"STOP"}]}"#,
            "\n\n",
        );
        socket.write_all(body.as_bytes()).await.unwrap();
    })
    .await;

    let backend = GeminiBackend::new(reqwest::Client::new(), &remote(&url));
    let items: Vec<Fragment> = backend.stream_chat(question(), "gemini-pro").collect().await;
    assert_eq!(
        items,
        vec![Fragment::Text("Par".into()), Fragment::Text("is".into())]
    );
    server.await.unwrap();
}

#[tokio::test]
async fn dropping_stream_closes_quiet_connection() {
    let (url, server) = serve_once(|mut socket| async move {
        socket.write_all(NDJSON_CHUNKED.as_bytes()).await.unwrap();
        let line = concat!(
            r#"{"message":{"role":"assistant","content":"a"},"done":false}"#,
            "\n"
        );
        socket.write_all(chunk(line).as_bytes()).await.unwrap();
        socket.flush().await.unwrap();

        // Go quiet and wait for the client to hang up.
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    })
    .await;

    let backend = ollama(&url);
    let mut stream = backend.stream_chat(question(), "llama3");
    assert_eq!(stream.next().await, Some(Fragment::Text("a".into())));
    drop(stream);

    assert!(
        server.await.unwrap(),
        "connection stayed open after the stream was dropped"
    );
}
