//! Integration tests for the streaming engine (spec.md §8 scenarios),
//! grounded on the teacher's `tests/streaming.rs` mock-upstream technique: a
//! raw `TcpListener` stands in for the Gemini streaming endpoint so tests get
//! byte-level control over chunk/connection boundaries.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sentinel_relay::config::Config;
use sentinel_relay::engine;
use sentinel_relay::protocol::RetryBudgets;

const SSE_HEADERS: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn sse_event(text: &str) -> String {
    let body = json!({
        "candidates": [{
            "content": {"parts": [{"text": text}]},
            "index": 0,
        }]
    });
    format!("data: {body}\n\n")
}

fn test_config(max_retries: u32) -> Config {
    Config {
        upstream_url_base: "http://unused.test".to_string(),
        port: 0,
        debug_mode: false,
        retry_budgets: RetryBudgets {
            max_retries,
            max_fetch_retries: 3,
            max_non_retryable_status_retries: 3,
        },
        fatal_status_codes: Vec::new(),
        thought_prelude: String::new(),
    }
}

fn request_body() -> Value {
    json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]})
}

/// Drain the engine's byte stream into one string, bounded so a stuck engine
/// fails the test instead of hanging the suite.
async fn collect(stream: engine::EngineStream) -> String {
    tokio::time::timeout(Duration::from_secs(5), async move {
        let mut stream = stream;
        let mut out = Vec::new();
        while let Some(Ok(chunk)) = stream.next().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    })
    .await
    .expect("engine stream did not finish within the test deadline")
}

/// Parse a run of `data: {...}\n\n` frames back into JSON values.
fn parse_frames(raw: &str) -> Vec<Value> {
    raw.split("\n\n")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.strip_prefix("data: ").unwrap_or(s))
        .map(|s| serde_json::from_str(s).expect("frame must be valid JSON"))
        .collect()
}

#[tokio::test]
async fn streaming_success_emits_single_clean_final_event() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket
            .write_all(
                sse_event("Intro thinking [RESPONSE_BEGIN]Final answer is 42[RESPONSE_FINISHED]")
                    .as_bytes(),
            )
            .await
            .unwrap();
    });

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/v1beta/models/gemini-2.5-pro:streamGenerateContent");
    let stream = engine::handle_streaming(
        client,
        test_config(3),
        url,
        "gemini-2.5-pro".to_string(),
        HeaderMap::new(),
        None,
        request_body(),
    );

    let raw = collect(stream).await;
    let frames = parse_frames(&raw);

    assert_eq!(frames.len(), 1, "expected exactly one terminal event, got: {raw}");
    let event = &frames[0];
    assert_eq!(event["candidates"][0]["finishReason"], "STOP");
    let parts = event["candidates"][0]["content"]["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0]["text"], "Final answer is 42");

    server.await.unwrap();
}

#[tokio::test]
async fn streaming_retries_after_connection_closes_without_finished() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        // First attempt: BEGIN but connection drops before FINISHED, and the
        // withheld text never exceeds the lookahead window, so nothing was
        // ever delivered to the client — the engine must retry from
        // scratch rather than ask the model to continue undelivered text.
        {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket.write_all(SSE_HEADERS).await.unwrap();
            socket
                .write_all(sse_event("Pre [RESPONSE_BEGIN]short").as_bytes())
                .await
                .unwrap();
        }

        // Second attempt completes cleanly.
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        socket.write_all(SSE_HEADERS).await.unwrap();
        socket
            .write_all(
                sse_event("Pre [RESPONSE_BEGIN]complete answer[RESPONSE_FINISHED]").as_bytes(),
            )
            .await
            .unwrap();
    });

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/v1beta/models/gemini-2.5-pro:streamGenerateContent");
    let stream = engine::handle_streaming(
        client,
        test_config(3),
        url,
        "gemini-2.5-pro".to_string(),
        HeaderMap::new(),
        None,
        request_body(),
    );

    let raw = collect(stream).await;
    let frames = parse_frames(&raw);

    assert_eq!(frames.len(), 1, "expected one terminal event after the retry, got: {raw}");
    let event = &frames[0];
    assert_eq!(event["candidates"][0]["finishReason"], "STOP");
    assert_eq!(
        event["candidates"][0]["content"]["parts"][0]["text"],
        "complete answer"
    );

    server.await.unwrap();
}

#[tokio::test]
async fn streaming_exhausts_budget_and_emits_incomplete_marker() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        // Budget of 0: the very first incomplete stream exhausts it.
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        socket.write_all(SSE_HEADERS).await.unwrap();
        socket
            .write_all(sse_event("Pre [RESPONSE_BEGIN]never finishes").as_bytes())
            .await
            .unwrap();
    });

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/v1beta/models/gemini-2.5-pro:streamGenerateContent");
    let stream = engine::handle_streaming(
        client,
        test_config(0),
        url,
        "gemini-2.5-pro".to_string(),
        HeaderMap::new(),
        None,
        request_body(),
    );

    let raw = collect(stream).await;
    let frames = parse_frames(&raw);

    assert_eq!(frames.len(), 1);
    let event = &frames[0];
    assert_eq!(event["candidates"][0]["finishReason"], "FXXKED");
    let text = event["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .unwrap();
    assert!(text.contains("[RESPONSE_NOT_FINISHED]"));

    server.await.unwrap();
}

#[tokio::test]
async fn streaming_function_call_flushes_buffer_then_enters_passthrough() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        socket.write_all(SSE_HEADERS).await.unwrap();

        // Formal text long enough to clear the lookahead window...
        let padded = format!(
            "Pre [RESPONSE_BEGIN]{}",
            "x".repeat(sentinel_relay::forwarder::LOOKAHEAD + 10)
        );
        socket.write_all(sse_event(&padded).as_bytes()).await.unwrap();

        // ...then a function call, which must flush the buffer and go raw.
        let fc_event = json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "lookup", "args": {}}}]},
                "index": 0,
            }]
        });
        socket
            .write_all(format!("data: {fc_event}\n\n").as_bytes())
            .await
            .unwrap();
    });

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/v1beta/models/gemini-2.5-pro:streamGenerateContent");
    let stream = engine::handle_streaming(
        client,
        test_config(3),
        url,
        "gemini-2.5-pro".to_string(),
        HeaderMap::new(),
        None,
        request_body(),
    );

    let raw = collect(stream).await;
    let frames = parse_frames(&raw);

    // One flushed-buffer text event, then the raw function-call event
    // forwarded verbatim — no terminal success/exhausted event, because
    // passthrough mode is a sticky no-op for the rest of the retry loop.
    assert_eq!(frames.len(), 2, "got: {raw}");
    let flushed_text = frames[0]["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .unwrap();
    assert!(flushed_text.starts_with('x'));
    assert!(frames[1]["candidates"][0]["content"]["parts"][0]["functionCall"].is_object());

    server.await.unwrap();
}
