//! Streaming engine: wires the request rewriter (C2), SSE codec (C3), the
//! lookahead forwarder (C4), the stream state machine (C5), the retry
//! controller (C6), and the response finaliser (C7) into the per-request
//! attempt loop described in spec.md §2's Flow.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::error::ProxyError;
use crate::finalizer::{build_exhausted_event, build_success_event};
use crate::forwarder::{strip_trailing_partial_sentinel, LookaheadForwarder};
use crate::protocol::FINISHED;
use crate::retry::{
    backoff_delay, build_heartbeat_event, heartbeat_should_mark_thought, inactivity_deadline,
    is_cherry_client, is_response_complete, RetryBudgetTracker, RetryDecision, HEARTBEAT_INTERVAL,
};
use crate::rewrite::{
    apply_ghost_loop_remediation, build_continuation, build_upstream_request,
    clamp_thinking_budget, inject,
};
use crate::sse::{decode, encode_event, edit_event, parse_event_json, parse_parts, text_part};
use crate::state_machine::{detect_ghost_loop, process_event, AttemptState, EventOutcome, RequestState};

/// The client-visible SSE byte stream this engine produces.
pub type EngineStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::convert::Infallible>> + Send>>;

/// How many pending chunks the writer channel buffers before the ingestion
/// loop backpressures (spec.md §5: heartbeat and engine emissions fan into
/// one writer).
const CHANNEL_CAPACITY: usize = 64;

fn default_template() -> Value {
    json!({"candidates": [{"content": {"parts": []}, "index": 0}]})
}

/// Spawn the per-request attempt loop as a background task and return the
/// stream the HTTP layer should forward to the client. Running the loop in
/// its own task, fanned into a channel, is the single-writer shape spec.md
/// §5 calls for (heartbeat ticks and engine emissions both write to `tx`;
/// neither can split the other's `data:` frame because both hold `&mut`
/// access only via sequential `.await`s on the same task).
pub fn handle_streaming(
    client: Client,
    config: Config,
    url: String,
    model: String,
    original_headers: HeaderMap,
    user_agent: Option<String>,
    request_body: Value,
) -> EngineStream {
    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    tokio::spawn(run_request(
        client,
        config,
        url,
        model,
        original_headers,
        user_agent,
        request_body,
        tx,
    ));
    Box::pin(ReceiverStream::new(rx).map(Ok))
}

async fn emit(tx: &mpsc::Sender<Bytes>, event: &Value) -> bool {
    tx.send(Bytes::from(encode_event(event))).await.is_ok()
}

async fn run_request(
    client: Client,
    config: Config,
    url: String,
    model: String,
    original_headers: HeaderMap,
    user_agent: Option<String>,
    request_body: Value,
    tx: mpsc::Sender<Bytes>,
) {
    let mut body = request_body;
    let inject_begin = clamp_thinking_budget(&mut body, &model);
    let include_thoughts = body
        .pointer("/generationConfig/thinkingConfig/includeThoughts")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let initial_body = inject(&body, inject_begin, true);
    let mut req = RequestState::new(inject_begin, include_thoughts, initial_body);
    let mut tracker = RetryBudgetTracker::new();
    let cherry_client = is_cherry_client(user_agent.as_deref());
    let mut last_valid_template = default_template();

    'attempts: loop {
        req.attempts += 1;
        tracing::debug!(model, attempt = req.attempts, "starting upstream attempt");

        let builder = match build_upstream_request(&client, &url, &original_headers, &req.current_request_body) {
            Ok(b) => b,
            Err(err) => {
                tracing::error!(error = %err, "could not build upstream request, ending request");
                emit(&tx, &build_exhausted_event(&last_valid_template)).await;
                return;
            }
        };

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                let err = ProxyError::Network(e);
                tracing::warn!(error = %err, attempt = req.attempts, "network error contacting upstream");
                match tracker.consume(err.classify(&config.fatal_status_codes), &config) {
                    RetryDecision::Retry => continue 'attempts,
                    RetryDecision::Exhausted => {
                        tracing::error!(model, "network retry budget exhausted");
                        emit(&tx, &build_exhausted_event(&last_valid_template)).await;
                        return;
                    }
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let truncated: String = body_text.chars().take(500).collect();
            tracing::warn!(status = status.as_u16(), body = %truncated, "upstream returned non-success status");
            let err = ProxyError::UpstreamStatus {
                status: status.as_u16(),
                body: body_text,
            };
            if let Some(delay) = backoff_delay(&err, true) {
                tokio::time::sleep(delay).await;
            }
            match tracker.consume(err.classify(&config.fatal_status_codes), &config) {
                RetryDecision::Retry => continue 'attempts,
                RetryDecision::Exhausted => {
                    tracing::error!(model, status = status.as_u16(), "upstream-status retry budget exhausted");
                    emit(&tx, &build_exhausted_event(&last_valid_template)).await;
                    return;
                }
            }
        }

        let byte_stream = response.bytes_stream();
        let event_stream = decode(byte_stream);
        tokio::pin!(event_stream);

        let mut attempt = AttemptState::new();
        let mut forwarder = LookaheadForwarder::new();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        // Absolute deadline, not a relative duration recomputed every loop
        // turn: a heartbeat tick must never push back the data-inactivity
        // clock (spec.md §4.6's two timeouts race the reader independently
        // of the heartbeat). `attempt.is_first_data` is the spec's timeout
        // floor selector (§3): 20s until the first byte, 4s after.
        let mut deadline = tokio::time::Instant::now() + inactivity_deadline(attempt.is_first_data);

        'read: loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let mark_thought = heartbeat_should_mark_thought(req.thought_finished, cherry_client);
                    if !emit(&tx, &build_heartbeat_event(mark_thought)).await {
                        return;
                    }
                    continue 'read;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break 'read;
                }
                maybe_item = event_stream.next() => {
                    let Some(item) = maybe_item else { break 'read };
                    let Ok(raw) = item else { break 'read };
                    if raw.data.is_empty() {
                        continue 'read;
                    }

                    let event = match parse_event_json(&raw.data) {
                        Ok(v) => v,
                        Err(_) => continue 'read,
                    };
                    last_valid_template = event.clone();
                    let parts = parse_parts(&event);
                    let raw_frame = encode_event(&event);

                    let outcomes = process_event(&mut attempt, &mut req, &raw_frame, &event, &parts);
                    deadline = tokio::time::Instant::now() + inactivity_deadline(attempt.is_first_data);

                    for outcome in outcomes {
                        match outcome {
                            EventOutcome::Dropped => {}
                            EventOutcome::Thought(text) => {
                                if !include_thoughts {
                                    continue;
                                }
                                let ev = edit_event(&event, vec![text_part(text, true)], None);
                                if !emit(&tx, &ev).await {
                                    return;
                                }
                            }
                            EventOutcome::Formal { template, text, is_transition_line } => {
                                forwarder.ingest(template, text, is_transition_line);
                                for line in forwarder.drain_emittable() {
                                    attempt.accumulated_text_this_attempt.push_str(&line.text);
                                    let ev = edit_event(&line.template, vec![text_part(line.text, false)], None);
                                    if !emit(&tx, &ev).await {
                                        return;
                                    }
                                }
                            }
                            EventOutcome::AbandonPrematureBegin => {
                                tracing::debug!(
                                    model,
                                    attempt = req.attempts,
                                    "model emitted BEGIN as its first output with no thought stage, restarting attempt"
                                );
                                req.current_request_body = build_continuation(
                                    &req.current_request_body,
                                    &attempt.accumulated_text_this_attempt,
                                );
                                apply_ghost_loop_remediation(&mut req.current_request_body, &config.thought_prelude);
                                match tracker.consume_incomplete(&config) {
                                    RetryDecision::Retry => continue 'attempts,
                                    RetryDecision::Exhausted => {
                                        tracing::error!(model, "retry budget exhausted after premature BEGIN");
                                        emit(&tx, &build_exhausted_event(&last_valid_template)).await;
                                        return;
                                    }
                                }
                            }
                            EventOutcome::EnterPassthrough { raw_event_data } => {
                                if !forwarder.is_empty() {
                                    let mut flushed_text = String::new();
                                    let mut flushed_template = last_valid_template.clone();
                                    for line in forwarder.take_all() {
                                        flushed_text.push_str(&line.text);
                                        flushed_template = line.template;
                                    }
                                    let cleaned = strip_trailing_partial_sentinel(&flushed_text);
                                    if !cleaned.is_empty() {
                                        attempt.accumulated_text_this_attempt.push_str(&cleaned);
                                        let ev = edit_event(
                                            &flushed_template,
                                            vec![text_part(cleaned, false)],
                                            None,
                                        );
                                        if !emit(&tx, &ev).await {
                                            return;
                                        }
                                    }
                                }
                                if tx.send(Bytes::from(raw_event_data)).await.is_err() {
                                    return;
                                }
                            }
                            EventOutcome::PassthroughRaw { raw_event_data } => {
                                if tx.send(Bytes::from(raw_event_data)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }

                    if attempt.passthrough_mode {
                        continue 'read;
                    }

                    if detect_ghost_loop(
                        &attempt.accumulated_text_this_attempt,
                        forwarder.buffered_text(),
                        &config.thought_prelude,
                    ) {
                        tracing::warn!(model, attempt = req.attempts, "ghost loop detected, breaking attempt");
                        req.current_request_body = build_continuation(
                            &req.current_request_body,
                            &attempt.accumulated_text_this_attempt,
                        );
                        apply_ghost_loop_remediation(&mut req.current_request_body, &config.thought_prelude);
                        match tracker.consume_incomplete(&config) {
                            RetryDecision::Retry => continue 'attempts,
                            RetryDecision::Exhausted => {
                                tracing::error!(model, "retry budget exhausted after ghost loop");
                                emit(&tx, &build_exhausted_event(&last_valid_template)).await;
                                return;
                            }
                        }
                    }
                }
            }
        }

        if attempt.passthrough_mode {
            // Sticky passthrough: upstream closed, nothing more to reconcile.
            return;
        }

        let combined_tail = format!(
            "{}{}",
            attempt.accumulated_text_this_attempt,
            forwarder.buffered_text()
        );
        let ends_with_finished = combined_tail.ends_with(FINISHED);
        let complete = is_response_complete(
            attempt.has_got_begin_token,
            req.inject_begin,
            ends_with_finished,
            &model,
        );

        if complete {
            tracing::debug!(model, attempt = req.attempts, "attempt completed successfully");
            let mut residual_text = String::new();
            let mut final_template = last_valid_template.clone();
            for line in forwarder.take_all() {
                residual_text.push_str(&line.text);
                final_template = line.template;
            }
            let event = build_success_event(&final_template, "", &residual_text);
            emit(&tx, &event).await;
            return;
        }

        tracing::debug!(model, attempt = req.attempts, "stream ended without FINISHED, retrying with continuation");
        req.current_request_body =
            build_continuation(&req.current_request_body, &attempt.accumulated_text_this_attempt);
        match tracker.consume_incomplete(&config) {
            RetryDecision::Retry => continue 'attempts,
            RetryDecision::Exhausted => {
                tracing::error!(model, "retry budget exhausted, emitting incomplete marker");
                emit(&tx, &build_exhausted_event(&last_valid_template)).await;
                return;
            }
        }
    }
}
