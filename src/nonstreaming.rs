//! Non-streaming adapter (spec.md §4.8): the degenerate single-POST variant
//! of the same sentinel protocol. Begin-sentinel detection here checks only
//! the current part's text — there is no cross-event concatenation because
//! there is only one event.

use reqwest::Client;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::ProxyError;
use crate::finalizer::clean_final_text;
use crate::protocol::{is_allowlisted, BEGIN, FINISHED};
use crate::retry::{backoff_delay, is_response_complete, RetryBudgetTracker, RetryDecision};
use crate::rewrite::{build_continuation, build_upstream_request, clamp_thinking_budget, inject};
use crate::state_machine::find_begin_with_guard;

/// The parts of a single non-streaming response, classified the same way
/// `sse::parse_parts` classifies a streaming event.
#[derive(Debug, Default)]
struct NonStreamParts {
    thought_text: String,
    formal_text: String,
    has_got_begin_token: bool,
    function_call_parts: Vec<Value>,
}

/// Walk `candidates[0].content.parts` in order, splitting thought from
/// formal text and locating `BEGIN` within each part's own text.
fn process_parts(parts: &[Value], inject_begin: bool) -> NonStreamParts {
    let mut out = NonStreamParts {
        has_got_begin_token: !inject_begin,
        ..Default::default()
    };

    for part in parts {
        if part.get("functionCall").is_some() {
            out.function_call_parts.push(part.clone());
            continue;
        }

        let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }

        if !out.has_got_begin_token {
            if let Some(pos) = find_begin_with_guard(text) {
                let prefix = &text[..pos];
                let suffix = &text[pos + BEGIN.len()..];
                if !prefix.is_empty() {
                    out.thought_text.push_str(prefix);
                }
                out.has_got_begin_token = true;
                out.formal_text.push_str(suffix);
            } else if is_thought {
                out.thought_text.push_str(text);
            }
            // Non-thought text observed before BEGIN is dropped, matching
            // the streaming state machine's thought-phase behaviour.
            continue;
        }

        if is_thought {
            out.thought_text.push_str(text);
        } else {
            out.formal_text.push_str(text);
        }
    }

    out
}

fn first_candidate<'a>(body: &'a Value) -> Option<&'a Value> {
    body.get("candidates")?.as_array()?.first()
}

fn parts_of(candidate: &Value) -> &[Value] {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Build the final JSON response for a completed answer: cleaned formal
/// text, optional leading thought-prelude part, trailing function-call
/// parts (if any), `finishReason:"STOP"`.
fn build_success_response(template: &Value, result: &NonStreamParts) -> Value {
    let clean = clean_final_text(&result.formal_text);
    let mut parts = Vec::new();
    if !result.thought_text.is_empty() {
        parts.push(json!({"text": result.thought_text, "thought": true}));
    }
    if !clean.is_empty() || result.function_call_parts.is_empty() {
        parts.push(json!({"text": clean}));
    }
    parts.extend(result.function_call_parts.iter().cloned());

    let mut out = template.clone();
    if let Some(candidates) = out.get_mut("candidates").and_then(Value::as_array_mut)
        && let Some(first) = candidates.first_mut()
    {
        first["content"]["parts"] = Value::Array(parts);
        first["content"]["role"] = json!("model");
        first["finishReason"] = json!("STOP");
    }
    out
}

fn build_exhausted_response(template: &Value) -> Value {
    let mut out = template.clone();
    if let Some(candidates) = out.get_mut("candidates").and_then(Value::as_array_mut)
        && let Some(first) = candidates.first_mut()
    {
        first["content"]["parts"] = json!([{"text": format!("\n{}", crate::protocol::INCOMPLETE)}]);
        first["content"]["role"] = json!("model");
        first["finishReason"] = json!("FXXKED");
    }
    out
}

/// Run the non-streaming sentinel protocol end to end: POST, inspect the
/// result, retry via `buildContinuation` on truncation, and return the
/// finalised JSON body. Bypass decisions (model not allow-listed, or a
/// structured-output request) are made by the caller before reaching here.
pub async fn handle_non_streaming(
    client: &Client,
    config: &Config,
    url: &str,
    model: &str,
    original_headers: &HeaderMap,
    request_body: Value,
) -> Result<Value, ProxyError> {
    debug_assert!(is_allowlisted(model));

    let mut body = request_body;
    let inject_begin = clamp_thinking_budget(&mut body, model);
    let inject_finish = true;
    let mut current_body = inject(&body, inject_begin, inject_finish);

    let mut tracker = RetryBudgetTracker::new();
    let mut accumulated_formal = String::new();
    let mut accumulated_thought = String::new();
    let mut last_template: Value = json!({"candidates": [{"content": {"parts": []}, "index": 0}]});

    loop {
        let response = build_upstream_request(client, url, original_headers, &current_body)?
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let err = ProxyError::Network(e);
                tracing::warn!(error = %err, model, "network error contacting upstream");
                match tracker.consume(err.classify(&config.fatal_status_codes), config) {
                    RetryDecision::Retry => continue,
                    RetryDecision::Exhausted => {
                        tracing::error!(model, "network retry budget exhausted");
                        return Ok(build_exhausted_response(&last_template));
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
            if let Some(delay) = backoff_delay(&err, false) {
                tokio::time::sleep(delay).await;
            }
            match tracker.consume(err.classify(&config.fatal_status_codes), config) {
                RetryDecision::Retry => continue,
                RetryDecision::Exhausted => {
                    tracing::error!(model, status = status.as_u16(), "upstream-status retry budget exhausted");
                    return Ok(build_exhausted_response(&last_template));
                }
            }
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::Decode(format!("invalid upstream JSON: {e}")))?;

        let Some(candidate) = first_candidate(&parsed) else {
            return Err(ProxyError::MalformedBody("no candidates in response".to_string()));
        };
        last_template = json!({"candidates": [candidate.clone()]});

        if candidate.get("content").is_none() {
            match tracker.consume_incomplete(config) {
                RetryDecision::Retry => continue,
                RetryDecision::Exhausted => return Ok(build_exhausted_response(&last_template)),
            }
        }

        let parts = parts_of(candidate);
        let result = process_parts(parts, inject_begin);

        if !result.function_call_parts.is_empty() {
            return Ok(build_success_response(&last_template, &result));
        }

        accumulated_thought.push_str(&result.thought_text);
        accumulated_formal.push_str(&result.formal_text);

        let ends_with_finished = accumulated_formal.ends_with(FINISHED);
        let complete = is_response_complete(
            result.has_got_begin_token,
            inject_begin,
            ends_with_finished,
            model,
        );

        if complete {
            tracing::debug!(model, "non-streaming attempt completed successfully");
            let mut merged = result.clone_with_accumulated(&accumulated_thought, &accumulated_formal);
            merged.has_got_begin_token = true;
            return Ok(build_success_response(&last_template, &merged));
        }

        tracing::debug!(model, "non-streaming response incomplete, retrying with continuation");
        match tracker.consume_incomplete(config) {
            RetryDecision::Retry => {
                // This response's own delta, not the cumulative text across
                // attempts: build_continuation inserts a fresh model turn on
                // every retry, so feeding it the running total would
                // duplicate earlier attempts' text inside the new turn.
                current_body = build_continuation(&current_body, &result.formal_text);
            }
            RetryDecision::Exhausted => {
                tracing::error!(model, "retry budget exhausted, returning incomplete marker");
                return Ok(build_exhausted_response(&last_template));
            }
        }
    }
}

impl NonStreamParts {
    fn clone_with_accumulated(&self, thought: &str, formal: &str) -> NonStreamParts {
        NonStreamParts {
            thought_text: thought.to_string(),
            formal_text: formal.to_string(),
            has_got_begin_token: self.has_got_begin_token,
            function_call_parts: self.function_call_parts.clone(),
        }
    }
}
