//! Server-sent-event codec (spec.md §4.3): decodes upstream chunked bytes
//! into JSON events, extracts the `{thought, text, functionCall}` parts of
//! each event, and re-encodes edited events for forwarding to the client.

use bytes::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::Stream;
use serde_json::{Map, Value};

use crate::error::ProxyError;

/// Reject any single event's JSON payload larger than this.
pub const MAX_EVENT_BYTES: usize = 100 * 1024;

/// Truncate the concatenated `responseText` of a single event at this size.
pub const MAX_EVENT_RESPONSE_TEXT_BYTES: usize = 50 * 1024;

/// Wraps a raw upstream byte stream into a stream of parsed SSE events,
/// using `eventsource-stream` for blank-line-delimited framing and
/// `\r?\n`-tolerant line buffering across chunk boundaries.
pub fn decode<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<Event, EventStreamError<E>>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    byte_stream.eventsource()
}

/// The parts extracted from a single decoded event, per spec.md §4.3
/// `parseParts`.
#[derive(Debug, Default, Clone)]
pub struct ParsedParts {
    pub thought_parts: String,
    pub response_text: String,
    pub function_call: Option<Value>,
    pub has_thought: bool,
    pub has_function_call: bool,
}

impl ParsedParts {
    /// True for the "garbage thought-only" frames spec.md §4.5 says must be
    /// dropped during the thought phase.
    pub fn is_thought_only(&self) -> bool {
        self.has_thought && self.response_text.is_empty() && !self.has_function_call
    }
}

/// Parse one event's raw `data:` payload into a [`Value`], rejecting
/// oversized payloads per spec.md §4.3.
pub fn parse_event_json(data: &str) -> Result<Value, ProxyError> {
    if data.len() > MAX_EVENT_BYTES {
        return Err(ProxyError::Decode(format!(
            "event payload {} bytes exceeds {MAX_EVENT_BYTES} byte cap",
            data.len()
        )));
    }
    serde_json::from_str(data).map_err(|e| ProxyError::Decode(format!("invalid event JSON: {e}")))
}

/// Extract the first candidate's parts array from a decoded event, in
/// iteration order, classifying each part per spec.md §4.3's `parseParts`:
/// `thought===true && text` → thought text; `text && !thought` → response
/// text; `functionCall` → function call.
pub fn parse_parts(event: &Value) -> ParsedParts {
    let mut out = ParsedParts::default();

    let Some(parts) = first_candidate_parts(event) else {
        return out;
    };

    for part in parts {
        let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
        let text = part.get("text").and_then(Value::as_str);

        if is_thought && text.is_some_and(|t| !t.is_empty()) {
            out.has_thought = true;
            out.thought_parts.push_str(text.unwrap());
        } else if !is_thought {
            if let Some(t) = text
                && !t.is_empty()
            {
                if out.response_text.len() < MAX_EVENT_RESPONSE_TEXT_BYTES {
                    let remaining = MAX_EVENT_RESPONSE_TEXT_BYTES - out.response_text.len();
                    out.response_text.push_str(&truncate_chars(t, remaining));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                out.has_function_call = true;
                out.function_call = Some(fc.clone());
            }
        }
    }

    out
}

/// Byte-safe char-boundary truncation (spec.md's 50KB cap must not split a
/// UTF-8 codepoint).
fn truncate_chars(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn first_candidate_parts(event: &Value) -> Option<&Vec<Value>> {
    event
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()
}

/// Re-serialise an edited event: `{candidates:[{content:{parts:[...]},role},
/// finishReason?, index}]}`. Only `parts` and `finishReason` are mutated;
/// every other field of `template` (index, safety ratings, usage metadata)
/// survives unchanged.
pub fn edit_event(template: &Value, parts: Vec<Value>, finish_reason: Option<&str>) -> Value {
    let mut out = template.clone();

    let Some(candidates) = out.get_mut("candidates").and_then(Value::as_array_mut) else {
        return build_minimal_event(parts, finish_reason);
    };
    let Some(first) = candidates.first_mut() else {
        return build_minimal_event(parts, finish_reason);
    };

    if !first.get("content").is_some_and(Value::is_object) {
        first["content"] = Value::Object(Map::new());
    }
    first["content"]["parts"] = Value::Array(parts);
    if !first["content"].get("role").is_some() {
        first["content"]["role"] = Value::String("model".to_string());
    }
    if let Some(reason) = finish_reason {
        first["finishReason"] = Value::String(reason.to_string());
    }

    out
}

fn build_minimal_event(parts: Vec<Value>, finish_reason: Option<&str>) -> Value {
    let mut candidate = serde_json::json!({
        "content": { "parts": parts, "role": "model" },
        "index": 0,
    });
    if let Some(reason) = finish_reason {
        candidate["finishReason"] = Value::String(reason.to_string());
    }
    serde_json::json!({ "candidates": [candidate] })
}

/// Build a `{text}` or `{text, thought:true}` part object.
pub fn text_part(text: impl Into<String>, thought: bool) -> Value {
    if thought {
        serde_json::json!({ "text": text.into(), "thought": true })
    } else {
        serde_json::json!({ "text": text.into() })
    }
}

/// Render an event as the wire-format `data: {...}\n\n` frame.
pub fn encode_event(event: &Value) -> String {
    format!("data: {}\n\n", event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_parts_splits_thought_and_response_text() {
        let event = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "thinking...", "thought": true},
                        {"text": "the answer"}
                    ]
                }
            }]
        });
        let parsed = parse_parts(&event);
        assert_eq!(parsed.thought_parts, "thinking...");
        assert_eq!(parsed.response_text, "the answer");
        assert!(parsed.has_thought);
        assert!(!parsed.has_function_call);
    }

    #[test]
    fn parse_parts_detects_function_call() {
        let event = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [{"functionCall": {"name": "lookup", "args": {}}}]
                }
            }]
        });
        let parsed = parse_parts(&event);
        assert!(parsed.has_function_call);
        assert!(parsed.response_text.is_empty());
    }

    #[test]
    fn thought_only_event_is_detected() {
        let event = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "hmm", "thought": true}]}}]
        });
        let parsed = parse_parts(&event);
        assert!(parsed.is_thought_only());
    }

    #[test]
    fn oversized_event_is_rejected() {
        let huge = "x".repeat(MAX_EVENT_BYTES + 1);
        let err = parse_event_json(&huge).unwrap_err();
        assert!(matches!(err, ProxyError::Decode(_)));
    }

    #[test]
    fn edit_event_preserves_unrelated_metadata() {
        let template = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "old"}], "role": "model"},
                "finishReason": "STOP",
                "index": 0,
                "safetyRatings": ["whatever"],
            }]
        });
        let edited = edit_event(&template, vec![text_part("new", false)], Some("STOP"));
        assert_eq!(edited["candidates"][0]["content"]["parts"][0]["text"], "new");
        assert_eq!(edited["candidates"][0]["index"], 0);
        assert_eq!(edited["candidates"][0]["safetyRatings"][0], "whatever");
    }

    #[test]
    fn encode_event_wraps_in_data_frame() {
        let event = serde_json::json!({"a": 1});
        let framed = encode_event(&event);
        assert!(framed.starts_with("data: "));
        assert!(framed.ends_with("\n\n"));
    }
}
