//! Request rewriter (spec.md §4.2): normalises the aliased
//! `system_instruction` key, injects the sentinel-protocol prompts, clamps
//! the thinking budget, and builds continuation/upstream requests.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Url};
use serde_json::{json, Value};

use crate::error::ProxyError;
use crate::protocol::{
    thinking_budget_range, FINAL_OUTPUT_PROTOCOL, FINISHED, OUTPUT_START_PROTOCOL,
    PROMPT_SEPARATOR, REMINDER_PROMPT, RETRY_PROMPT,
};

/// Fixed identifier sent as `User-Agent` on every upstream request.
pub const PROXY_USER_AGENT: &str = "sentinel-relay/0.1";

/// Fold the aliased `system_instruction` key into the canonical
/// `systemInstruction`. Canonical wins on conflict; idempotent.
pub fn normalise(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let alias = obj.remove("system_instruction");
    if !obj.contains_key("systemInstruction")
        && let Some(alias_value) = alias
    {
        obj.insert("systemInstruction".to_string(), alias_value);
    }
}

/// Deep-copy `body`, normalise it, and append the sentinel-protocol prompt
/// blocks and per-turn reminders per spec.md §4.2. Never replaces existing
/// `systemInstruction` text — only appends.
pub fn inject(body: &Value, inject_begin: bool, inject_finish: bool) -> Value {
    let mut out = body.clone();
    normalise(&mut out);
    ensure_system_instruction_text(&mut out);

    let mut blocks = Vec::new();
    if inject_begin {
        blocks.push(OUTPUT_START_PROTOCOL);
    }
    if inject_finish {
        blocks.push(FINAL_OUTPUT_PROTOCOL);
    }
    if !blocks.is_empty() {
        append_to_system_instruction(&mut out, &blocks.join(PROMPT_SEPARATOR));
    }

    if let Some(contents) = out.get_mut("contents").and_then(Value::as_array_mut) {
        for content in contents.iter_mut() {
            if content.get("role").and_then(Value::as_str) == Some("model") {
                append_to_last_text_part(content, FINISHED);
            }
        }
        if let Some(idx) = contents
            .iter()
            .rposition(|c| c.get("role").and_then(Value::as_str) == Some("user"))
        {
            append_to_last_nonempty_text_part(&mut contents[idx], REMINDER_PROMPT);
        }
    }

    out
}

fn ensure_system_instruction_text(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let entry = obj
        .entry("systemInstruction")
        .or_insert_with(|| json!({"parts": []}));
    if !entry.get("parts").is_some_and(Value::is_array) {
        entry["parts"] = json!([]);
    }
    let parts = entry["parts"].as_array_mut().unwrap();
    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    } else if !parts[0].get("text").is_some_and(Value::is_string) {
        parts[0]["text"] = json!("");
    }
}

/// Append `addition` to `systemInstruction.parts[0].text`, separated by
/// [`PROMPT_SEPARATOR`] if that text is non-empty.
fn append_to_system_instruction(body: &mut Value, addition: &str) {
    let Some(text) = body.pointer_mut("/systemInstruction/parts/0/text") else {
        return;
    };
    let current = text.as_str().unwrap_or("").to_string();
    *text = json!(join_with_separator(&current, addition));
}

fn join_with_separator(existing: &str, addition: &str) -> String {
    if existing.is_empty() {
        addition.to_string()
    } else {
        format!("{existing}{PROMPT_SEPARATOR}{addition}")
    }
}

/// Append `suffix` to the last part in `content.parts` that carries a `text`
/// field, whether empty or not.
fn append_to_last_text_part(content: &mut Value, suffix: &str) {
    let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
        return;
    };
    for part in parts.iter_mut().rev() {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            let joined = format!("{text}{suffix}");
            part["text"] = json!(joined);
            return;
        }
    }
}

/// Append `suffix` to the last part whose `text` is non-empty; if none
/// exists, push a new text part (spec.md leaves this edge case to the
/// implementation — an all-empty or text-less user turn still needs the
/// reminder attached somewhere).
fn append_to_last_nonempty_text_part(content: &mut Value, suffix: &str) {
    let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
        return;
    };
    for part in parts.iter_mut().rev() {
        if let Some(text) = part.get("text").and_then(Value::as_str)
            && !text.is_empty()
        {
            let joined = format!("{text}{suffix}");
            part["text"] = json!(joined);
            return;
        }
    }
    parts.push(json!({"text": suffix}));
}

/// Clamp `generationConfig.thinkingConfig.thinkingBudget` into the model's
/// inclusive range. Returns whether begin-sentinel injection should stay
/// enabled: `false` iff the budget is explicitly `0`.
pub fn clamp_thinking_budget(body: &mut Value, model: &str) -> bool {
    let Some(budget) = body
        .pointer("/generationConfig/thinkingConfig/thinkingBudget")
        .and_then(Value::as_i64)
    else {
        return true;
    };

    if budget == 0 {
        return false;
    }
    if budget > 0 {
        let (min, max) = thinking_budget_range(model);
        let clamped = budget.clamp(min, max);
        if clamped != budget
            && let Some(slot) = body.pointer_mut("/generationConfig/thinkingConfig/thinkingBudget")
        {
            *slot = json!(clamped);
        }
    }
    true
}

/// Build a continuation request per spec.md §4.2: if the client has seen
/// `FINISHED.len()` characters or fewer this attempt there is nothing worth
/// resuming from, so the body is returned unchanged. Otherwise two new
/// `contents` entries are inserted immediately after the last `user` entry
/// (or appended, if none exists).
pub fn build_continuation(current_body: &Value, accumulated_text: &str) -> Value {
    if accumulated_text.len() <= FINISHED.len() {
        return current_body.clone();
    }

    let mut out = current_body.clone();
    normalise(&mut out);

    let model_turn = json!({"role": "model", "parts": [{"text": accumulated_text}]});
    let user_turn = json!({"role": "user", "parts": [{"text": RETRY_PROMPT}]});

    let obj = out.as_object_mut().expect("request body must be an object");
    let contents = obj
        .entry("contents")
        .or_insert_with(|| Value::Array(Vec::new()));
    let contents = contents.as_array_mut().expect("contents must be an array");

    match contents
        .iter()
        .rposition(|c| c.get("role").and_then(Value::as_str) == Some("user"))
    {
        Some(idx) => {
            contents.insert(idx + 1, user_turn);
            contents.insert(idx + 1, model_turn);
        }
        None => {
            contents.push(model_turn);
            contents.push(user_turn);
        }
    }

    out
}

/// Ghost-loop remediation (spec.md §4.2/§4.5): when the last `contents`
/// entry is a model turn, rewrite its final text part to exactly the
/// thought-prelude string, resetting the model's continuation anchor.
pub fn apply_ghost_loop_remediation(body: &mut Value, thought_prelude: &str) {
    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };
    let Some(last) = contents.last_mut() else {
        return;
    };
    if last.get("role").and_then(Value::as_str) != Some("model") {
        return;
    }
    let Some(parts) = last.get_mut("parts").and_then(Value::as_array_mut) else {
        return;
    };
    if let Some(last_part) = parts.last_mut() {
        last_part["text"] = json!(thought_prelude);
    }
}

/// Build the outbound upstream request: copies `Content-Type`, moves a
/// `?key=` query parameter into the `X-Goog-Api-Key` header if no such
/// header is already present, sets the fixed proxy `User-Agent`, and always
/// POSTs the (possibly rewritten) JSON body.
pub fn build_upstream_request(
    client: &Client,
    url: &str,
    original_headers: &HeaderMap,
    body: &Value,
) -> Result<RequestBuilder, ProxyError> {
    let mut parsed =
        Url::parse(url).map_err(|e| ProxyError::Other(format!("invalid upstream URL: {e}")))?;

    let mut api_key: Option<String> = original_headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if api_key.is_none() {
        let key_from_query = parsed
            .query_pairs()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned());
        if let Some(key) = key_from_query {
            api_key = Some(key);
            let remaining: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| k != "key")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if remaining.is_empty() {
                parsed.set_query(None);
            } else {
                let mut pairs = parsed.query_pairs_mut();
                pairs.clear();
                for (k, v) in remaining {
                    pairs.append_pair(&k, &v);
                }
            }
        }
    }

    let mut builder = client.post(parsed).header("User-Agent", PROXY_USER_AGENT);

    if let Some(ct) = original_headers.get(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, ct.clone());
    } else {
        builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if let Some(key) = api_key {
        builder = builder.header("X-Goog-Api-Key", key);
    }

    Ok(builder.json(body))
}
