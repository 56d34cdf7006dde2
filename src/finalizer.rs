//! Response finaliser (spec.md §4.7): builds the terminal SSE event for
//! either a completed answer or an exhausted-retry outcome.

use serde_json::Value;

use crate::protocol::{FINISHED, INCOMPLETE};
use crate::sse::{edit_event, text_part};

/// `finishReason` used on a genuinely complete answer.
pub const FINISH_REASON_STOP: &str = "STOP";

/// Distinguished non-standard `finishReason` used when retries are
/// exhausted, so clients that inspect `finishReason` can tell the
/// difference from a real stop.
pub const FINISH_REASON_EXHAUSTED: &str = "FXXKED";

/// Strip a trailing `FINISHED` token and any whitespace that follows it,
/// preserving everything before it (including its own leading/trailing
/// whitespace). `clean_final_text(s + FINISHED) == s` whenever `s` does not
/// itself end in `FINISHED` (spec.md §8, invariant 5).
pub fn clean_final_text(text: &str) -> String {
    if let Some(pos) = text.rfind(FINISHED) {
        let after = &text[pos + FINISHED.len()..];
        if after.trim().is_empty() {
            return text[..pos].to_string();
        }
    }
    text.to_string()
}

/// Build the terminal event for a completed answer: the most recent valid
/// upstream event serves as the metadata template; `parts` become
/// `[{text:thought,thought:true}?, {text:cleanFormal}]` (thought part
/// omitted when empty); `finishReason` is set to `STOP`.
pub fn build_success_event(template: &Value, thought_text: &str, formal_text: &str) -> Value {
    let clean = clean_final_text(formal_text);
    let mut parts = Vec::new();
    if !thought_text.is_empty() {
        parts.push(text_part(thought_text.to_string(), true));
    }
    parts.push(text_part(clean, false));
    edit_event(template, parts, Some(FINISH_REASON_STOP))
}

/// Build the synthetic terminal event emitted when every retry budget is
/// exhausted: `parts:[{text:"\n"+INCOMPLETE}]`, `finishReason:"FXXKED"`.
pub fn build_exhausted_event(template: &Value) -> Value {
    let parts = vec![text_part(format!("\n{INCOMPLETE}"), false)];
    edit_event(template, parts, Some(FINISH_REASON_EXHAUSTED))
}
