//! Sentinel-protocol constants: the textual contract the proxy imposes on the
//! upstream model so that truncation becomes detectable.

/// Marks the first byte of the model's formal answer. Must appear at most
/// once per stream, never inside a fenced code block.
pub const BEGIN: &str = "[RESPONSE_BEGIN]";

/// Marks the last byte of the model's formal answer.
pub const FINISHED: &str = "[RESPONSE_FINISHED]";

/// Proxy-emitted marker appended when every retry budget is exhausted.
pub const INCOMPLETE: &str = "[RESPONSE_NOT_FINISHED]";

/// Models this proxy engages the sentinel protocol for. Any other model in
/// the request path bypasses the engine entirely.
pub const MODEL_ALLOWLIST: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
];

/// The `flash-lite` class is exempt from the "must contain FINISHED" half of
/// the completion predicate (§4.6) — it is known to omit the closing
/// sentinel even on genuinely complete answers.
pub const LITE_CLASS_SUBSTRING: &str = "flash-lite";

/// Returns true if `model` (as it appears in the request path) is on the
/// sentinel-protocol allow-list.
pub fn is_allowlisted(model: &str) -> bool {
    MODEL_ALLOWLIST.iter().any(|m| model.contains(m))
}

/// Returns true if `model` belongs to the completion-predicate-exempt class.
pub fn is_lite_class(model: &str) -> bool {
    model.contains(LITE_CLASS_SUBSTRING)
}

/// Inclusive `[min, max]` thinking-budget range for a model. Open Question in
/// spec.md §4.2 resolved in DESIGN.md: the ranges below are the documented
/// Gemini 2.5 thinking-budget bounds; unknown models fall back to the
/// spec-stated default.
pub fn thinking_budget_range(model: &str) -> (i64, i64) {
    if model.contains("gemini-2.5-pro") {
        (128, 32768)
    } else if model.contains("gemini-2.5-flash-lite") {
        (512, 24576)
    } else if model.contains("gemini-2.5-flash") {
        (0, 24576)
    } else {
        (128, 32768)
    }
}

/// Upstream HTTP statuses that are retried up to [`RetryBudgets::max_retries`].
pub const RETRYABLE_STATUSES: &[u16] = &[403, 429, 500, 503];

/// Retry budgets for the different error classes described in spec.md §4.1/§7.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudgets {
    /// Budget for retryable-status and incomplete-stream outcomes.
    pub max_retries: u32,
    /// Budget for transport/network failures (connect errors, etc).
    pub max_fetch_retries: u32,
    /// Budget for HTTP errors outside the retryable-status set.
    pub max_non_retryable_status_retries: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            max_retries: 100,
            max_fetch_retries: 3,
            max_non_retryable_status_retries: 3,
        }
    }
}

/// Separator the rewriter glues prompt blocks together with.
pub const PROMPT_SEPARATOR: &str = "\n\n---\n";

/// Demands `BEGIN` as the first bytes of the formal answer, exactly once,
/// with no leading whitespace or greeting.
pub const OUTPUT_START_PROTOCOL: &str = concat!(
    "Output-Start-Protocol: once you have finished any internal reasoning ",
    "and are ready to produce your formal, final answer, you must emit the ",
    "exact literal token `[RESPONSE_BEGIN]` as the very first bytes of that ",
    "answer. Do not precede it with whitespace, a greeting, or any other ",
    "character. Emit it exactly once."
);

/// Demands `FINISHED` as the last bytes of the formal answer, exactly once,
/// outside any markup.
pub const FINAL_OUTPUT_PROTOCOL: &str = concat!(
    "Final-Output-Protocol: the exact literal token `[RESPONSE_FINISHED]` ",
    "must be the very last bytes you emit, outside of any code fence or ",
    "other markup, exactly once. Nothing may follow it."
);

/// Glued onto the last user turn as a reminder of the two sentinels.
pub const REMINDER_PROMPT: &str = concat!(
    "Reminder: begin your formal answer with `[RESPONSE_BEGIN]` and end your ",
    "entire output with `[RESPONSE_FINISHED]`, each exactly once."
);

/// Instructs the model to resume a truncated answer with zero repetition.
pub const RETRY_PROMPT: &str = concat!(
    "Continue your previous answer starting at the exact next character. Do ",
    "not repeat anything you have already written and do not add a preamble ",
    "or acknowledgement. When your answer is complete, end it with the ",
    "literal token `[RESPONSE_FINISHED]` exactly once."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_matches_substring_in_full_model_path() {
        assert!(is_allowlisted("models/gemini-2.5-pro"));
        assert!(is_allowlisted("gemini-2.5-flash-lite"));
        assert!(!is_allowlisted("gemini-1.5-pro"));
    }

    #[test]
    fn lite_class_detected() {
        assert!(is_lite_class("gemini-2.5-flash-lite"));
        assert!(!is_lite_class("gemini-2.5-flash"));
    }

    #[test]
    fn thinking_budget_ranges_resolve_per_model() {
        assert_eq!(thinking_budget_range("gemini-2.5-pro"), (128, 32768));
        assert_eq!(thinking_budget_range("gemini-2.5-flash"), (0, 24576));
        assert_eq!(
            thinking_budget_range("gemini-2.5-flash-lite"),
            (512, 24576)
        );
        assert_eq!(thinking_budget_range("unknown-model"), (128, 32768));
    }

}
