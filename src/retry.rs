//! Retry controller (spec.md §4.6): inactivity-timeout policy, error-class
//! retry budgets, completion predicate, quota-aware backoff, and heartbeat
//! policy. The actual read-vs-timer race lives in `engine.rs`, which calls
//! the pure decisions made here.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{ErrorClass, ProxyError};
use crate::protocol::is_lite_class;

/// Inactivity timeout before the first byte of an attempt.
pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(20);

/// Inactivity timeout between subsequent bytes.
pub const INTER_BYTE_TIMEOUT: Duration = Duration::from_secs(4);

/// How often a heartbeat is emitted while the response is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// `User-Agent` substring identifying a client known to mishandle
/// `thought:true` heartbeat events (spec.md §4.6 "cherry-client detection").
const CHERRY_CLIENT_MARKER: &str = "CherryStudio";

/// Deadline to use for the next `read()`, per spec.md §4.6.
pub fn inactivity_deadline(is_first_data: bool) -> Duration {
    if is_first_data {
        FIRST_BYTE_TIMEOUT
    } else {
        INTER_BYTE_TIMEOUT
    }
}

/// Completion predicate (spec.md §4.6):
/// `(hasGotBeginToken ∨ ¬injectBegin) ∧ (formalTextEndsWithFINISHED ∨ modelIsLiteClass)`.
pub fn is_response_complete(
    has_got_begin_token: bool,
    inject_begin: bool,
    formal_text_ends_with_finished: bool,
    model: &str,
) -> bool {
    (has_got_begin_token || !inject_begin) && (formal_text_ends_with_finished || is_lite_class(model))
}

/// Outcome of consulting the retry budget for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A slot remains; try again.
    Retry,
    /// The relevant budget is exhausted; emit the incomplete-marker terminal.
    Exhausted,
}

/// Tracks how many attempts have been consumed per error class against the
/// configured budgets (spec.md §4.1/§7). One instance per client request,
/// reset at the start of each request, shared across that request's attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryBudgetTracker {
    retryable_used: u32,
    fetch_used: u32,
    non_retryable_status_used: u32,
}

impl RetryBudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one consumed attempt for `class` and decide whether another
    /// attempt is still allowed under `config`'s budgets. `Fatal` never gets
    /// a budget — callers must not route fatal errors here.
    pub fn consume(&mut self, class: ErrorClass, config: &Config) -> RetryDecision {
        let (used, limit) = match class {
            ErrorClass::Fatal => return RetryDecision::Exhausted,
            ErrorClass::Retryable => (&mut self.retryable_used, config.retry_budgets.max_retries),
            ErrorClass::NonRetryableStatus => (
                &mut self.non_retryable_status_used,
                config.retry_budgets.max_non_retryable_status_retries,
            ),
            ErrorClass::Network => (&mut self.fetch_used, config.retry_budgets.max_fetch_retries),
        };
        *used += 1;
        if *used <= limit {
            RetryDecision::Retry
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Consume a retry slot for an incomplete stream (no `FINISHED`, clean
    /// end or inactivity timeout) — spec.md §7 says this consumes a
    /// `MAX_RETRIES` slot, i.e. the `Retryable` budget.
    pub fn consume_incomplete(&mut self, config: &Config) -> RetryDecision {
        self.consume(ErrorClass::Retryable, config)
    }
}

/// Markers indicating a 429's quota is *permanently* exhausted (daily/
/// per-project caps), as opposed to a transient per-minute rate limit.
fn is_hard_quota_exhausted(body: &str) -> bool {
    body.contains("\"quota_limit_value\":\"0\"")
        || body.contains("GenerateRequestsPerDayPerProjectPerModel")
}

fn mentions_quota_metric(body: &str) -> bool {
    body.to_lowercase().contains("quota")
}

/// Brief backoff before retrying a 429 whose body mentions a metric-quota
/// condition but is not hard-exhausted (spec.md §4.6). `None` means retry
/// immediately.
pub fn backoff_delay(error: &ProxyError, streaming: bool) -> Option<Duration> {
    let ProxyError::UpstreamStatus { status, body } = error else {
        return None;
    };
    if *status != 429 || is_hard_quota_exhausted(body) || !mentions_quota_metric(body) {
        return None;
    }
    Some(if streaming {
        Duration::from_millis(1000)
    } else {
        Duration::from_millis(500)
    })
}

/// True when `user_agent` identifies the cherry-client (spec.md §4.6): its
/// heartbeats must never carry `thought:true`.
pub fn is_cherry_client(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| ua.contains(CHERRY_CLIENT_MARKER))
}

/// Whether the next heartbeat event should be marked `thought:true`
/// (spec.md §4.6): only while thoughts have not finished and the client is
/// not the cherry-client.
pub fn heartbeat_should_mark_thought(thought_finished: bool, is_cherry_client: bool) -> bool {
    !thought_finished && !is_cherry_client
}

/// Build an empty-text heartbeat event, used to defeat idle timers while the
/// response is open (spec.md §4.6).
pub fn build_heartbeat_event(mark_thought: bool) -> Value {
    let part = if mark_thought {
        json!({"text": "", "thought": true})
    } else {
        json!({"text": ""})
    };
    json!({
        "candidates": [{
            "content": { "parts": [part], "role": "model" },
            "index": 0,
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RetryBudgets;

    fn test_config(budgets: RetryBudgets) -> Config {
        Config {
            upstream_url_base: "https://example.test".to_string(),
            port: 0,
            debug_mode: false,
            retry_budgets: budgets,
            fatal_status_codes: Vec::new(),
            thought_prelude: "prelude".to_string(),
        }
    }

    #[test]
    fn completion_predicate_requires_begin_and_finished() {
        assert!(is_response_complete(true, true, true, "gemini-2.5-pro"));
        assert!(!is_response_complete(false, true, true, "gemini-2.5-pro"));
        assert!(!is_response_complete(true, true, false, "gemini-2.5-pro"));
    }

    #[test]
    fn completion_predicate_lite_class_exempt_from_finished() {
        assert!(is_response_complete(true, true, false, "gemini-2.5-flash-lite"));
    }

    #[test]
    fn completion_predicate_no_begin_injection_requires_only_finished() {
        assert!(is_response_complete(false, false, true, "gemini-2.5-pro"));
        assert!(!is_response_complete(false, false, false, "gemini-2.5-pro"));
    }

    #[test]
    fn budget_tracker_exhausts_after_limit() {
        let config = test_config(RetryBudgets {
            max_retries: 2,
            max_fetch_retries: 1,
            max_non_retryable_status_retries: 1,
        });
        let mut tracker = RetryBudgetTracker::new();
        assert_eq!(tracker.consume(ErrorClass::Retryable, &config), RetryDecision::Retry);
        assert_eq!(tracker.consume(ErrorClass::Retryable, &config), RetryDecision::Retry);
        assert_eq!(tracker.consume(ErrorClass::Retryable, &config), RetryDecision::Exhausted);
    }

    #[test]
    fn budget_tracker_tracks_classes_independently() {
        let config = test_config(RetryBudgets {
            max_retries: 1,
            max_fetch_retries: 1,
            max_non_retryable_status_retries: 1,
        });
        let mut tracker = RetryBudgetTracker::new();
        assert_eq!(tracker.consume(ErrorClass::Retryable, &config), RetryDecision::Retry);
        assert_eq!(tracker.consume(ErrorClass::Network, &config), RetryDecision::Retry);
        assert_eq!(
            tracker.consume(ErrorClass::NonRetryableStatus, &config),
            RetryDecision::Retry
        );
    }

    #[test]
    fn fatal_class_never_gets_a_slot() {
        let config = test_config(RetryBudgets {
            max_retries: 100,
            max_fetch_retries: 100,
            max_non_retryable_status_retries: 100,
        });
        let mut tracker = RetryBudgetTracker::new();
        assert_eq!(tracker.consume(ErrorClass::Fatal, &config), RetryDecision::Exhausted);
    }

    #[test]
    fn backoff_applies_only_to_metric_quota_429() {
        let err = ProxyError::UpstreamStatus {
            status: 429,
            body: "per-minute quota exceeded".to_string(),
        };
        assert_eq!(backoff_delay(&err, true), Some(Duration::from_millis(1000)));
        assert_eq!(backoff_delay(&err, false), Some(Duration::from_millis(500)));
    }

    #[test]
    fn backoff_skipped_on_hard_quota_exhaustion() {
        let err = ProxyError::UpstreamStatus {
            status: 429,
            body: "\"quota_limit_value\":\"0\"".to_string(),
        };
        assert_eq!(backoff_delay(&err, true), None);
    }

    #[test]
    fn backoff_skipped_for_non_429() {
        let err = ProxyError::UpstreamStatus {
            status: 500,
            body: "quota".to_string(),
        };
        assert_eq!(backoff_delay(&err, true), None);
    }

    #[test]
    fn cherry_client_detected_by_user_agent_substring() {
        assert!(is_cherry_client(Some("CherryStudio/1.2.3")));
        assert!(!is_cherry_client(Some("curl/8.0")));
        assert!(!is_cherry_client(None));
    }

    #[test]
    fn heartbeat_thought_policy() {
        assert!(heartbeat_should_mark_thought(false, false));
        assert!(!heartbeat_should_mark_thought(true, false));
        assert!(!heartbeat_should_mark_thought(false, true));
    }

    #[test]
    fn heartbeat_event_shape() {
        let ev = build_heartbeat_event(true);
        assert_eq!(ev["candidates"][0]["content"]["parts"][0]["thought"], true);
        let ev2 = build_heartbeat_event(false);
        assert!(ev2["candidates"][0]["content"]["parts"][0].get("thought").is_none());
    }
}
