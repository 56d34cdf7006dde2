//! Stream state machine (spec.md §4.5): tracks the thought/transition/
//! formal/passthrough phases, detects the `BEGIN` sentinel across event
//! boundaries, and detects ghost loops.

use std::collections::VecDeque;

use serde_json::Value;

use crate::protocol::BEGIN;
use crate::sse::ParsedParts;

/// How many of the most-recently-seen, not-yet-classified event texts are
/// retained for cross-event `BEGIN` detection (spec.md: "split across 1, 2,
/// or 3 consecutive events" — this event plus up to 2 predecessors).
const MAX_HISTORY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Thought,
    Formal,
    Passthrough,
}

/// Per-request state, shared across retry attempts (spec.md §3).
pub struct RequestState {
    pub inject_begin: bool,
    pub include_thoughts: bool,
    pub thought_finished: bool,
    pub current_request_body: Value,
    pub attempts: u32,
}

impl RequestState {
    pub fn new(inject_begin: bool, include_thoughts: bool, initial_body: Value) -> Self {
        Self {
            inject_begin,
            include_thoughts,
            thought_finished: false,
            current_request_body: initial_body,
            attempts: 0,
        }
    }
}

/// Per-attempt state (lifetime = one upstream call), spec.md §3.
pub struct AttemptState {
    pub has_got_begin_token: bool,
    pub passthrough_mode: bool,
    pub has_function_call_in_stream: bool,
    /// Formal text already emitted to the client in this attempt (spec.md
    /// §3). Callers must grow this only by the text of lines the lookahead
    /// forwarder actually drains — never by text still sitting in its
    /// withheld tail — so continuation assembly never re-requests content
    /// the client has not seen.
    pub accumulated_text_this_attempt: String,
    pub is_first_data: bool,
    pub is_first_output: bool,
    history: VecDeque<String>,
}

impl Default for AttemptState {
    fn default() -> Self {
        Self {
            has_got_begin_token: false,
            passthrough_mode: false,
            has_function_call_in_stream: false,
            accumulated_text_this_attempt: String::new(),
            is_first_data: true,
            is_first_output: true,
            history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, req: &RequestState) -> Phase {
        if self.passthrough_mode {
            Phase::Passthrough
        } else if !req.inject_begin || self.has_got_begin_token {
            Phase::Formal
        } else {
            Phase::Thought
        }
    }

    fn push_history(&mut self, candidate: String) {
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(candidate);
    }
}

/// What the caller should do with one decoded upstream event.
pub enum EventOutcome {
    /// Nothing to forward — a garbage thought-only frame, an empty event,
    /// or a still-unresolved begin-detection candidate held internally.
    Dropped,
    /// Emit immediately as a `thought:true` event.
    Thought(String),
    /// Feed into the lookahead forwarder.
    Formal {
        template: Value,
        text: String,
        is_transition_line: bool,
    },
    /// The model emitted `BEGIN` as its very first output with no thought
    /// stage — abandon this attempt and restart it from scratch.
    AbandonPrematureBegin,
    /// First function-call observation: flush buffers, forward this event's
    /// raw payload unmodified, and enter sticky passthrough.
    EnterPassthrough { raw_event_data: String },
    /// Already in passthrough — forward raw bytes unmodified.
    PassthroughRaw { raw_event_data: String },
}

/// Process one decoded event and return the resulting outcome(s), mutating
/// `attempt` and `req` as the state machine advances.
pub fn process_event(
    attempt: &mut AttemptState,
    req: &mut RequestState,
    raw_event_data: &str,
    event: &Value,
    parts: &ParsedParts,
) -> Vec<EventOutcome> {
    attempt.is_first_data = false;

    if attempt.passthrough_mode {
        return vec![EventOutcome::PassthroughRaw {
            raw_event_data: raw_event_data.to_string(),
        }];
    }

    if parts.has_function_call {
        attempt.passthrough_mode = true;
        attempt.has_function_call_in_stream = true;
        attempt.is_first_output = false;
        return vec![EventOutcome::EnterPassthrough {
            raw_event_data: raw_event_data.to_string(),
        }];
    }

    if !req.inject_begin || attempt.has_got_begin_token {
        return formal_outcome(attempt, event, parts);
    }

    // Thought phase: looking for BEGIN. `was_first_output` captures whether
    // this is the very first event of the attempt, before any branch below
    // consumes that fact.
    let was_first_output = attempt.is_first_output;
    attempt.is_first_output = false;

    if parts.is_thought_only() {
        return vec![EventOutcome::Dropped];
    }

    if parts.response_text.is_empty() {
        return vec![EventOutcome::Dropped];
    }

    let candidate = parts.response_text.clone();
    let history: Vec<String> = attempt.history.iter().cloned().collect();

    for take in 0..=history.len().min(MAX_HISTORY) {
        let prefix_start = history.len() - take;
        let prefix: String = history[prefix_start..].concat();
        let concatenation = format!("{prefix}{candidate}");

        if let Some(begin_pos) = find_begin_with_guard(&concatenation) {
            let thought_prefix = concatenation[..begin_pos].to_string();
            let formal_suffix = concatenation[begin_pos + BEGIN.len()..].to_string();

            if was_first_output && thought_prefix.trim().is_empty() {
                return vec![EventOutcome::AbandonPrematureBegin];
            }

            for _ in 0..take {
                attempt.history.pop_back();
            }
            attempt.has_got_begin_token = true;
            req.thought_finished = true;

            let mut outcomes = Vec::new();
            if !thought_prefix.is_empty() {
                outcomes.push(EventOutcome::Thought(thought_prefix));
            }
            outcomes.push(EventOutcome::Formal {
                template: event.clone(),
                text: formal_suffix,
                is_transition_line: true,
            });
            return outcomes;
        }
    }

    attempt.push_history(candidate);
    vec![EventOutcome::Dropped]
}

fn formal_outcome(attempt: &mut AttemptState, event: &Value, parts: &ParsedParts) -> Vec<EventOutcome> {
    attempt.is_first_output = false;
    if parts.response_text.is_empty() {
        return vec![EventOutcome::Dropped];
    }
    vec![EventOutcome::Formal {
        template: event.clone(),
        text: parts.response_text.clone(),
        is_transition_line: false,
    }]
}

/// Find the first occurrence of `BEGIN` in `s` that is not immediately
/// preceded by a backtick (spec.md §4.5's fenced-code-block guard). Also
/// used by the non-streaming adapter's single-part variant of the same
/// search (spec.md §4.8).
pub(crate) fn find_begin_with_guard(s: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = s[start..].find(BEGIN) {
        let pos = start + rel;
        let preceded_by_backtick = pos > 0 && s.as_bytes()[pos - 1] == b'`';
        if !preceded_by_backtick {
            return Some(pos);
        }
        start = pos + 1;
    }
    None
}

/// Ghost-loop detection (spec.md §4.5): the model has entered a repetition
/// loop if the combined emitted-plus-buffered text contains the
/// thought-prelude string twice or more.
pub fn detect_ghost_loop(
    accumulated_text_this_attempt: &str,
    buffered_text: &str,
    thought_prelude: &str,
) -> bool {
    if thought_prelude.is_empty() {
        return false;
    }
    let combined = format!("{accumulated_text_this_attempt}{buffered_text}");
    count_occurrences(&combined, thought_prelude) >= 2
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut start = 0;
    while let Some(rel) = haystack[start..].find(needle) {
        count += 1;
        start += rel + needle.len();
    }
    count
}
