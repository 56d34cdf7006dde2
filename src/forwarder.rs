//! Lookahead-buffered forwarder (spec.md §4.4): withholds the last
//! `LOOKAHEAD` characters of formal text so a completed `FINISHED` sentinel
//! can never reach the client.

use std::collections::VecDeque;

use serde_json::Value;

use crate::protocol::FINISHED;

/// `len(FINISHED) + 4` — the trailing window that is always withheld.
pub const LOOKAHEAD: usize = FINISHED.len() + 4;

/// One formal-text event awaiting forwarding.
#[derive(Debug, Clone)]
pub struct BufferedLine {
    /// The upstream event this text came from, kept as a re-encoding
    /// template (preserves index/safety-ratings/etc. metadata).
    pub template: Value,
    /// True for the single event that contained the `BEGIN` transition.
    pub is_transition_line: bool,
    /// The formal-text contribution of this event.
    pub text: String,
}

/// Buffers formal text so that an end-sentinel split across chunk
/// boundaries is never partially visible to the client.
#[derive(Debug, Default)]
pub struct LookaheadForwarder {
    text_buffer: String,
    lines_buffer: VecDeque<BufferedLine>,
}

impl LookaheadForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length of text not yet safe to emit.
    pub fn buffered_len(&self) -> usize {
        self.text_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines_buffer.is_empty()
    }

    /// The not-yet-emitted formal text, concatenated in order.
    pub fn buffered_text(&self) -> &str {
        &self.text_buffer
    }

    /// Ingest one formal-text event.
    pub fn ingest(&mut self, template: Value, text: String, is_transition_line: bool) {
        self.text_buffer.push_str(&text);
        self.lines_buffer.push_back(BufferedLine {
            template,
            is_transition_line,
            text,
        });
    }

    /// Emit every buffered line whose text fully fits ahead of the
    /// lookahead window, per spec.md §4.4: "while textBuffer.length >
    /// LOOKAHEAD and linesBuffer non-empty: peek the head line; if its text
    /// fully fits within textBuffer.length - LOOKAHEAD, emit it and move
    /// that many characters out of textBuffer; else stop."
    pub fn drain_emittable(&mut self) -> Vec<BufferedLine> {
        let mut emitted = Vec::new();
        while self.text_buffer.len() > LOOKAHEAD {
            let Some(head) = self.lines_buffer.front() else {
                break;
            };
            let available = self.text_buffer.len() - LOOKAHEAD;
            if head.text.len() > available {
                break;
            }
            let line = self.lines_buffer.pop_front().expect("front checked above");
            debug_assert!(self.text_buffer.is_char_boundary(line.text.len()));
            self.text_buffer.drain(0..line.text.len());
            emitted.push(line);
        }
        emitted
    }

    /// Unconditionally drain every buffered line, e.g. on stream end or on
    /// the function-call transition. Clears all buffered state.
    pub fn take_all(&mut self) -> Vec<BufferedLine> {
        self.text_buffer.clear();
        self.lines_buffer.drain(..).collect()
    }
}

/// Strip a trailing fragment of `text` that is a proper prefix of
/// `FINISHED`, i.e. a partial sentinel the model was in the middle of
/// emitting when passthrough/flush preempted it. UTF-8 safe.
pub fn strip_trailing_partial_sentinel(text: &str) -> String {
    let n = text.len();
    let max_check = FINISHED.len().min(n);
    for len in (1..=max_check).rev() {
        let start = n - len;
        if !text.is_char_boundary(start) {
            continue;
        }
        let suffix = &text[start..];
        if FINISHED.starts_with(suffix) {
            return text[..start].to_string();
        }
    }
    text.to_string()
}
