//! Character-ratio token estimation.
//!
//! Exact tokenization depends on the model; a chars-per-token ratio is close
//! enough for budgeting and is the same everywhere in the crate, so pre-flight
//! checks, compaction decisions, and session metering agree with each other.

use crate::{Message, ToolDef};
use serde_json::Value;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed per-message cost for role markers and framing.
pub const DEFAULT_MESSAGE_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct TokenAccountant {
    chars_per_token: f64,
    message_overhead: usize,
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            message_overhead: DEFAULT_MESSAGE_OVERHEAD,
        }
    }
}

impl TokenAccountant {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 {
                chars_per_token
            } else {
                DEFAULT_CHARS_PER_TOKEN
            },
            ..Default::default()
        }
    }

    pub fn with_message_overhead(mut self, tokens: usize) -> Self {
        self.message_overhead = tokens;
        self
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    pub fn text(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    pub fn json(&self, value: &Value) -> usize {
        self.text(&value.to_string())
    }

    /// Content, tool-call names and arguments, plus framing overhead.
    pub fn message(&self, msg: &Message) -> usize {
        let mut tokens = self.message_overhead;
        if let Some(content) = &msg.content {
            tokens += self.text(content);
        }
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                tokens += self.text(&call.function.name) + self.text(&call.function.arguments);
            }
        }
        tokens
    }

    pub fn messages(&self, msgs: &[Message]) -> usize {
        msgs.iter().map(|m| self.message(m)).sum()
    }

    /// Schema cost of the tool definitions sent with every request.
    pub fn tools(&self, defs: &[ToolDef]) -> usize {
        defs.iter()
            .map(|d| serde_json::to_string(d).map_or(0, |s| self.text(&s)))
            .sum()
    }
}
