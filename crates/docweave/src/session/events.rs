//! Events a session emits on its outbound stream, and the token meter they
//! report.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::ToolCallEvent;
use crate::error::DocError;

/// Cumulative token usage of one session, split by where it was spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Transcript sent at the start of each turn.
    pub input: usize,
    /// Text generated by the model.
    pub output: usize,
    /// Tool-call arguments generated by the model.
    pub tool_calls: usize,
    /// Tool results appended to the transcript.
    pub tool_responses: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input + self.output + self.tool_calls + self.tool_responses
    }
}

/// One item on a session's outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// Incremental model text.
    Content { delta: String },
    /// A host-bound tool call awaiting a correlated result.
    ToolUse {
        id: String,
        tool: String,
        payload: Value,
    },
    /// The turn finished.
    Complete { usage: TokenUsage, budget_used: f64 },
    /// The turn ended early.
    Error { code: String, message: String },
}

impl SessionEvent {
    pub fn error(err: &DocError) -> Self {
        SessionEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Complete { .. } | SessionEvent::Error { .. })
    }
}

impl From<&ToolCallEvent> for SessionEvent {
    fn from(call: &ToolCallEvent) -> Self {
        SessionEvent::ToolUse {
            id: call.id.clone(),
            tool: call.tool.clone(),
            payload: call.payload.clone(),
        }
    }
}
