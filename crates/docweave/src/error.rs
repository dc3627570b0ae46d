//! Error taxonomy shared by the document, bridge, and session layers.
//!
//! Tool-level failures ([`DocError::ToolTimeout`], [`DocError::HitStale`],
//! [`DocError::InvalidQuery`]) are handed back to the model as ordinary
//! failed tool results. Session-level failures ([`DocError::BudgetExceeded`],
//! [`DocError::ChannelClosed`], [`DocError::Model`]) end the turn with an
//! `error` event.

use crate::document::patch::ResolveFailure;

/// Error type for document, bridge, and session operations.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    /// No correlated result arrived before the deadline.
    #[error("tool '{tool}' (call {id}) timed out after {waited_ms}ms")]
    ToolTimeout {
        id: String,
        tool: String,
        waited_ms: u64,
    },

    /// Re-confirmation of a previously found match failed.
    #[error("hit {hit_id} is stale ({reason}); search again before patching")]
    HitStale {
        hit_id: String,
        reason: ResolveFailure,
    },

    /// An operation assumed a snapshot version that is no longer current.
    #[error("snapshot v{requested} is stale (current is v{current}); take a new snapshot")]
    SnapshotStale { requested: u64, current: u64 },

    /// Pre-flight token estimate is over the effective budget.
    #[error("context budget exceeded: ~{estimated} tokens estimated, {budget} allowed")]
    BudgetExceeded { estimated: usize, budget: usize },

    /// The host tree could not be turned into a UDV.
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Empty-after-parse or unparseable search input.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Request payload did not match the operation's shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A second waiter was registered for an id that already has one.
    #[error("a waiter is already registered for call id {0}")]
    DuplicateCallId(String),

    /// The session's outbound channel is gone.
    #[error("session channel closed: {0}")]
    ChannelClosed(String),

    /// The language-model backend failed.
    #[error("model error: {0}")]
    Model(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DocError {
    /// Stable machine-readable code for wire payloads.
    pub fn code(&self) -> &'static str {
        match self {
            DocError::ToolTimeout { .. } => "TOOL_TIMEOUT",
            DocError::HitStale { .. } => "HIT_STALE",
            DocError::SnapshotStale { .. } => "SNAPSHOT_STALE",
            DocError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            DocError::MalformedDocument(_) => "MALFORMED_DOCUMENT",
            DocError::InvalidQuery(_) => "INVALID_QUERY",
            DocError::InvalidRequest(_) => "INVALID_REQUEST",
            DocError::DuplicateCallId(_) => "DUPLICATE_CALL_ID",
            DocError::ChannelClosed(_) => "CHANNEL_CLOSED",
            DocError::Model(_) => "MODEL_ERROR",
            DocError::Io(_) => "IO_ERROR",
            DocError::Serde(_) => "SERDE_ERROR",
        }
    }

    /// Whether the agent can adapt to this failure within the same turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DocError::ToolTimeout { .. }
                | DocError::HitStale { .. }
                | DocError::SnapshotStale { .. }
                | DocError::InvalidQuery(_)
                | DocError::InvalidRequest(_)
        )
    }
}

/// Result type for document, bridge, and session operations.
pub type Result<T> = std::result::Result<T, DocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = DocError::HitStale {
            hit_id: "h1-0".into(),
            reason: ResolveFailure::SubstringDrift,
        };
        assert_eq!(err.code(), "HIT_STALE");
        assert!(err.to_string().contains("h1-0"));
        assert!(err.to_string().contains("substring drift"));
    }

    #[test]
    fn session_level_errors_are_not_recoverable() {
        let budget = DocError::BudgetExceeded {
            estimated: 10,
            budget: 5,
        };
        assert!(!budget.is_recoverable());
        assert!(!DocError::ChannelClosed("gone".into()).is_recoverable());

        let timeout = DocError::ToolTimeout {
            id: "t1".into(),
            tool: "doc_search".into(),
            waited_ms: 100,
        };
        assert!(timeout.is_recoverable());
    }
}
