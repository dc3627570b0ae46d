//! Convenience re-exports for common `docweave` types.
//!
//! ```ignore
//! use docweave::prelude::*;
//! ```
//!
//! Covers what a host integration usually needs: the client and model
//! backends, the bridge, the session controller and its events, the
//! document executor, and the tool set. Lower-level pieces (search index,
//! hit registry, compaction helpers) stay in their modules.

pub use std::sync::Arc;

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatRequest, DocError, Message, OpenRouterClient, ToolCall, ToolDef, json_schema_for};

// ── Config ──────────────────────────────────────────────────────────
pub use crate::config::DocAgentConfig;

// ── Sessions ────────────────────────────────────────────────────────
pub use crate::session::{
    ModelBackend, OpenRouterBackend, ScriptedModel, ScriptedTurn, SessionController, SessionDeps, SessionEvent,
    TokenUsage, TurnResult,
};

// ── Bridge ──────────────────────────────────────────────────────────
pub use crate::bridge::{ToolBridge, ToolCallEvent, ToolResultEvent};

// ── Document ────────────────────────────────────────────────────────
pub use crate::document::{
    DocumentExecutor, DocumentHost, HostDocument, InMemoryDocument, PatchRequest, SearchMode, SearchOptions,
};

// ── Context and memory ──────────────────────────────────────────────
pub use crate::context::{ContextBudget, ContextManager};
pub use crate::memory::{MemoryStore, SharedMemory, WorkingMemory};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::spec::ToolSpec;
pub use crate::tools::{Tool, ToolFuture, ToolSet, parse_tool_args};

// ── Logging ─────────────────────────────────────────────────────────
pub use crate::logging::{LogBuffer, LogLayer, LogLevel, LogLine};
