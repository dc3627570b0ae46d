//! Tools the agent can call.
//!
//! Every capability is a [`Tool`] implementor collected into a [`ToolSet`],
//! which handles dispatch, argument validation, timeouts, and truncation.
//!
//! - [`core`]: [`Tool`] trait, [`ToolSet`], [`ThinkTool`], argument helpers.
//! - [`document`]: `doc_snapshot`, `doc_search`, `doc_patch`, answered by the
//!   host through the [`ToolBridge`](crate::bridge::ToolBridge).
//! - [`plan`]: `plan` and `status` over shared working memory.
//! - [`spec`]: [`ToolSpec`](spec::ToolSpec) structured descriptions.
//! - [`names`]: canonical tool names.

pub mod core;
pub mod document;
pub mod names;
pub mod plan;
pub mod spec;

pub use core::{
    DEFAULT_MAX_RESULT_BYTES, ThinkTool, Tool, ToolFuture, ToolSet, parse_tool_args, truncate_result,
    validate_tool_arguments,
};
pub use document::{BridgedTool, DocumentToolKind, render_snapshot};
pub use plan::{PlanTool, StatusTool};
pub use spec::ToolSpec;
