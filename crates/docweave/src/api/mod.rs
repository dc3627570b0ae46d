//! Model-facing plumbing between a session and the OpenRouter API.
//!
//! - [`retry`]: transient error detection and exponential backoff.
//! - [`streaming`]: SSE parsing into [`StreamEvent`](streaming::StreamEvent)s
//!   and reassembly of streamed tool calls.
//! - [`tracing`]: trace, span, and call id generation.

pub mod retry;
pub mod streaming;
pub mod tracing;

pub use retry::{RetryConfig, retry_api_call};
pub use streaming::{StreamEvent, assemble_tool_calls};
pub use tracing::{generate_call_id, generate_span_id, generate_trace_id};
