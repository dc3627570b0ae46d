//! Canonical tool names.
//!
//! Tool-name string literals across the crate reference these constants.

/// Flattened outline of the whole document.
pub const DOC_SNAPSHOT: &str = "doc_snapshot";
/// Literal or pattern search returning hit ids.
pub const DOC_SEARCH: &str = "doc_search";
/// Replace, insert, or comment by hit id.
pub const DOC_PATCH: &str = "doc_patch";

pub const PLAN: &str = "plan";
pub const STATUS: &str = "status";
pub const THINK: &str = "think";

/// Tools answered by the document host through the bridge.
pub const DOCUMENT_TOOLS: [&str; 3] = [DOC_SNAPSHOT, DOC_SEARCH, DOC_PATCH];

pub fn is_document_tool(name: &str) -> bool {
    DOCUMENT_TOOLS.contains(&name)
}
