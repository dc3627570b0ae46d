//! Document tools: `doc_snapshot`, `doc_search`, `doc_patch`.
//!
//! None of these run in process. Each call becomes a `{ id, tool, payload }`
//! event on the session's outbound stream via the [`ToolBridge`], and the
//! correlated result coming back from the host is what the model sees.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::ToolDef;
use crate::bridge::{ToolBridge, ToolResultEvent};
use crate::document::executor::SearchPayload;
use crate::document::patch::{PatchRequest, SENTINEL_END, SENTINEL_START};
use crate::document::search::SearchMode;
use crate::document::udv::Udv;
use crate::tools::core::{Tool, ToolFuture, ToolSet, parse_tool_args};
use crate::tools::names;
use crate::tools::spec::ToolSpec;

// ── Arguments ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct DocSnapshotArgs {}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SearchModeArg {
    /// Every query token must appear in the paragraph or cell.
    Literal,
    /// Regular expression; each match is its own hit.
    Pattern,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DocSearchArgs {
    /// Words to find (literal) or a regular expression (pattern).
    pub query: String,
    #[serde(default)]
    pub mode: Option<SearchModeArg>,
    #[serde(default)]
    pub max_hits: Option<usize>,
    #[serde(default)]
    pub case_insensitive: Option<bool>,
    /// Fail instead of searching if the document changed since this version.
    #[serde(default)]
    pub snapshot_version: Option<u64>,
}

impl DocSearchArgs {
    pub fn into_payload(self) -> SearchPayload {
        SearchPayload {
            query: self.query,
            mode: self.mode.map(|m| match m {
                SearchModeArg::Literal => SearchMode::Literal,
                SearchModeArg::Pattern => SearchMode::Pattern,
            }),
            max_hits: self.max_hits,
            case_insensitive: self.case_insensitive,
            snapshot_version: self.snapshot_version,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Replace the hit's exact span.
    Replace,
    /// Insert text immediately before the span.
    InsertBefore,
    /// Insert text immediately after the span.
    InsertAfter,
    /// Attach a comment to the span.
    Comment,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DocPatchArgs {
    pub op: PatchOp,
    /// A hit id from the latest doc_search, or doc:start / doc:end.
    pub hit_id: String,
    /// Replacement, inserted text, or comment body.
    pub text: String,
}

impl DocPatchArgs {
    pub fn into_request(self) -> PatchRequest {
        let DocPatchArgs { op, hit_id, text } = self;
        match op {
            PatchOp::Replace => PatchRequest::ReplaceByHitId { hit_id, new_text: text },
            PatchOp::InsertBefore => PatchRequest::InsertBeforeHitId { hit_id, new_text: text },
            PatchOp::InsertAfter => PatchRequest::InsertAfterHitId { hit_id, new_text: text },
            PatchOp::Comment => PatchRequest::CommentByHitId { hit_id, comment: text },
        }
    }
}

// ── BridgedTool ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentToolKind {
    Snapshot,
    Search,
    Patch,
}

impl DocumentToolKind {
    pub fn name(self) -> &'static str {
        match self {
            DocumentToolKind::Snapshot => names::DOC_SNAPSHOT,
            DocumentToolKind::Search => names::DOC_SEARCH,
            DocumentToolKind::Patch => names::DOC_PATCH,
        }
    }

    fn spec(self) -> ToolSpec {
        match self {
            DocumentToolKind::Snapshot => ToolSpec::builder(names::DOC_SNAPSHOT)
                .purpose("Read a flattened outline of the whole document, one line per paragraph or table cell")
                .when_to_use("Once at the start, to learn the document's structure and block ids")
                .when_not_to_use("To find specific text; use doc_search, which is far cheaper")
                .parameters_for::<DocSnapshotArgs>()
                .output_format("Header with the snapshot version, then `[block_id] text` lines")
                .build(),
            DocumentToolKind::Search => ToolSpec::builder(names::DOC_SEARCH)
                .purpose("Search the current document snapshot and return short excerpts with hit ids")
                .when_to_use("Before every patch: the hit id is the only way to address text")
                .when_not_to_use("To re-read the whole document; hits are enough to edit")
                .parameters_for::<DocSearchArgs>()
                .example(r#"doc_search(query="late fee")"#, "hits whose paragraph contains both words")
                .example(
                    r#"doc_search(query="\\$[0-9]+", mode="pattern")"#,
                    "one hit per dollar amount, spanning only the match",
                )
                .output_format("JSON: snapshotVersion, hits[{hitId, path, blockId, offsetStart, offsetEnd, excerpt}], totalHits, truncated")
                .disambiguate(
                    "A literal hit spans the whole paragraph",
                    names::DOC_SEARCH,
                    "use mode=pattern to target just the matched words",
                )
                .build(),
            DocumentToolKind::Patch => ToolSpec::builder(names::DOC_PATCH)
                .purpose("Edit the document at a hit: replace, insert before or after, or comment")
                .when_to_use("After doc_search returned the hit you want to change")
                .when_not_to_use(format!(
                    "With a guessed hit id. Use {SENTINEL_START} or {SENTINEL_END} to add a paragraph at the document edges"
                ))
                .parameters_for::<DocPatchArgs>()
                .example(r#"doc_patch(op="replace", hit_id="h3-0", text="$75")"#, "the span of h3-0 becomes $75")
                .output_format("JSON: hitId, stage, path, offsetStart, offsetEnd, hostRevision, commentId")
                .disambiguate(
                    "The patch fails with HIT_STALE",
                    names::DOC_SEARCH,
                    "the text moved or changed; search again for a fresh hit id",
                )
                .build(),
        }
    }
}

/// A document tool answered by the host through the [`ToolBridge`].
pub struct BridgedTool {
    kind: DocumentToolKind,
    session_id: String,
    bridge: Arc<ToolBridge>,
}

impl BridgedTool {
    pub fn new(kind: DocumentToolKind, session_id: impl Into<String>, bridge: Arc<ToolBridge>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            bridge,
        }
    }

    pub fn kind(&self) -> DocumentToolKind {
        self.kind
    }

    fn payload(&self, arguments: &str) -> Result<Value, String> {
        let value = match self.kind {
            DocumentToolKind::Snapshot => {
                parse_tool_args::<DocSnapshotArgs>(arguments)?;
                Value::Object(Default::default())
            }
            DocumentToolKind::Search => serde_json::to_value(parse_tool_args::<DocSearchArgs>(arguments)?.into_payload())
                .map_err(|e| format!("Error: {e}"))?,
            DocumentToolKind::Patch => serde_json::to_value(parse_tool_args::<DocPatchArgs>(arguments)?.into_request())
                .map_err(|e| format!("Error: {e}"))?,
        };
        Ok(value)
    }

    fn render(&self, result: &ToolResultEvent) -> String {
        if self.kind == DocumentToolKind::Snapshot
            && result.ok
            && let Some(data) = &result.data
            && let Ok(udv) = serde_json::from_value::<Udv>(data.clone())
        {
            return render_snapshot(&udv);
        }
        result.to_tool_output()
    }
}

/// Outline text for the model: version header plus one line per segment.
pub fn render_snapshot(udv: &Udv) -> String {
    format!(
        "Snapshot v{} ({} paragraphs, {} tables, {} cells)\n{}",
        udv.version,
        udv.meta.paragraph_count,
        udv.meta.table_count,
        udv.meta.cell_count,
        udv.outline()
    )
}

impl Tool for BridgedTool {
    fn definition(&self) -> ToolDef {
        self.kind.spec().to_tool_def()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let payload = self.payload(arguments);
        Box::pin(async move {
            let payload = match payload {
                Ok(p) => p,
                Err(e) => return e,
            };
            match self.bridge.invoke(&self.session_id, self.kind.name(), payload).await {
                Ok(result) => {
                    debug!(tool = self.kind.name(), ok = result.ok, "Bridged tool answered");
                    self.render(&result)
                }
                Err(e) => format!("Error: [{}] {e}", e.code()),
            }
        })
    }

    fn is_mutation(&self) -> bool {
        self.kind == DocumentToolKind::Patch
    }
}

impl ToolSet {
    /// Register the three bridged document tools for `session_id`.
    pub fn with_document_tools(self, session_id: &str, bridge: &Arc<ToolBridge>) -> Self {
        self.with(BridgedTool::new(DocumentToolKind::Snapshot, session_id, Arc::clone(bridge)))
            .with(BridgedTool::new(DocumentToolKind::Search, session_id, Arc::clone(bridge)))
            .with(BridgedTool::new(DocumentToolKind::Patch, session_id, Arc::clone(bridge)))
    }
}
