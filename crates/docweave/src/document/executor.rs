//! The document executor: the only component that mutates the host.
//!
//! Accepts `{ operation, payload }` requests and answers
//! `{ ok, data?, error?, code? }`. It owns the current snapshot and its
//! search index, rebuilding both lazily whenever the host revision has moved
//! since the last build, and keeps the hit registry that patches resolve
//! against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::host::DocumentHost;
use super::patch::{HitRegistry, PatchOutcome, PatchRequest, apply_patch};
use super::search::{SearchIndex, SearchMode, SearchOptions, SearchResult};
use super::udv::{Udv, build_udv};
use crate::bridge::{ToolCallEvent, ToolResultEvent};
use crate::error::{DocError, Result};
use crate::tools::names;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Snapshot,
    Search,
    Patch,
}

impl Operation {
    /// Map a document tool name to its executor operation.
    pub fn for_tool(tool: &str) -> Option<Self> {
        match tool {
            names::DOC_SNAPSHOT => Some(Operation::Snapshot),
            names::DOC_SEARCH => Some(Operation::Search),
            names::DOC_PATCH => Some(Operation::Patch),
            _ => None,
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            Operation::Snapshot => names::DOC_SNAPSHOT,
            Operation::Search => names::DOC_SEARCH,
            Operation::Patch => names::DOC_PATCH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRequest {
    pub operation: Operation,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ExecutorResponse {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn failure(err: &DocError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }
}

/// Payload of a `search` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SearchMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hits: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_insensitive: Option<bool>,
    /// Fail with `SnapshotStale` unless this is the current version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<u64>,
}

struct Snapshot {
    udv: Arc<Udv>,
    index: SearchIndex,
}

pub struct DocumentExecutor {
    host: Box<dyn DocumentHost>,
    current: Option<Snapshot>,
    last_version: u64,
    registry: HitRegistry,
    search_defaults: SearchOptions,
}

impl DocumentExecutor {
    pub fn new(host: impl DocumentHost + 'static) -> Self {
        Self {
            host: Box::new(host),
            current: None,
            last_version: 0,
            registry: HitRegistry::default(),
            search_defaults: SearchOptions::default(),
        }
    }

    pub fn with_search_defaults(mut self, opts: SearchOptions) -> Self {
        self.search_defaults = opts;
        self
    }

    pub fn with_hit_retention(mut self, snapshots: usize) -> Self {
        self.registry = HitRegistry::new(snapshots);
        self
    }

    pub fn host(&self) -> &dyn DocumentHost {
        self.host.as_ref()
    }

    /// Version of the snapshot currently held, if one has been built.
    pub fn current_version(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.udv.version)
    }

    /// Return the current snapshot, rebuilding it if the host has changed.
    fn fresh(&mut self) -> Result<&Snapshot> {
        let revision = self.host.revision();
        let stale = self
            .current
            .as_ref()
            .is_none_or(|s| s.udv.meta.host_revision != revision);
        if stale {
            let version = self.last_version + 1;
            let udv = build_udv(self.host.tree(), version, revision)?;
            let index = SearchIndex::build(&udv);
            info!(
                version,
                host_revision = revision,
                paragraphs = udv.meta.paragraph_count,
                tables = udv.meta.table_count,
                "Snapshot rebuilt"
            );
            self.last_version = version;
            self.current = Some(Snapshot {
                udv: Arc::new(udv),
                index,
            });
        }
        self.current
            .as_ref()
            .ok_or_else(|| DocError::MalformedDocument("no snapshot".into()))
    }

    pub fn snapshot(&mut self) -> Result<Arc<Udv>> {
        Ok(Arc::clone(&self.fresh()?.udv))
    }

    pub fn search(&mut self, payload: &SearchPayload) -> Result<SearchResult> {
        let mut opts = self.search_defaults.clone();
        if let Some(mode) = payload.mode {
            opts.mode = mode;
        }
        if let Some(n) = payload.max_hits {
            opts.max_hits = n;
        }
        if let Some(ci) = payload.case_insensitive {
            opts.case_insensitive = ci;
        }

        let snap = self.fresh()?;
        let current = snap.udv.version;
        if let Some(requested) = payload.snapshot_version
            && requested != current
        {
            return Err(DocError::SnapshotStale { requested, current });
        }
        let (result, stored) = snap.index.search(&payload.query, &opts)?;
        self.registry.record(stored);
        Ok(result)
    }

    pub fn patch(&mut self, req: &PatchRequest) -> Result<PatchOutcome> {
        apply_patch(self.host.as_mut(), &mut self.registry, req)
    }

    /// Execute one request and wrap the outcome in the wire envelope.
    pub fn handle(&mut self, req: ExecutorRequest) -> ExecutorResponse {
        debug!(operation = ?req.operation, "Executor request");
        match self.dispatch(req) {
            Ok(data) => ExecutorResponse::success(data),
            Err(e) => {
                debug!(code = e.code(), error = %e, "Executor request failed");
                ExecutorResponse::failure(&e)
            }
        }
    }

    fn dispatch(&mut self, req: ExecutorRequest) -> Result<Value> {
        match req.operation {
            Operation::Snapshot => Ok(serde_json::to_value(&*self.snapshot()?)?),
            Operation::Search => {
                let payload: SearchPayload = serde_json::from_value(req.payload)
                    .map_err(|e| DocError::InvalidRequest(format!("search payload: {e}")))?;
                Ok(serde_json::to_value(self.search(&payload)?)?)
            }
            Operation::Patch => {
                let patch: PatchRequest = serde_json::from_value(req.payload)
                    .map_err(|e| DocError::InvalidRequest(format!("patch payload: {e}")))?;
                Ok(serde_json::to_value(self.patch(&patch)?)?)
            }
        }
    }

    /// Execute a bridged tool call and answer with a correlated result.
    pub fn handle_tool_call(&mut self, call: &ToolCallEvent) -> ToolResultEvent {
        let response = match Operation::for_tool(&call.tool) {
            Some(operation) => self.handle(ExecutorRequest {
                operation,
                payload: call.payload.clone(),
            }),
            None => ExecutorResponse::failure(&DocError::InvalidRequest(format!(
                "unknown document tool '{}'",
                call.tool
            ))),
        };
        ToolResultEvent::from_response(&call.id, response)
    }
}
