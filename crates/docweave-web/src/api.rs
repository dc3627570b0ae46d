//! REST endpoint handlers.
//!
//! `POST /api/tool-result` is the side channel for hosts that answer tool
//! calls out of band from the socket that issued them.

use std::sync::{Arc, Mutex};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use docweave::bridge::{ToolBridge, ToolResultEvent};
use docweave::config::DocAgentConfig;
use docweave::document::DocumentExecutor;
use docweave::logging::{LogBuffer, LogLevel, LogLine};
use docweave::session::ModelBackend;
use serde::Deserialize;
use tracing::debug;

use crate::snapshot::BridgeSnapshot;

/// Default number of lines returned by `GET /api/logs`.
const DEFAULT_LOG_LIMIT: usize = 200;

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn ModelBackend>,
    pub bridge: Arc<ToolBridge>,
    /// Template for every session started on this server.
    pub config: DocAgentConfig,
    /// When set, document tools are answered here instead of by the client.
    pub executor: Option<Arc<Mutex<DocumentExecutor>>>,
    pub logs: LogBuffer,
}

impl AppState {
    pub fn new(model: Arc<dyn ModelBackend>, bridge: Arc<ToolBridge>, config: DocAgentConfig) -> Self {
        Self {
            model,
            bridge,
            config,
            executor: None,
            logs: LogBuffer::default(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<Mutex<DocumentExecutor>>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_logs(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }
}

/// POST /api/tool-result: deliver a result to its waiting call.
///
/// 204 when a waiter took it, 410 when none exists (unknown id, already
/// resolved, or timed out).
pub async fn post_tool_result(State(app): State<AppState>, Json(result): Json<ToolResultEvent>) -> StatusCode {
    let id = result.id.clone();
    if app.bridge.resolve(result) {
        StatusCode::NO_CONTENT
    } else {
        debug!(id, "Tool result arrived with no waiter");
        StatusCode::GONE
    }
}

/// GET /api/state: pending calls and registered listeners.
pub async fn get_state(State(app): State<AppState>) -> Json<BridgeSnapshot> {
    Json(BridgeSnapshot::from_bridge(&app.bridge))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub level: Option<LogLevel>,
}

/// GET /api/logs: the newest captured log lines, oldest first.
pub async fn get_logs(State(app): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Vec<LogLine>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let level = query.level.unwrap_or(LogLevel::Debug);
    Json(app.logs.recent(limit, level))
}
