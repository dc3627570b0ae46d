//! WebSocket session server for docweave agents.
//!
//! `docweave-web` exposes one [`SessionController`](docweave::session::SessionController)
//! per WebSocket connection and the inbound tool-result side channel over
//! REST. The document itself normally lives in the client: the server sends
//! `tool_use` events and the client answers with `tool_result` messages (or
//! `POST /api/tool-result`). When an executor is attached with
//! [`AppState::with_executor`], the server answers document tools itself and
//! the client only observes.
//!
//! # Quick start
//!
//! ```ignore
//! use docweave::prelude::*;
//! use docweave_web::{AppState, WebConfig, spawn_web};
//!
//! let config = DocAgentConfig::default();
//! let bridge = Arc::new(ToolBridge::new().with_timeout(config.call_timeout));
//! let model = OpenRouterBackend::new(OpenRouterClient::new(key)?);
//! let state = AppState::new(Arc::new(model), bridge, config);
//! let addr = spawn_web(state, WebConfig::default()).await?;
//! println!("ws://{addr}/ws");
//! ```
//!
//! # Protocol
//!
//! ```text
//! client ── {"type":"chat","message":..} ──────────────▶ /ws ──▶ run_turn
//! client ◀── {"type":"ready"} / session events ───────── /ws
//! client ── {"type":"tool_result","id":..,"ok":..} ───▶ /ws ──▶ ToolBridge::resolve
//!        ── POST /api/tool-result ──────────────────────────────▶ ToolBridge::resolve
//! ```

mod api;
mod server;
pub mod snapshot;
mod ws;

pub use api::AppState;
pub use snapshot::{BridgeSnapshot, PendingCallView};

use std::net::SocketAddr;
use std::path::PathBuf;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:3001`.
    pub bind_addr: SocketAddr,
    /// Directory of static files served at `/`. If `None`, only API and WS
    /// endpoints are served.
    pub static_dir: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            static_dir: None,
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// Also starts the bridge sweeper with the session config's interval and
/// stale threshold; it stops with the server.
pub async fn spawn_web(state: AppState, config: WebConfig) -> std::io::Result<SocketAddr> {
    let sweeper = state
        .bridge
        .spawn_sweeper(state.config.sweep_interval, state.config.stale_call_after);
    let router = server::build_router(state, config.static_dir);
    server::start_server(router, config.bind_addr, sweeper).await
}
