//! Axum server setup and router construction.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::{get, post};
use docweave::bridge::SweeperHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::ws;

/// Build the full axum router.
///
/// - WebSocket at `/ws`
/// - REST API at `/api/*`
/// - Optional static files
pub fn build_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    // Hosts embedding the client usually run on another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/tool-result", post(api::post_tool_result))
        .route("/api/state", get(api::get_state))
        .route("/api/logs", get(api::get_logs))
        .with_state(state)
        .layer(cors);

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
}

/// Bind, start serving on a background task, and return the bound address.
/// The sweeper is dropped (and stopped) when the server exits.
pub async fn start_server(router: Router, bind_addr: SocketAddr, sweeper: SweeperHandle) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "Web server listening");

    tokio::spawn(async move {
        let _sweeper = sweeper;
        if let Err(e) = axum::serve(listener, router).await {
            error!("Web server stopped: {e}");
        }
    });

    Ok(addr)
}
