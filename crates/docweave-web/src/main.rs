//! Serve docweave sessions over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run -p docweave-web
//! OPENROUTER_KEY=sk-... cargo run -p docweave-web -- --port 8080 --budget 60000
//! # Answer document tools from a local file instead of the client:
//! OPENROUTER_KEY=sk-... cargo run -p docweave-web -- --doc contract.json
//! ```
//!
//! Connect to `/ws` and send:
//! ```json
//! {"type": "chat", "message": "Rename every late fee to a service charge"}
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use docweave::prelude::*;
use docweave_web::{AppState, WebConfig, spawn_web};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(about = "WebSocket server for search-and-patch document sessions")]
struct Args {
    #[arg(long, default_value = docweave::DEFAULT_MODEL)]
    model: String,

    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Context budget in tokens.
    #[arg(long)]
    budget: Option<usize>,

    /// Per-call timeout for host-bound tools, in seconds.
    #[arg(long)]
    call_timeout: Option<u64>,

    /// Answer document tools from this JSON document on the server and
    /// write it back on shutdown.
    #[arg(long)]
    doc: Option<PathBuf>,

    /// Serve static files from this directory.
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();

    let (layer, logs) = LogLayer::new();
    tracing_subscriber::registry()
        .with(layer.with_echo(LogLevel::Info))
        .init();

    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "Set OPENROUTER_KEY env var to your OpenRouter API key")?;
    let client = OpenRouterClient::new(api_key)?;

    let mut config = DocAgentConfig::new(args.model);
    if let Some(budget) = args.budget {
        config = config.with_token_budget(budget);
    }
    if let Some(secs) = args.call_timeout {
        config = config.with_call_timeout(std::time::Duration::from_secs(secs));
    }

    let model = OpenRouterBackend::new(client)
        .with_retry(config.retry.clone())
        .with_streaming(config.streaming);
    let bridge = Arc::new(ToolBridge::new().with_timeout(config.call_timeout));

    let mut state = AppState::new(Arc::new(model), bridge, config).with_logs(logs);
    let mut local = None;
    if let Some(path) = &args.doc {
        let doc = InMemoryDocument::load(path).map_err(|e| format!("failed to load '{}': {e}", path.display()))?;
        let executor = Arc::new(Mutex::new(
            DocumentExecutor::new(doc)
                .with_search_defaults(state.config.search.clone())
                .with_hit_retention(state.config.hit_retention),
        ));
        state = state.with_executor(executor.clone());
        local = Some((path.clone(), executor));
    }

    let web_config = WebConfig {
        bind_addr: ([127, 0, 0, 1], args.port).into(),
        static_dir: args.static_dir,
    };
    let addr = spawn_web(state, web_config)
        .await
        .map_err(|e| format!("failed to start server: {e}"))?;
    println!("Sessions: ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;

    if let Some((path, executor)) = local {
        let tree = executor.lock().unwrap_or_else(|e| e.into_inner()).host().tree().clone();
        InMemoryDocument::new(tree)
            .save(&path)
            .map_err(|e| format!("failed to write '{}': {e}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}
