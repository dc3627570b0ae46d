//! Edit a JSON document tree with search-and-patch, by hand or through a
//! model.
//!
//! The document is a `HostDocument` JSON file (paragraphs and tables). The
//! `run` subcommand reads the API key from the `OPENROUTER_KEY` environment
//! variable.
//!
//! # Examples
//!
//! ```sh
//! # Outline with block ids
//! docweave snapshot --doc contract.json
//!
//! # Find excerpts
//! docweave search --doc contract.json --query "late fee" --max-hits 5
//!
//! # Replace the first match, writing the result back
//! docweave patch --doc contract.json --query "late fee" --op replace --text "service charge"
//!
//! # Let the model do it
//! docweave run --doc contract.json --user "Rename every late fee to a service charge" --out edited.json
//! ```

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand, ValueEnum};
use docweave::document::patch::{SENTINEL_END, SENTINEL_START};
use docweave::document::{SearchPayload, Udv};
use docweave::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "docweave", version)]
struct Cli {
    /// Echo log lines at this level and above to stderr.
    #[arg(long, value_enum, default_value = "warn", global = true)]
    log_level: LevelArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the flattened view of a document.
    Snapshot {
        #[arg(long)]
        doc: PathBuf,
        /// Print the full snapshot as JSON instead of the outline.
        #[arg(long)]
        json: bool,
    },

    /// Search a document and print the hits as JSON.
    Search {
        #[arg(long)]
        doc: PathBuf,
        #[arg(long)]
        query: String,
        /// Treat the query as a regular expression.
        #[arg(long)]
        pattern: bool,
        #[arg(long)]
        max_hits: Option<usize>,
        #[arg(long)]
        case_insensitive: bool,
    },

    /// Apply one patch and write the document back.
    Patch {
        #[arg(long)]
        doc: PathBuf,
        #[arg(long, value_enum)]
        op: OpArg,
        /// Replacement, inserted text, or comment body.
        #[arg(long)]
        text: String,
        /// Search for this text and patch one of its hits.
        #[arg(long, conflicts_with = "at")]
        query: Option<String>,
        /// Which hit of `--query` to patch.
        #[arg(long, default_value_t = 0)]
        nth: usize,
        /// Insert a paragraph at a document boundary instead.
        #[arg(long, value_enum)]
        at: Option<BoundaryArg>,
        /// Write here instead of overwriting the input.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run one model-driven editing turn against a document.
    Run {
        #[arg(long)]
        doc: PathBuf,
        /// Instruction for the model. Read from stdin when omitted.
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value = docweave::DEFAULT_MODEL)]
        model: String,
        #[arg(long, default_value_t = docweave::config::DEFAULT_MAX_ROUNDS)]
        max_rounds: u32,
        /// Context budget in tokens.
        #[arg(long)]
        budget: Option<usize>,
        /// Persist plan and status here between runs.
        #[arg(long)]
        memory: Option<PathBuf>,
        /// Disable streaming responses.
        #[arg(long)]
        no_stream: bool,
        /// Write the edited document here instead of overwriting the input.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for LogLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Debug => LogLevel::Debug,
            LevelArg::Info => LogLevel::Info,
            LevelArg::Warn => LogLevel::Warn,
            LevelArg::Error => LogLevel::Error,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OpArg {
    Replace,
    InsertBefore,
    InsertAfter,
    Comment,
}

#[derive(Clone, Copy, ValueEnum)]
enum BoundaryArg {
    Start,
    End,
}

// ── Helpers ────────────────────────────────────────────────────────

fn load_executor(path: &Path) -> Result<DocumentExecutor, String> {
    let doc = InMemoryDocument::load(path).map_err(|e| format!("failed to load '{}': {e}", path.display()))?;
    Ok(DocumentExecutor::new(doc))
}

fn save_executor(executor: &DocumentExecutor, path: &Path) -> Result<(), String> {
    InMemoryDocument::new(executor.host().tree().clone())
        .save(path)
        .map_err(|e| format!("failed to write '{}': {e}", path.display()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to format output: {e}"))
}

fn render_outline(udv: &Udv) -> String {
    format!(
        "v{} ({} paragraphs, {} tables, {} cells)\n{}",
        udv.version,
        udv.meta.paragraph_count,
        udv.meta.table_count,
        udv.meta.cell_count,
        udv.outline()
    )
}

fn patch_request(op: OpArg, hit_id: String, text: String) -> PatchRequest {
    match op {
        OpArg::Replace => PatchRequest::ReplaceByHitId { hit_id, new_text: text },
        OpArg::InsertBefore => PatchRequest::InsertBeforeHitId { hit_id, new_text: text },
        OpArg::InsertAfter => PatchRequest::InsertAfterHitId { hit_id, new_text: text },
        OpArg::Comment => PatchRequest::CommentByHitId { hit_id, comment: text },
    }
}

fn read_message(message: Option<String>) -> Result<String, String> {
    if let Some(message) = message {
        return Ok(message);
    }
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    if buf.trim().is_empty() {
        return Err("provide --user or pipe the instruction on stdin".to_string());
    }
    Ok(buf)
}

// ── Commands ───────────────────────────────────────────────────────

fn snapshot(doc: &Path, json: bool) -> Result<String, String> {
    let mut executor = load_executor(doc)?;
    let udv = executor.snapshot().map_err(|e| e.to_string())?;
    if json { to_json(&*udv) } else { Ok(render_outline(&udv)) }
}

fn search(
    doc: &Path,
    query: String,
    pattern: bool,
    max_hits: Option<usize>,
    case_insensitive: bool,
) -> Result<String, String> {
    let mut executor = load_executor(doc)?;
    let result = executor
        .search(&SearchPayload {
            query,
            mode: pattern.then_some(SearchMode::Pattern),
            max_hits,
            case_insensitive: case_insensitive.then_some(true),
            snapshot_version: None,
        })
        .map_err(|e| e.to_string())?;
    to_json(&result)
}

fn patch(
    doc: &Path,
    op: OpArg,
    text: String,
    query: Option<String>,
    nth: usize,
    at: Option<BoundaryArg>,
    out: Option<PathBuf>,
) -> Result<String, String> {
    let mut executor = load_executor(doc)?;
    let hit_id = match (query, at) {
        (Some(query), _) => {
            let result = executor
                .search(&SearchPayload {
                    query: query.clone(),
                    ..Default::default()
                })
                .map_err(|e| e.to_string())?;
            let hit = result
                .hits
                .get(nth)
                .ok_or_else(|| format!("'{query}' has {} hit(s); --nth {nth} is out of range", result.hits.len()))?;
            hit.hit_id.clone()
        }
        (None, Some(BoundaryArg::Start)) => SENTINEL_START.to_string(),
        (None, Some(BoundaryArg::End)) => SENTINEL_END.to_string(),
        (None, None) => return Err("provide --query or --at".to_string()),
    };

    let outcome = executor
        .patch(&patch_request(op, hit_id, text))
        .map_err(|e| format!("[{}] {e}", e.code()))?;
    save_executor(&executor, out.as_deref().unwrap_or(doc))?;
    to_json(&outcome)
}

struct RunArgs {
    doc: PathBuf,
    message: Option<String>,
    model: String,
    max_rounds: u32,
    budget: Option<usize>,
    memory: Option<PathBuf>,
    no_stream: bool,
    out: Option<PathBuf>,
}

async fn run(args: RunArgs) -> Result<String, String> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
    let message = read_message(args.message)?;

    let mut config = DocAgentConfig::new(args.model)
        .with_max_rounds(args.max_rounds)
        .with_streaming(!args.no_stream);
    if let Some(budget) = args.budget {
        config = config.with_token_budget(budget);
    }
    if let Some(memory) = args.memory {
        config = config.with_memory_path(memory);
    }

    let executor = Arc::new(Mutex::new(
        load_executor(&args.doc)?
            .with_search_defaults(config.search.clone())
            .with_hit_retention(config.hit_retention),
    ));
    let bridge = Arc::new(ToolBridge::new().with_timeout(config.call_timeout));
    let _sweeper = bridge.spawn_sweeper(config.sweep_interval, config.stale_call_after);

    let client = OpenRouterClient::new(api_key)?;
    let model = OpenRouterBackend::new(client)
        .with_retry(config.retry.clone())
        .with_streaming(config.streaming);
    let (mut session, mut events) =
        SessionController::start("cli", SessionDeps::new(Arc::new(model), bridge.clone()), config);

    // Host side: answer tool calls from the local executor, print the rest.
    let host_bridge = bridge.clone();
    let host_executor = executor.clone();
    let host = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Content { delta } => {
                    print!("{delta}");
                    let _ = io::stdout().flush();
                }
                SessionEvent::ToolUse { id, tool, payload } => {
                    eprintln!("  [tool] {tool} {payload}");
                    let call = ToolCallEvent { id, tool, payload };
                    let result = host_executor
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .handle_tool_call(&call);
                    host_bridge.resolve(result);
                }
                SessionEvent::Complete { usage, budget_used } => {
                    println!();
                    eprintln!(
                        "  [done] {} tokens (input {}, output {}), {:.0}% of budget",
                        usage.total(),
                        usage.input,
                        usage.output,
                        budget_used * 100.0
                    );
                }
                SessionEvent::Error { code, message } => {
                    eprintln!("  [{code}] {message}");
                }
            }
        }
    });

    let result = session.run_turn(&message).await;
    drop(session);
    let _ = host.await;
    let result = result.map_err(|e| e.to_string())?;

    let out = args.out.unwrap_or(args.doc);
    let executor = executor.lock().unwrap_or_else(|e| e.into_inner());
    save_executor(&executor, &out)?;
    Ok(format!(
        "Wrote {} after {} round(s){}\n",
        out.display(),
        result.rounds_used,
        if result.finished { "" } else { " (round limit reached)" }
    ))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (layer, _logs) = LogLayer::new();
    tracing_subscriber::registry()
        .with(layer.with_echo(cli.log_level.into()))
        .init();

    let outcome = match cli.command {
        Command::Snapshot { doc, json } => snapshot(&doc, json),
        Command::Search {
            doc,
            query,
            pattern,
            max_hits,
            case_insensitive,
        } => search(&doc, query, pattern, max_hits, case_insensitive),
        Command::Patch {
            doc,
            op,
            text,
            query,
            nth,
            at,
            out,
        } => patch(&doc, op, text, query, nth, at, out),
        Command::Run {
            doc,
            user,
            model,
            max_rounds,
            budget,
            memory,
            no_stream,
            out,
        } => {
            run(RunArgs {
                doc,
                message: user,
                model,
                max_rounds,
                budget,
                memory,
                no_stream,
                out,
            })
            .await
        }
    };

    match outcome {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
