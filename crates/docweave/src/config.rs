//! Configuration for a document-editing session.
//!
//! Every knob has a default; override the few you care about with the
//! builder methods or struct-update syntax:
//!
//! ```ignore
//! let config = DocAgentConfig::new("anthropic/claude-sonnet-4")
//!     .with_token_budget(60_000)
//!     .with_call_timeout(Duration::from_secs(20))
//!     .with_memory_path("conversations/c42/memory.json");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::api::retry::RetryConfig;
use crate::bridge::DEFAULT_CALL_TIMEOUT;
use crate::context::budget::{DEFAULT_SAFETY_MARGIN, DEFAULT_TOKEN_BUDGET};
use crate::context::{CompactionConfig, ContextBudget, ContextManager, TokenAccountant};
use crate::document::patch::DEFAULT_HIT_RETENTION;
use crate::document::search::SearchOptions;
use crate::tools::names;

pub const DEFAULT_MAX_ROUNDS: u32 = 24;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_CALL_AFTER: Duration = Duration::from_secs(90);

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You edit a structured document (paragraphs and tables) on the user's behalf.

Work in this order:
1. Call doc_snapshot once to learn the structure and block ids.
2. Use doc_search to find the exact text to change. Every hit has a hitId.
3. Call doc_patch with that hitId. Never guess hit ids.
4. If a patch fails with HIT_STALE, search again and retry with the new hit.
5. Use plan to track multi-part edits and cite the hit ids you patched.

Keep replies short. Describe what you changed once all edits are applied.";

#[derive(Debug, Clone)]
pub struct DocAgentConfig {
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Model round trips per user turn before the turn is cut off.
    pub max_rounds: u32,
    pub streaming: bool,
    pub retry: RetryConfig,
    /// Validate tool arguments against their JSON Schema before running.
    pub validate_tool_args: bool,

    // Context budget.
    pub token_budget: usize,
    pub safety_margin: f64,
    pub chars_per_token: f64,
    pub whole_document_tools: Vec<String>,
    pub compaction: CompactionConfig,

    // Bridge.
    pub call_timeout: Duration,
    pub sweep_interval: Duration,
    pub stale_call_after: Duration,

    // Executor.
    pub search: SearchOptions,
    pub hit_retention: usize,

    /// Where working memory is persisted between turns. `None` keeps it in
    /// process only.
    pub memory_path: Option<PathBuf>,
}

impl Default for DocAgentConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.2,
            max_rounds: DEFAULT_MAX_ROUNDS,
            streaming: true,
            retry: RetryConfig::default(),
            validate_tool_args: true,
            token_budget: DEFAULT_TOKEN_BUDGET,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            chars_per_token: crate::context::DEFAULT_CHARS_PER_TOKEN,
            whole_document_tools: vec![names::DOC_SNAPSHOT.to_string()],
            compaction: CompactionConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_call_after: DEFAULT_STALE_CALL_AFTER,
            search: SearchOptions::default(),
            hit_retention: DEFAULT_HIT_RETENTION,
            memory_path: None,
        }
    }
}

impl DocAgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_token_budget(mut self, tokens: usize) -> Self {
        self.token_budget = tokens;
        self
    }

    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_sweeper(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.sweep_interval = interval;
        self.stale_call_after = stale_after;
        self
    }

    pub fn with_search(mut self, search: SearchOptions) -> Self {
        self.search = search;
        self
    }

    pub fn with_hit_retention(mut self, snapshots: usize) -> Self {
        self.hit_retention = snapshots;
        self
    }

    pub fn with_whole_document_tools(mut self, tools: Vec<String>) -> Self {
        self.whole_document_tools = tools;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_memory_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.memory_path = Some(path.into());
        self
    }

    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(self.token_budget)
            .with_safety_margin(self.safety_margin)
            .with_accountant(TokenAccountant::new(self.chars_per_token))
    }

    pub fn context_manager(&self) -> ContextManager {
        ContextManager::new(self.budget())
            .with_whole_document_tools(self.whole_document_tools.clone())
            .with_compaction(self.compaction.clone())
    }
}
