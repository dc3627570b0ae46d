//! Context window management: token accounting, budgets, deduplication,
//! and compaction.
//!
//! The conversation has a fixed token budget. Before every model request the
//! [`ContextManager`] edits the transcript in layers, cheapest first:
//!
//! 1. **[`dedup`]**: replaces every whole-document read except the latest
//!    with a short marker.
//!
//! 2. **[`compaction`]**: folds the earliest ~60% of the history into one
//!    synthetic summary exchange, then falls back to keeping only the most
//!    recent turns.
//!
//! 3. **[`budget`]**: [`ContextBudget`] refuses requests that cannot fit
//!    and produces advisory notices at 60% and 80%.
//!
//! All estimates come from one [`TokenAccountant`](tokens::TokenAccountant).

pub mod budget;
pub mod compaction;
pub mod dedup;
pub mod tokens;

pub use budget::{ContextBudget, ContextUsage};
pub use compaction::{CompactionConfig, CompactionReport};
pub use tokens::{DEFAULT_CHARS_PER_TOKEN, TokenAccountant};

use crate::{Message, ToolDef};
use tracing::debug;

/// What [`ContextManager::prepare`] did to the transcript.
#[derive(Debug, Clone)]
pub struct PrepareReport {
    pub deduped_chars: usize,
    pub compaction: Option<CompactionReport>,
    pub usage: ContextUsage,
}

/// Runs deduplication and compaction against a [`ContextBudget`].
#[derive(Debug, Clone)]
pub struct ContextManager {
    budget: ContextBudget,
    whole_document_tools: Vec<String>,
    compaction: CompactionConfig,
}

impl ContextManager {
    pub fn new(budget: ContextBudget) -> Self {
        Self {
            budget,
            whole_document_tools: vec![crate::tools::names::DOC_SNAPSHOT.to_string()],
            compaction: CompactionConfig::default(),
        }
    }

    pub fn with_whole_document_tools(mut self, tools: Vec<String>) -> Self {
        self.whole_document_tools = tools;
        self
    }

    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Bring the transcript within budget where possible.
    ///
    /// `open_items` are unfinished plan items, carried into any summary.
    pub fn prepare(&self, messages: &mut Vec<Message>, tools: &[ToolDef], open_items: &[String]) -> PrepareReport {
        let deduped_chars = dedup::dedupe_whole_document_reads(messages, &self.whole_document_tools);
        let compaction = compaction::compact(messages, tools, open_items, &self.budget, &self.compaction);
        let usage = self.budget.estimate_usage(messages, tools);
        debug!(deduped_chars, compacted = compaction.is_some(), "{}", usage.to_log_string());
        PrepareReport {
            deduped_chars,
            compaction,
            usage,
        }
    }
}
