//! Deterministic transcript compaction.
//!
//! When the transcript no longer fits the budget, the earliest part of the
//! non-system history is folded into one synthetic exchange: a user message
//! holding a `<context_summary>` and a short assistant acknowledgement. The
//! summary is built without a model call from what the transcript already
//! contains: assistant decisions, tool activity, open plan items, and the
//! anchors (hit ids, block ids, paths) the agent may still refer to. If that
//! is not enough, only the most recent turns are kept.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{info, warn};

use super::budget::ContextBudget;
use crate::{Message, MessageRole, ToolDef};

/// Opening tag of the synthetic summary message.
pub const SUMMARY_TAG: &str = "<context_summary>";

const ACKNOWLEDGEMENT: &str =
    "Understood. I will continue from this summary and re-run doc_search before patching.";

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Fraction of the non-system transcript folded into the summary.
    pub fraction: f64,
    /// Turns kept by the hard-truncation fallback.
    pub keep_recent_turns: usize,
    /// Upper bound on the summary text.
    pub max_summary_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            fraction: 0.6,
            keep_recent_turns: 6,
            max_summary_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub summarized_messages: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub hard_truncated: bool,
}

// ── Anchors ────────────────────────────────────────────────────────

const ANCHOR_PATTERN: &str = concat!(
    r#"\b(?P<hit>h\d+-\d+)\b"#,
    r#"|"blockId"\s*:\s*"(?P<block>[^"]+)""#,
    r#"|\{"kind":"paragraph","index":(?P<index>\d+)\}"#,
    r#"|\{"kind":"cell","tableIndex":(?P<t>\d+),"rowIndex":(?P<r>\d+),"colIndex":(?P<c>\d+),"paragraphInCell":(?P<p>\d+)\}"#,
);

static ANCHOR_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(ANCHOR_PATTERN).ok());

/// Hit ids, block ids, and paths mentioned in `text`, in order of appearance.
pub fn extract_anchors(text: &str) -> Vec<String> {
    let Some(re) = ANCHOR_RE.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in re.captures_iter(text) {
        let group = |name: &str| caps.name(name).map(|m| m.as_str());
        let anchor = if let Some(hit) = group("hit") {
            hit.to_string()
        } else if let Some(block) = group("block") {
            format!("block {block}")
        } else if let Some(index) = group("index") {
            format!("paragraph[{index}]")
        } else if let (Some(t), Some(r), Some(c), Some(p)) =
            (group("t"), group("r"), group("c"), group("p"))
        {
            format!("table[{t}].cell[{r},{c}].p[{p}]")
        } else {
            continue;
        };
        if seen.insert(anchor.clone()) {
            out.push(anchor);
        }
    }
    out
}

fn message_text(msg: &Message) -> String {
    let mut text = msg.content.clone().unwrap_or_default();
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            text.push(' ');
            text.push_str(&call.function.arguments);
        }
    }
    text
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Short `key=value` rendering of JSON tool arguments.
pub fn summarize_args(arguments: &str, max_len: usize) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(arguments)
        && let Some(obj) = v.as_object()
    {
        let parts: Vec<String> = obj
            .iter()
            .take(3)
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => format!("\"{}\"", clip(s, 40)),
                    other => clip(&other.to_string(), 40),
                };
                format!("{k}={val}")
            })
            .collect();
        return clip(&parts.join(", "), max_len);
    }
    clip(arguments, max_len)
}

// ── Summary ────────────────────────────────────────────────────────

/// Build the `<context_summary>` text for `span`.
///
/// `later` is the part of the transcript that stays; anchors it mentions are
/// listed first because the agent is most likely to reuse them.
pub fn build_summary(span: &[Message], later: &[Message], open_items: &[String], max_chars: usize) -> String {
    let mut decisions = Vec::new();
    let mut activity = Vec::new();

    for (i, msg) in span.iter().enumerate() {
        match msg.role {
            MessageRole::Assistant => {
                if let Some(text) = msg.content.as_deref().filter(|t| !t.trim().is_empty()) {
                    decisions.push(clip(text.trim(), 200));
                }
                for call in msg.tool_calls.iter().flatten() {
                    let outcome = span
                        .iter()
                        .skip(i + 1)
                        .find(|m| m.tool_call_id.as_deref() == Some(call.id.as_str()))
                        .and_then(|m| m.content.as_deref())
                        .map_or("no result", |c| {
                            if c.starts_with("Error") { "failed" } else { "ok" }
                        });
                    activity.push(format!(
                        "{}({}) -> {outcome}",
                        call.function.name,
                        summarize_args(&call.function.arguments, 80)
                    ));
                }
            }
            MessageRole::User => {
                if let Some(text) = msg.content.as_deref()
                    && !text.starts_with(SUMMARY_TAG)
                {
                    decisions.push(format!("user asked: {}", clip(text.trim(), 200)));
                }
            }
            _ => {}
        }
    }

    let span_anchors: Vec<String> = span.iter().flat_map(|m| extract_anchors(&message_text(m))).collect();
    let later_anchors: HashSet<String> = later
        .iter()
        .flat_map(|m| extract_anchors(&message_text(m)))
        .collect();
    let mut seen = HashSet::new();
    let mut anchors: Vec<&String> = span_anchors
        .iter()
        .filter(|a| later_anchors.contains(*a))
        .chain(span_anchors.iter().filter(|a| !later_anchors.contains(*a)))
        .filter(|a| seen.insert(a.as_str()))
        .collect();
    anchors.truncate(40);

    // Carry forward what an earlier summary in the span already said.
    let prior: Vec<&str> = span
        .iter()
        .filter_map(|m| m.content.as_deref())
        .filter(|c| c.starts_with(SUMMARY_TAG))
        .collect();

    let mut out = String::from(SUMMARY_TAG);
    out.push('\n');
    out.push_str(&format!("Earlier conversation ({} messages) compacted.\n", span.len()));
    for p in prior {
        let inner = p
            .trim_start_matches(SUMMARY_TAG)
            .trim_end_matches("</context_summary>")
            .trim();
        out.push_str(&format!("Previously: {}\n", clip(inner, 600)));
    }
    if !decisions.is_empty() {
        out.push_str("Decisions:\n");
        for d in decisions.iter().rev().take(12).rev() {
            out.push_str(&format!("- {d}\n"));
        }
    }
    if !activity.is_empty() {
        out.push_str("Tool activity:\n");
        for a in activity.iter().rev().take(20).rev() {
            out.push_str(&format!("- {a}\n"));
        }
    }
    if !open_items.is_empty() {
        out.push_str("Open plan items:\n");
        for item in open_items {
            out.push_str(&format!("- {item}\n"));
        }
    }
    if !anchors.is_empty() {
        let list: Vec<&str> = anchors.iter().map(|a| a.as_str()).collect();
        out.push_str(&format!("Anchors (most relevant first): {}\n", list.join(", ")));
    }

    let mut out = clip(&out, max_chars.saturating_sub(20));
    out.push_str("\n</context_summary>");
    out
}

// ── Compaction ─────────────────────────────────────────────────────

fn system_prefix_len(messages: &[Message]) -> usize {
    messages
        .iter()
        .take_while(|m| m.role == MessageRole::System)
        .count()
}

/// Fold the earliest part of the transcript into a summary when it exceeds
/// the budget. Returns `None` when no compaction was needed.
pub fn compact(
    messages: &mut Vec<Message>,
    tools: &[ToolDef],
    open_items: &[String],
    budget: &ContextBudget,
    config: &CompactionConfig,
) -> Option<CompactionReport> {
    let tokens_before = budget.estimate_usage(messages, tools).estimated_tokens;
    if tokens_before <= budget.effective_budget() {
        return None;
    }

    let prefix = system_prefix_len(messages);
    let body_len = messages.len() - prefix;
    let mut split = ((body_len as f64) * config.fraction.clamp(0.0, 1.0)).ceil() as usize;
    // The latest user message always stays verbatim.
    if let Some(last_user) = messages[prefix..]
        .iter()
        .rposition(|m| m.role == MessageRole::User)
    {
        split = split.min(last_user);
    }
    // Never separate a tool call from its results.
    while split < body_len && messages[prefix + split].role == MessageRole::Tool {
        split += 1;
    }

    let mut summarized_messages = 0;
    if split > 0 {
        let kept: Vec<Message> = messages.split_off(prefix + split);
        let span: Vec<Message> = messages.split_off(prefix);
        let summary = build_summary(&span, &kept, open_items, config.max_summary_chars);
        summarized_messages = span.len();
        messages.push(Message::user(summary));
        messages.push(Message::assistant_text(ACKNOWLEDGEMENT));
        messages.extend(kept);
        info!(summarized = summarized_messages, "Compacted transcript into summary");
    }

    let mut hard_truncated = false;
    if budget.estimate_usage(messages, tools).estimated_tokens > budget.effective_budget() {
        hard_truncated = truncate_to_recent_turns(messages, config.keep_recent_turns);
    }

    let tokens_after = budget.estimate_usage(messages, tools).estimated_tokens;
    if tokens_after > budget.effective_budget() {
        warn!(tokens_after, budget = budget.effective_budget(), "Transcript still over budget after compaction");
    }

    Some(CompactionReport {
        summarized_messages,
        tokens_before,
        tokens_after,
        hard_truncated,
    })
}

/// Keep the system prefix and the last `turns` turns (a turn starts at a
/// user message). Returns whether anything was removed.
pub fn truncate_to_recent_turns(messages: &mut Vec<Message>, turns: usize) -> bool {
    let prefix = system_prefix_len(messages);
    let turn_starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .skip(prefix)
        .filter(|(_, m)| m.role == MessageRole::User)
        .map(|(i, _)| i)
        .collect();
    if turns == 0 || turn_starts.len() <= turns {
        return false;
    }
    let cut = turn_starts[turn_starts.len() - turns];
    let removed = cut - prefix;
    messages.drain(prefix..cut);
    warn!(removed, kept_turns = turns, "Hard-truncated transcript to recent turns");
    removed > 0
}
