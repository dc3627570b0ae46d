//! Context budget tracking: measures the transcript against a fixed token
//! budget, refuses requests that cannot fit, and produces advisory notices as
//! usage approaches the limit.
//!
//! The budget is the configured `token_budget` minus a safety margin (10% by
//! default). Advisories are appended to tool results so the model learns
//! about pressure in-band: a warning at 60% and a critical notice at 80%.

use super::tokens::TokenAccountant;
use crate::error::{DocError, Result};
use crate::{Message, ToolDef};

/// Default token budget for one conversation.
pub const DEFAULT_TOKEN_BUDGET: usize = 120_000;

/// Fraction of the budget held back for estimation error.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.10;

/// Threshold percentages at which to inject context notices.
pub const WARNING_THRESHOLD: f64 = 0.60;
pub const CRITICAL_THRESHOLD: f64 = 0.80;

/// Tracks context budget consumption for a session.
///
/// # Example
///
/// ```ignore
/// let budget = ContextBudget::new(100_000)
///     .with_safety_margin(0.15)
///     .with_critical_message("Finish the current edit and stop.");
///
/// let usage = budget.preflight(&messages, &tool_defs)?;
/// println!("{}", usage.to_log_string());
/// ```
#[derive(Debug, Clone)]
pub struct ContextBudget {
    token_budget: usize,
    safety_margin: f64,
    accountant: TokenAccountant,
    warning_message: Option<String>,
    critical_message: Option<String>,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_BUDGET)
    }
}

impl ContextBudget {
    pub fn new(token_budget: usize) -> Self {
        Self {
            token_budget,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            accountant: TokenAccountant::default(),
            warning_message: None,
            critical_message: None,
        }
    }

    /// Fraction of the budget held back, clamped to `0.0..=0.9`.
    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin.clamp(0.0, 0.9);
        self
    }

    pub fn with_accountant(mut self, accountant: TokenAccountant) -> Self {
        self.accountant = accountant;
        self
    }

    /// Set a custom warning message (injected at 60% usage).
    pub fn with_warning_message(mut self, msg: impl Into<String>) -> Self {
        self.warning_message = Some(msg.into());
        self
    }

    /// Set a custom critical message (injected at 80% usage).
    pub fn with_critical_message(mut self, msg: impl Into<String>) -> Self {
        self.critical_message = Some(msg.into());
        self
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }

    /// Budget after the safety margin. All thresholds use this value.
    pub fn effective_budget(&self) -> usize {
        let held_back = (self.token_budget as f64 * self.safety_margin).round() as usize;
        self.token_budget.saturating_sub(held_back)
    }

    /// Fraction of the effective budget that `tokens` represents.
    pub fn fraction_used(&self, tokens: usize) -> f64 {
        let effective = self.effective_budget();
        if effective > 0 {
            tokens as f64 / effective as f64
        } else {
            1.0
        }
    }

    /// Estimate what sending `messages` with `tools` would cost.
    pub fn estimate_usage(&self, messages: &[Message], tools: &[ToolDef]) -> ContextUsage {
        let estimated_tokens = self.accountant.messages(messages) + self.accountant.tools(tools);
        ContextUsage {
            estimated_tokens,
            budget: self.effective_budget(),
            usage_pct: self.fraction_used(estimated_tokens),
        }
    }

    /// Refuse a request whose estimate exceeds the effective budget.
    pub fn preflight(&self, messages: &[Message], tools: &[ToolDef]) -> Result<ContextUsage> {
        let usage = self.estimate_usage(messages, tools);
        if usage.estimated_tokens > usage.budget {
            return Err(DocError::BudgetExceeded {
                estimated: usage.estimated_tokens,
                budget: usage.budget,
            });
        }
        Ok(usage)
    }

    /// Generate a context advisory notice if usage exceeds thresholds.
    ///
    /// Returns `None` if usage is within normal bounds.
    pub fn advisory(&self, usage: &ContextUsage) -> Option<String> {
        if usage.usage_pct >= CRITICAL_THRESHOLD {
            Some(self.critical_message.clone().unwrap_or_else(|| {
                format!(
                    "[Context notice: ~{:.0}% of context budget used ({} est. tokens / {} max). \
                     Apply the edits you have confirmed now. Do not take new snapshots.]",
                    usage.usage_pct * 100.0,
                    usage.estimated_tokens,
                    usage.budget,
                )
            }))
        } else if usage.usage_pct >= WARNING_THRESHOLD {
            Some(self.warning_message.clone().unwrap_or_else(|| {
                format!(
                    "[Context notice: ~{:.0}% of context budget used. \
                     Prefer targeted doc_search over full snapshots and keep excerpts short.]",
                    usage.usage_pct * 100.0,
                )
            }))
        } else {
            None
        }
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub estimated_tokens: usize,
    /// Effective budget the estimate is measured against.
    pub budget: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.budget,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(chars: usize) -> Vec<Message> {
        vec![Message::user("x".repeat(chars))]
    }

    #[test]
    fn effective_budget_subtracts_margin() {
        assert_eq!(ContextBudget::new(100_000).effective_budget(), 90_000);
        assert_eq!(
            ContextBudget::new(100_000)
                .with_safety_margin(0.0)
                .effective_budget(),
            100_000
        );
        // Clamped so the budget never collapses to zero.
        assert_eq!(
            ContextBudget::new(1000).with_safety_margin(5.0).effective_budget(),
            100
        );
        assert_eq!(ContextBudget::new(6000).effective_budget(), 5400);
        assert_eq!(
            ContextBudget::new(333).with_safety_margin(0.3).effective_budget(),
            233
        );
    }

    #[test]
    fn low_usage_no_advisory() {
        let budget = ContextBudget::new(10_000);
        let usage = budget.estimate_usage(&big(100), &[]);
        assert!(budget.advisory(&usage).is_none());
    }

    #[test]
    fn warning_threshold_triggers() {
        let budget = ContextBudget::new(1000).with_safety_margin(0.0);
        // ~650 tokens of 1000.
        let usage = budget.estimate_usage(&big(2261), &[]);
        assert!(usage.usage_pct >= WARNING_THRESHOLD && usage.usage_pct < CRITICAL_THRESHOLD);
        assert!(budget.advisory(&usage).unwrap().contains("targeted doc_search"));
    }

    #[test]
    fn critical_threshold_triggers() {
        let budget = ContextBudget::new(1000).with_safety_margin(0.0);
        let usage = budget.estimate_usage(&big(3000), &[]);
        assert!(budget.advisory(&usage).unwrap().contains("Apply the edits"));
    }

    #[test]
    fn custom_messages() {
        let budget = ContextBudget::new(1000)
            .with_safety_margin(0.0)
            .with_critical_message("STOP NOW");
        let usage = budget.estimate_usage(&big(3000), &[]);
        assert_eq!(budget.advisory(&usage), Some("STOP NOW".into()));
    }

    #[test]
    fn preflight_rejects_oversized_requests() {
        let budget = ContextBudget::new(1000);
        assert!(budget.preflight(&big(100), &[]).is_ok());
        match budget.preflight(&big(10_000), &[]) {
            Err(DocError::BudgetExceeded { estimated, budget }) => {
                assert!(estimated > budget);
                assert_eq!(budget, 900);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn tool_schemas_count_toward_usage() {
        let budget = ContextBudget::new(10_000);
        let tools = vec![ToolDef::new("t", "d", serde_json::json!({"type": "object"}))];
        let without = budget.estimate_usage(&big(10), &[]);
        let with = budget.estimate_usage(&big(10), &tools);
        assert!(with.estimated_tokens > without.estimated_tokens);
    }

    #[test]
    fn usage_log_string_format() {
        let budget = ContextBudget::new(10_000);
        let log = budget.estimate_usage(&big(10), &[]).to_log_string();
        assert!(log.contains("context:"));
        assert!(log.contains("tokens"));
    }
}
