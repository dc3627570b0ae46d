//! Working-memory tools: `plan` and `status`.
//!
//! These are the only writers of [`WorkingMemory`](crate::memory::WorkingMemory).
//! Both run in process and never touch the document.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::ToolDef;
use crate::memory::{ItemStatus, SharedMemory, WorkingMemory};
use crate::tools::core::{Tool, ToolFuture, ToolSet, parse_tool_args};
use crate::tools::names;
use crate::tools::spec::ToolSpec;

fn with_memory<R>(memory: &SharedMemory, f: impl FnOnce(&mut WorkingMemory) -> R) -> R {
    let mut guard = memory.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

// ── plan ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Add an item (needs `title`).
    Add,
    /// Mark an item as in progress and move the cursor to it.
    Start,
    /// Mark an item done, optionally citing `evidence` ids.
    Complete,
    Remove,
    /// Point the cursor at `id`, or clear it when `id` is omitted.
    SetCursor,
    List,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanArgs {
    pub action: PlanAction,
    /// Plan item id such as `p2`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Hit ids, block ids, or comment ids that show the item is done.
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// The agent's checklist for the current edit.
pub struct PlanTool {
    memory: SharedMemory,
}

impl PlanTool {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    fn run(&self, args: PlanArgs) -> String {
        with_memory(&self.memory, |mem| {
            let outcome = match args.action {
                PlanAction::Add => match args.title.filter(|t| !t.trim().is_empty()) {
                    Some(title) => {
                        mem.add_item(title);
                        Ok(())
                    }
                    None => Err("'title' is required for 'add'.".to_string()),
                },
                PlanAction::Start | PlanAction::Complete | PlanAction::Remove => match args.id.as_deref() {
                    Some(id) => match args.action {
                        PlanAction::Start => mem.set_status(id, ItemStatus::Doing, args.evidence),
                        PlanAction::Complete => mem.set_status(id, ItemStatus::Done, args.evidence),
                        _ => mem.remove_item(id),
                    },
                    None => Err("'id' is required for this action.".to_string()),
                },
                PlanAction::SetCursor => mem.set_cursor(args.id.as_deref()),
                PlanAction::List => Ok(()),
            };
            match outcome {
                Ok(()) => mem.render_plan(),
                Err(e) => format!("Error: {e}\n{}", mem.render_plan()),
            }
        })
    }
}

impl Tool for PlanTool {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder(names::PLAN)
            .purpose("Keep a checklist of the edits this request needs")
            .when_to_use("At the start of a multi-part edit, and after each patch to mark progress")
            .when_not_to_use("For free-form reasoning; use think")
            .parameters_for::<PlanArgs>()
            .example(r#"plan(action="add", title="Update fee table")"#, "the plan with a new [todo] item")
            .example(
                r#"plan(action="complete", id="p1", evidence=["h4-2"])"#,
                "p1 marked [done] citing the patched hit",
            )
            .output_format("The full plan, one item per line, cursor marked with >")
            .build()
            .to_tool_def()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let parsed = parse_tool_args::<PlanArgs>(arguments);
        Box::pin(async move {
            match parsed {
                Ok(args) => self.run(args),
                Err(e) => e,
            }
        })
    }

    fn is_mutation(&self) -> bool {
        true
    }
}

// ── status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    #[default]
    Get,
    /// Record `note` as the last operation.
    Record,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct StatusArgs {
    #[serde(default)]
    pub action: StatusAction,
    #[serde(default)]
    pub note: Option<String>,
}

/// Turn count, last operation, and token usage of the session.
pub struct StatusTool {
    memory: SharedMemory,
}

impl StatusTool {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    fn run(&self, args: StatusArgs) -> String {
        with_memory(&self.memory, |mem| {
            if let StatusAction::Record = args.action {
                match args.note.filter(|n| !n.trim().is_empty()) {
                    Some(note) => mem.status.last_op = Some(note),
                    None => return "Error: 'note' is required for 'record'.".to_string(),
                }
            }
            render_status(mem)
        })
    }
}

fn render_status(mem: &WorkingMemory) -> String {
    let mut out = format!("Turns taken: {}\n", mem.status.turns_taken);
    out.push_str(&format!(
        "Last operation: {}\n",
        mem.status.last_op.as_deref().unwrap_or("(none)")
    ));
    if let Some(usage) = mem.status.last_token_usage {
        out.push_str(&format!(
            "Tokens used: {} (input {}, output {}, tool calls {}, tool results {})\n",
            usage.total(),
            usage.input,
            usage.output,
            usage.tool_calls,
            usage.tool_responses
        ));
    }
    let open = mem.open_items();
    out.push_str(&format!("Open plan items: {}\n", open.len()));
    for item in open {
        out.push_str(&format!("  {item}\n"));
    }
    out
}

impl Tool for StatusTool {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder(names::STATUS)
            .purpose("Report or record session progress")
            .when_to_use("To check how many turns and tokens have been spent, or to note the last operation")
            .when_not_to_use("To track edits still to do; use plan")
            .parameters_for::<StatusArgs>()
            .build()
            .to_tool_def()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let parsed = parse_tool_args::<StatusArgs>(arguments);
        Box::pin(async move {
            match parsed {
                Ok(args) => self.run(args),
                Err(e) => e,
            }
        })
    }
}

impl ToolSet {
    /// Register the `plan` and `status` tools over shared working memory.
    pub fn with_memory_tools(self, memory: &SharedMemory) -> Self {
        self.with(PlanTool::new(SharedMemory::clone(memory)))
            .with(StatusTool::new(SharedMemory::clone(memory)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::TokenUsage;

    fn memory() -> SharedMemory {
        WorkingMemory::default().shared()
    }

    #[tokio::test]
    async fn plan_add_start_complete() {
        let mem = memory();
        let tools = ToolSet::new().with_memory_tools(&mem);

        let out = tools.execute("plan", r#"{"action":"add","title":"Raise fees"}"#).await;
        assert!(out.contains("[todo] p1 Raise fees"));

        let out = tools.execute("plan", r#"{"action":"start","id":"p1"}"#).await;
        assert!(out.contains("> [doing] p1"));

        let out = tools
            .execute("plan", r#"{"action":"complete","id":"p1","evidence":["h2-0"]}"#)
            .await;
        assert!(out.contains("[done] p1 Raise fees (evidence: h2-0)"));
        assert!(mem.lock().unwrap().open_items().is_empty());
    }

    #[tokio::test]
    async fn plan_errors_keep_the_plan_visible() {
        let mem = memory();
        let tools = ToolSet::new().with_memory_tools(&mem);
        tools.execute("plan", r#"{"action":"add","title":"a"}"#).await;

        let out = tools.execute("plan", r#"{"action":"add"}"#).await;
        assert!(out.starts_with("Error: 'title' is required"));
        let out = tools.execute("plan", r#"{"action":"remove","id":"p7"}"#).await;
        assert!(out.starts_with("Error: no plan item 'p7'"));
        assert!(out.contains("[todo] p1 a"));
        let out = tools.execute("plan", r#"{"action":"fly"}"#).await;
        assert!(out.starts_with("Error: invalid tool arguments"));
    }

    #[tokio::test]
    async fn status_reports_and_records() {
        let mem = memory();
        {
            let mut guard = mem.lock().unwrap();
            guard.status.turns_taken = 2;
            guard.status.last_token_usage = Some(TokenUsage {
                input: 100,
                output: 20,
                tool_calls: 5,
                tool_responses: 40,
            });
            guard.add_item("Check totals");
        }
        let tools = ToolSet::new().with_memory_tools(&mem);

        let out = tools.execute("status", "").await;
        assert!(out.contains("Turns taken: 2"));
        assert!(out.contains("Tokens used: 165"));
        assert!(out.contains("[todo] p1: Check totals"));

        let out = tools
            .execute("status", r#"{"action":"record","note":"patched h1-0"}"#)
            .await;
        assert!(out.contains("Last operation: patched h1-0"));
        assert_eq!(mem.lock().unwrap().status.last_op.as_deref(), Some("patched h1-0"));
    }
}
