//! Working memory: the agent's plan and status, persisted between turns.
//!
//! Only the `plan` and `status` tools mutate it. [`MemoryStore`] reads and
//! writes it as JSON next to the conversation, using an atomic temp-file +
//! rename so a crash never leaves a half-written file behind.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::Result;
use crate::session::events::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Todo,
    Doing,
    Done,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemStatus::Todo => "[todo]",
            ItemStatus::Doing => "[doing]",
            ItemStatus::Done => "[done]",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub id: String,
    pub title: String,
    pub status: ItemStatus,
    /// Hit ids, block ids, or comment ids backing a completed item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub items: Vec<PlanItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    #[serde(default)]
    pub turns_taken: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub status: StatusInfo,
}

/// Working memory shared between the plan/status tools and the controller.
pub type SharedMemory = Arc<Mutex<WorkingMemory>>;

impl WorkingMemory {
    pub fn shared(self) -> SharedMemory {
        Arc::new(Mutex::new(self))
    }

    fn next_id(&self) -> String {
        let max = self
            .plan
            .items
            .iter()
            .filter_map(|i| i.id.strip_prefix('p')?.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        format!("p{}", max + 1)
    }

    fn item_mut(&mut self, id: &str) -> std::result::Result<&mut PlanItem, String> {
        self.plan
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| format!("no plan item '{id}'"))
    }

    pub fn add_item(&mut self, title: impl Into<String>) -> &PlanItem {
        let now = Utc::now().to_rfc3339();
        let id = self.next_id();
        self.plan.items.push(PlanItem {
            id,
            title: title.into(),
            status: ItemStatus::Todo,
            evidence_refs: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        });
        &self.plan.items[self.plan.items.len() - 1]
    }

    /// Move an item to `status`, appending any evidence references.
    pub fn set_status(
        &mut self,
        id: &str,
        status: ItemStatus,
        evidence: Vec<String>,
    ) -> std::result::Result<(), String> {
        let item = self.item_mut(id)?;
        item.status = status;
        for r in evidence {
            if !item.evidence_refs.contains(&r) {
                item.evidence_refs.push(r);
            }
        }
        item.updated_at = Utc::now().to_rfc3339();
        if status == ItemStatus::Doing {
            self.plan.cursor = Some(id.to_string());
        } else if status == ItemStatus::Done && self.plan.cursor.as_deref() == Some(id) {
            self.plan.cursor = None;
        }
        Ok(())
    }

    pub fn remove_item(&mut self, id: &str) -> std::result::Result<(), String> {
        let before = self.plan.items.len();
        self.plan.items.retain(|i| i.id != id);
        if self.plan.items.len() == before {
            return Err(format!("no plan item '{id}'"));
        }
        if self.plan.cursor.as_deref() == Some(id) {
            self.plan.cursor = None;
        }
        Ok(())
    }

    pub fn set_cursor(&mut self, id: Option<&str>) -> std::result::Result<(), String> {
        if let Some(id) = id {
            self.item_mut(id)?;
        }
        self.plan.cursor = id.map(str::to_string);
        Ok(())
    }

    /// Unfinished items as one-line strings, e.g. `[doing] p2: Fix fee table`.
    pub fn open_items(&self) -> Vec<String> {
        self.plan
            .items
            .iter()
            .filter(|i| i.status != ItemStatus::Done)
            .map(|i| format!("{} {}: {}", i.status, i.id, i.title))
            .collect()
    }

    pub fn render_plan(&self) -> String {
        if self.plan.items.is_empty() {
            return "Plan is empty.".into();
        }
        let mut out = String::from("Plan:\n");
        for item in &self.plan.items {
            let marker = if self.plan.cursor.as_deref() == Some(item.id.as_str()) {
                "> "
            } else {
                "  "
            };
            out.push_str(&format!("{marker}{} {} {}", item.status, item.id, item.title));
            if !item.evidence_refs.is_empty() {
                out.push_str(&format!(" (evidence: {})", item.evidence_refs.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

// ── Persistence ────────────────────────────────────────────────────

/// JSON file holding one conversation's working memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored memory, or an empty one if the file does not exist.
    pub fn load(&self) -> Result<WorkingMemory> {
        if !self.path.exists() {
            return Ok(WorkingMemory::default());
        }
        let json = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, memory: &WorkingMemory) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(memory)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), items = memory.plan.items.len(), "Working memory saved");
        Ok(())
    }
}
