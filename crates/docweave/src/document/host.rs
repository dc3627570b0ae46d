//! The host document tree and its native editing primitives.
//!
//! The agent never touches the host directly. The [`DocumentHost`] trait is
//! the narrow surface the executor uses; [`InMemoryDocument`] is the
//! implementation used by the CLI and the tests. The tree is a plain JSON
//! structure of paragraph and table nodes:
//!
//! ```json
//! { "blocks": [
//!     { "type": "paragraph", "style": "heading1", "text": "Scope" },
//!     { "type": "table", "rows": [[ { "paragraphs": [ { "text": "Fee" } ] } ]] }
//! ] }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;

use super::udv::Path;
use crate::error::{DocError, Result};

// ── Tree types ─────────────────────────────────────────────────────

/// An inline formatting range over a paragraph's text (byte offsets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub start: usize,
    pub end: usize,
    /// Free-form kind: `bold`, `italic`, `link`, ...
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostParagraph {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

impl HostParagraph {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_mark(mut self, start: usize, end: usize, kind: impl Into<String>) -> Self {
        self.marks.push(Mark {
            start,
            end,
            kind: kind.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCell {
    #[serde(default)]
    pub paragraphs: Vec<HostParagraph>,
}

impl HostCell {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            paragraphs: vec![HostParagraph::new(text)],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub rows: Vec<Vec<HostCell>>,
}

/// A top-level node of the host tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostNode {
    Paragraph(HostParagraph),
    Table(HostTable),
}

/// A comment anchored to a range of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostComment {
    pub id: String,
    pub path: Path,
    pub start: usize,
    pub end: usize,
    /// The text the comment was anchored to when it was created.
    pub quoted: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostDocument {
    #[serde(default)]
    pub blocks: Vec<HostNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<HostComment>,
}

/// Where [`DocumentHost::insert_paragraph`] places a new paragraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
}

// ── DocumentHost trait ─────────────────────────────────────────────

/// Native editing primitives of the environment that owns the document.
///
/// Every successful mutation must advance [`revision()`](Self::revision);
/// the executor uses it to decide when a snapshot is stale.
pub trait DocumentHost: Send {
    fn tree(&self) -> &HostDocument;

    /// Monotonic edit counter.
    fn revision(&self) -> u64;

    /// Current text of the paragraph addressed by `path`, if it exists.
    fn text_at(&self, path: &Path) -> Option<&str>;

    /// Replace the byte range `start..end` of the paragraph at `path`.
    fn replace_range(&mut self, path: &Path, start: usize, end: usize, text: &str) -> Result<()>;

    fn insert_text(&mut self, path: &Path, at: usize, text: &str) -> Result<()> {
        self.replace_range(path, at, at, text)
    }

    /// Anchor a comment to `start..end` of the paragraph at `path`.
    /// Returns the new comment's id.
    fn add_comment(&mut self, path: &Path, start: usize, end: usize, text: &str)
    -> Result<String>;

    /// Insert a new top-level paragraph at a document boundary.
    fn insert_paragraph(&mut self, at: Boundary, text: &str) -> Result<()>;
}

// ── InMemoryDocument ───────────────────────────────────────────────

/// A [`DocumentHost`] backed by an owned [`HostDocument`].
#[derive(Debug, Clone)]
pub struct InMemoryDocument {
    doc: HostDocument,
    revision: u64,
    next_comment: u64,
}

impl InMemoryDocument {
    pub fn new(doc: HostDocument) -> Self {
        let next_comment = doc.comments.len() as u64 + 1;
        Self {
            doc,
            revision: 1,
            next_comment,
        }
    }

    /// Build a document of plain top-level paragraphs.
    pub fn from_paragraphs(texts: &[&str]) -> Self {
        Self::new(HostDocument {
            blocks: texts
                .iter()
                .map(|t| HostNode::Paragraph(HostParagraph::new(*t)))
                .collect(),
            comments: Vec::new(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: HostDocument = serde_json::from_str(json)?;
        Ok(Self::new(doc))
    }

    pub fn load(path: &FsPath) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write the tree as pretty JSON (temp file + rename).
    pub fn save(&self, path: &FsPath) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.doc)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn paragraph_mut(&mut self, path: &Path) -> Option<&mut HostParagraph> {
        match *path {
            Path::Paragraph { index } => self
                .doc
                .blocks
                .iter_mut()
                .filter_map(|n| match n {
                    HostNode::Paragraph(p) => Some(p),
                    HostNode::Table(_) => None,
                })
                .nth(index),
            Path::Cell {
                table_index,
                row_index,
                col_index,
                paragraph_in_cell,
            } => self
                .doc
                .blocks
                .iter_mut()
                .filter_map(|n| match n {
                    HostNode::Table(t) => Some(t),
                    HostNode::Paragraph(_) => None,
                })
                .nth(table_index)?
                .rows
                .get_mut(row_index)?
                .get_mut(col_index)?
                .paragraphs
                .get_mut(paragraph_in_cell),
        }
    }
}

/// Resolve `path` against a tree without mutating it.
pub fn paragraph_at<'a>(doc: &'a HostDocument, path: &Path) -> Option<&'a HostParagraph> {
    match *path {
        Path::Paragraph { index } => doc
            .blocks
            .iter()
            .filter_map(|n| match n {
                HostNode::Paragraph(p) => Some(p),
                HostNode::Table(_) => None,
            })
            .nth(index),
        Path::Cell {
            table_index,
            row_index,
            col_index,
            paragraph_in_cell,
        } => doc
            .blocks
            .iter()
            .filter_map(|n| match n {
                HostNode::Table(t) => Some(t),
                HostNode::Paragraph(_) => None,
            })
            .nth(table_index)?
            .rows
            .get(row_index)?
            .get(col_index)?
            .paragraphs
            .get(paragraph_in_cell),
    }
}

fn check_range(text: &str, start: usize, end: usize) -> Result<()> {
    if start > end || end > text.len() {
        return Err(DocError::InvalidRequest(format!(
            "range {start}..{end} outside text of length {}",
            text.len()
        )));
    }
    if !text.is_char_boundary(start) || !text.is_char_boundary(end) {
        return Err(DocError::InvalidRequest(format!(
            "range {start}..{end} splits a character"
        )));
    }
    Ok(())
}

/// Map a mark endpoint across the replacement of `start..end` by `new_len` bytes.
fn shift(pos: usize, start: usize, end: usize, new_len: usize, is_end: bool) -> usize {
    if pos <= start {
        pos
    } else if pos >= end {
        pos - (end - start) + new_len
    } else if is_end {
        start + new_len
    } else {
        start
    }
}

impl DocumentHost for InMemoryDocument {
    fn tree(&self) -> &HostDocument {
        &self.doc
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn text_at(&self, path: &Path) -> Option<&str> {
        paragraph_at(&self.doc, path).map(|p| p.text.as_str())
    }

    fn replace_range(&mut self, path: &Path, start: usize, end: usize, text: &str) -> Result<()> {
        let para = self
            .paragraph_mut(path)
            .ok_or_else(|| DocError::InvalidRequest(format!("no paragraph at {path}")))?;
        check_range(&para.text, start, end)?;
        para.text.replace_range(start..end, text);

        let new_len = text.len();
        for mark in &mut para.marks {
            mark.start = shift(mark.start, start, end, new_len, false);
            mark.end = shift(mark.end, start, end, new_len, true);
        }
        para.marks.retain(|m| m.start < m.end);

        // Comments on the same paragraph move with the text.
        for c in self.doc.comments.iter_mut().filter(|c| c.path == *path) {
            c.start = shift(c.start, start, end, new_len, false);
            c.end = shift(c.end, start, end, new_len, true);
        }

        self.revision += 1;
        Ok(())
    }

    fn add_comment(
        &mut self,
        path: &Path,
        start: usize,
        end: usize,
        text: &str,
    ) -> Result<String> {
        let para = paragraph_at(&self.doc, path)
            .ok_or_else(|| DocError::InvalidRequest(format!("no paragraph at {path}")))?;
        check_range(&para.text, start, end)?;
        let quoted = para.text.get(start..end).unwrap_or_default().to_string();

        let id = format!("c{}", self.next_comment);
        self.next_comment += 1;
        self.doc.comments.push(HostComment {
            id: id.clone(),
            path: *path,
            start,
            end,
            quoted,
            text: text.to_string(),
        });
        self.revision += 1;
        Ok(id)
    }

    fn insert_paragraph(&mut self, at: Boundary, text: &str) -> Result<()> {
        let node = HostNode::Paragraph(HostParagraph::new(text));
        match at {
            Boundary::Start => {
                self.doc.blocks.insert(0, node);
                // Paragraph indices after the insertion point move by one.
                for c in &mut self.doc.comments {
                    if let Path::Paragraph { index } = &mut c.path {
                        *index += 1;
                    }
                }
            }
            Boundary::End => self.doc.blocks.push(node),
        }
        self.revision += 1;
        Ok(())
    }
}
