//! Unified Document View: a flattened, immutable snapshot of the host tree.
//!
//! A [`Udv`] lists paragraphs and tables in reading order with positional
//! [`Path`]s back into the host. It is rebuilt from scratch whenever the host
//! revision moves; nothing ever edits a snapshot in place.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::host::{HostDocument, HostNode, HostParagraph, Mark};
use crate::error::{DocError, Result};

/// Positional address of one paragraph in the host tree.
///
/// Indices are host-level: `index` counts every top-level paragraph node and
/// `table_index` every table node, empty ones included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Path {
    Paragraph {
        index: usize,
    },
    Cell {
        table_index: usize,
        row_index: usize,
        col_index: usize,
        paragraph_in_cell: usize,
    },
}

impl Path {
    pub fn is_cell(&self) -> bool {
        matches!(self, Path::Cell { .. })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Paragraph { index } => write!(f, "paragraph[{index}]"),
            Path::Cell {
                table_index,
                row_index,
                col_index,
                paragraph_in_cell,
            } => write!(
                f,
                "table[{table_index}].cell[{row_index},{col_index}].p[{paragraph_in_cell}]"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellParagraph {
    pub index_in_cell: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdvCell {
    pub row: usize,
    pub col: usize,
    pub paragraphs: Vec<CellParagraph>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Block {
    Paragraph {
        block_id: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        style: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        marks: Vec<Mark>,
    },
    Table {
        block_id: String,
        table_index: usize,
        rows: usize,
        cols: usize,
        cells: Vec<UdvCell>,
    },
}

impl Block {
    pub fn block_id(&self) -> &str {
        match self {
            Block::Paragraph { block_id, .. } | Block::Table { block_id, .. } => block_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdvMeta {
    pub host_revision: u64,
    pub paragraph_count: usize,
    pub table_count: usize,
    pub cell_count: usize,
    pub char_count: usize,
    pub built_at: String,
}

/// An immutable snapshot of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Udv {
    pub version: u64,
    pub blocks: Vec<Block>,
    pub meta: UdvMeta,
}

/// One searchable unit: a top-level paragraph or a paragraph inside a cell.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub path: Path,
    pub block_id: &'a str,
    pub text: &'a str,
}

impl Udv {
    /// Segments in reading order (paragraph order, then row, col, in-cell index).
    pub fn segments(&self) -> Vec<Segment<'_>> {
        let mut out = Vec::new();
        for block in &self.blocks {
            match block {
                Block::Paragraph {
                    block_id,
                    index,
                    text,
                    ..
                } => out.push(Segment {
                    path: Path::Paragraph { index: *index },
                    block_id,
                    text,
                }),
                Block::Table {
                    block_id,
                    table_index,
                    cells,
                    ..
                } => {
                    for cell in cells {
                        for p in &cell.paragraphs {
                            out.push(Segment {
                                path: Path::Cell {
                                    table_index: *table_index,
                                    row_index: cell.row,
                                    col_index: cell.col,
                                    paragraph_in_cell: p.index_in_cell,
                                },
                                block_id,
                                text: &p.text,
                            });
                        }
                    }
                }
            }
        }
        out
    }

    /// Compact plain-text rendering, one line per segment.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        for seg in self.segments() {
            out.push_str(&format!("[{}] {}\n", seg.block_id, seg.text));
        }
        out
    }
}

// ── Builder ────────────────────────────────────────────────────────

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn validate_marks(p: &HostParagraph, at: &str) -> Result<()> {
    for m in &p.marks {
        if m.start > m.end {
            return Err(DocError::MalformedDocument(format!(
                "{at}: inverted mark {}..{} ({})",
                m.start, m.end, m.kind
            )));
        }
        if m.end > p.text.len() {
            return Err(DocError::MalformedDocument(format!(
                "{at}: mark {}..{} exceeds text length {}",
                m.start,
                m.end,
                p.text.len()
            )));
        }
        if !p.text.is_char_boundary(m.start) || !p.text.is_char_boundary(m.end) {
            return Err(DocError::MalformedDocument(format!(
                "{at}: mark {}..{} splits a character",
                m.start, m.end
            )));
        }
    }
    Ok(())
}

fn claim_id(seen: &mut HashSet<String>, id: &Option<String>) -> Result<()> {
    if let Some(id) = id
        && !seen.insert(id.clone())
    {
        return Err(DocError::MalformedDocument(format!("duplicate node id '{id}'")));
    }
    Ok(())
}

/// Flatten a host tree into a [`Udv`].
///
/// Blank paragraphs and cells are dropped, along with tables that end up with
/// no cells. Any structural problem fails the whole build.
pub fn build_udv(tree: &HostDocument, version: u64, host_revision: u64) -> Result<Udv> {
    let mut seen_ids = HashSet::new();
    let mut blocks = Vec::new();
    let mut paragraph_index = 0usize;
    let mut table_index = 0usize;
    let (mut cell_count, mut char_count) = (0usize, 0usize);

    for node in &tree.blocks {
        match node {
            HostNode::Paragraph(p) => {
                let index = paragraph_index;
                paragraph_index += 1;
                validate_marks(p, &format!("paragraph {index}"))?;
                claim_id(&mut seen_ids, &p.id)?;
                if is_blank(&p.text) {
                    continue;
                }
                char_count += p.text.chars().count();
                blocks.push(Block::Paragraph {
                    block_id: p.id.clone().unwrap_or_else(|| format!("p{index}")),
                    index,
                    style: p.style.clone(),
                    text: p.text.clone(),
                    marks: p.marks.clone(),
                });
            }
            HostNode::Table(t) => {
                let ti = table_index;
                table_index += 1;
                claim_id(&mut seen_ids, &t.id)?;

                let mut cells = Vec::new();
                let mut cols = 0usize;
                for (r, row) in t.rows.iter().enumerate() {
                    if row.is_empty() {
                        return Err(DocError::MalformedDocument(format!(
                            "table {ti}: row {r} has no cells"
                        )));
                    }
                    cols = cols.max(row.len());
                    for (c, cell) in row.iter().enumerate() {
                        let mut paragraphs = Vec::new();
                        for (k, p) in cell.paragraphs.iter().enumerate() {
                            validate_marks(p, &format!("table {ti} cell {r},{c} paragraph {k}"))?;
                            claim_id(&mut seen_ids, &p.id)?;
                            if is_blank(&p.text) {
                                continue;
                            }
                            char_count += p.text.chars().count();
                            paragraphs.push(CellParagraph {
                                index_in_cell: k,
                                text: p.text.clone(),
                            });
                        }
                        if !paragraphs.is_empty() {
                            cells.push(UdvCell {
                                row: r,
                                col: c,
                                paragraphs,
                            });
                        }
                    }
                }

                if cells.is_empty() {
                    continue;
                }
                cell_count += cells.len();
                blocks.push(Block::Table {
                    block_id: t.id.clone().unwrap_or_else(|| format!("t{ti}")),
                    table_index: ti,
                    rows: t.rows.len(),
                    cols,
                    cells,
                });
            }
        }
    }

    let paragraph_count = blocks
        .iter()
        .filter(|b| matches!(b, Block::Paragraph { .. }))
        .count();
    let table_count = blocks.len() - paragraph_count;

    Ok(Udv {
        version,
        blocks,
        meta: UdvMeta {
            host_revision,
            paragraph_count,
            table_count,
            cell_count,
            char_count,
            built_at: chrono::Utc::now().to_rfc3339(),
        },
    })
}
