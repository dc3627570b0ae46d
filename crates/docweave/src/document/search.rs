//! Per-snapshot search index with literal and pattern modes.
//!
//! The index is built once from a [`Udv`] and thrown away with it. Literal
//! search goes through an inverted token index and returns whole segments;
//! pattern search runs a regular expression over every segment and returns
//! exact byte spans. Every returned hit gets an id unique for the lifetime of
//! the snapshot, which later patch requests use as their anchor.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::udv::{Path, Udv};
use crate::error::{DocError, Result};

pub const DEFAULT_MAX_HITS: usize = 40;
pub const DEFAULT_CONTEXT_BEFORE: usize = 30;
pub const DEFAULT_CONTEXT_AFTER: usize = 50;
pub const DEFAULT_MAX_EXCERPT_CHARS: usize = 200;

const ELLIPSIS: char = '…';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchMode {
    #[default]
    Literal,
    Pattern,
}

/// Knobs for a single search call.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub max_hits: usize,
    /// Pattern mode only; literal search is always case-insensitive.
    pub case_insensitive: bool,
    pub context_before: usize,
    pub context_after: usize,
    pub max_excerpt_chars: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Literal,
            max_hits: DEFAULT_MAX_HITS,
            case_insensitive: false,
            context_before: DEFAULT_CONTEXT_BEFORE,
            context_after: DEFAULT_CONTEXT_AFTER,
            max_excerpt_chars: DEFAULT_MAX_EXCERPT_CHARS,
        }
    }
}

impl SearchOptions {
    pub fn pattern() -> Self {
        Self {
            mode: SearchMode::Pattern,
            ..Default::default()
        }
    }

    pub fn with_max_hits(mut self, n: usize) -> Self {
        self.max_hits = n;
        self
    }

    pub fn with_case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hit {
    pub hit_id: String,
    pub path: Path,
    pub block_id: String,
    pub offset_start: usize,
    pub offset_end: usize,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitCounts {
    pub paragraphs: usize,
    pub cells: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub snapshot_version: u64,
    pub query: String,
    pub mode: SearchMode,
    pub hits: Vec<Hit>,
    pub total_hits: usize,
    pub counts: HitCounts,
    pub truncated: bool,
}

/// A returned hit plus what the resolver needs to re-confirm it later.
#[derive(Debug, Clone)]
pub struct StoredHit {
    pub hit: Hit,
    pub snapshot_version: u64,
    /// Exact substring at `offset_start..offset_end` when the hit was produced.
    pub matched: String,
    /// Segment text before `offset_start`.
    pub prefix: String,
}

struct IndexedSegment {
    path: Path,
    block_id: String,
    text: String,
}

/// Search structures for one snapshot.
pub struct SearchIndex {
    version: u64,
    segments: Vec<IndexedSegment>,
    postings: HashMap<String, Vec<usize>>,
    next_seq: AtomicU64,
}

/// Lowercase, split on whitespace, trim punctuation at both ends.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

impl SearchIndex {
    pub fn build(udv: &Udv) -> Self {
        let segments: Vec<IndexedSegment> = udv
            .segments()
            .into_iter()
            .map(|s| IndexedSegment {
                path: s.path,
                block_id: s.block_id.to_string(),
                text: s.text.to_string(),
            })
            .collect();

        let mut postings: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, seg) in segments.iter().enumerate() {
            for token in tokenize(&seg.text) {
                let list = postings.entry(token).or_default();
                if list.last() != Some(&i) {
                    list.push(i);
                }
            }
        }

        debug!(
            version = udv.version,
            segments = segments.len(),
            terms = postings.len(),
            "Built search index"
        );

        Self {
            version: udv.version,
            segments,
            postings,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Run a query. Returns the wire result and the stored form of each
    /// returned hit for the hit registry.
    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<(SearchResult, Vec<StoredHit>)> {
        let spans = if query.trim().is_empty() {
            Vec::new()
        } else {
            match opts.mode {
                SearchMode::Literal => self.literal_spans(query),
                SearchMode::Pattern => self.pattern_spans(query, opts.case_insensitive)?,
            }
        };

        let mut counts = HitCounts::default();
        for (seg, _, _) in &spans {
            if self.segments[*seg].path.is_cell() {
                counts.cells += 1;
            } else {
                counts.paragraphs += 1;
            }
        }

        let total_hits = spans.len();
        let mut hits = Vec::new();
        let mut stored = Vec::new();
        for (seg_idx, start, end) in spans.into_iter().take(opts.max_hits) {
            let seg = &self.segments[seg_idx];
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let hit = Hit {
                hit_id: format!("h{}-{seq}", self.version),
                path: seg.path,
                block_id: seg.block_id.clone(),
                offset_start: start,
                offset_end: end,
                excerpt: excerpt(&seg.text, start, end, opts),
            };
            stored.push(StoredHit {
                hit: hit.clone(),
                snapshot_version: self.version,
                matched: seg.text.get(start..end).unwrap_or_default().to_string(),
                prefix: seg.text.get(..start).unwrap_or_default().to_string(),
            });
            hits.push(hit);
        }

        debug!(
            query,
            mode = ?opts.mode,
            total_hits,
            returned = hits.len(),
            "Search complete"
        );

        let result = SearchResult {
            snapshot_version: self.version,
            query: query.to_string(),
            mode: opts.mode,
            truncated: total_hits > hits.len(),
            hits,
            total_hits,
            counts,
        };
        Ok((result, stored))
    }

    /// Segments containing every query token, as whole-segment spans.
    fn literal_spans(&self, query: &str) -> Vec<(usize, usize, usize)> {
        let tokens = tokenize(query);
        let Some((first, rest)) = tokens.split_first() else {
            return Vec::new();
        };
        let Some(mut matches) = self.postings.get(first).cloned() else {
            return Vec::new();
        };
        for token in rest {
            let Some(list) = self.postings.get(token) else {
                return Vec::new();
            };
            matches.retain(|i| list.binary_search(i).is_ok());
        }
        matches
            .into_iter()
            .map(|i| (i, 0, self.segments[i].text.len()))
            .collect()
    }

    fn pattern_spans(&self, pattern: &str, case_insensitive: bool) -> Result<Vec<(usize, usize, usize)>> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| DocError::InvalidQuery(e.to_string()))?;
        let mut spans = Vec::new();
        for (i, seg) in self.segments.iter().enumerate() {
            for m in re.find_iter(&seg.text) {
                if m.start() < m.end() {
                    spans.push((i, m.start(), m.end()));
                }
            }
        }
        Ok(spans)
    }
}

/// Context window around `start..end`, capped at `max_excerpt_chars`, with
/// an ellipsis wherever text was cut.
fn excerpt(text: &str, start: usize, end: usize, opts: &SearchOptions) -> String {
    let before = text.get(..start).unwrap_or_default();
    let matched = text.get(start..end).unwrap_or_default();
    let after = text.get(end..).unwrap_or_default();

    let max = opts.max_excerpt_chars;
    let match_chars = matched.chars().count();
    let core: String = matched.chars().take(max).collect();
    let core_cut = match_chars > max;

    let room = max.saturating_sub(match_chars.min(max));
    let want_before = opts.context_before.min(room);
    let want_after = opts.context_after.min(room - want_before);

    let before_chars = before.chars().count();
    let lead: String = before
        .chars()
        .skip(before_chars.saturating_sub(want_before))
        .collect();
    let trail: String = after.chars().take(want_after).collect();

    let mut out = String::new();
    if lead.len() < before.len() {
        out.push(ELLIPSIS);
    }
    out.push_str(&lead);
    out.push_str(&core);
    if core_cut {
        out.push(ELLIPSIS);
    }
    out.push_str(&trail);
    if !core_cut && trail.len() < after.len() {
        out.push(ELLIPSIS);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::host::{HostCell, HostDocument, HostNode, HostParagraph, HostTable};
    use crate::document::udv::build_udv;

    fn index(paragraphs: &[&str]) -> SearchIndex {
        let tree = HostDocument {
            blocks: paragraphs
                .iter()
                .map(|t| HostNode::Paragraph(HostParagraph::new(*t)))
                .collect(),
            comments: vec![],
        };
        SearchIndex::build(&build_udv(&tree, 1, 1).unwrap())
    }

    #[test]
    fn tokenize_trims_punctuation() {
        assert_eq!(tokenize("  Fee, (late) FEE!  "), vec!["fee", "late", "fee"]);
        assert!(tokenize(" -- ").is_empty());
    }

    #[test]
    fn literal_hits_are_whole_segments_containing_every_token() {
        let idx = index(&["The late fee is 5%.", "No fee here", "Late payment"]);
        let (res, stored) = idx.search("late FEE", &SearchOptions::default()).unwrap();
        assert_eq!(res.total_hits, 1);
        let hit = &res.hits[0];
        assert_eq!(hit.path, Path::Paragraph { index: 0 });
        assert_eq!((hit.offset_start, hit.offset_end), (0, 19));
        assert_eq!(stored[0].matched, "The late fee is 5%.");
        assert!(tokenize(&stored[0].matched).contains(&"late".to_string()));
    }

    #[test]
    fn pattern_spans_equal_the_match() {
        let idx = index(&["Pay 10 USD or 20 USD"]);
        let (res, stored) = idx
            .search(r"\d+ USD", &SearchOptions::pattern())
            .unwrap();
        assert_eq!(res.total_hits, 2);
        for (h, s) in res.hits.iter().zip(&stored) {
            assert!(h.offset_start < h.offset_end);
            assert!(s.matched.ends_with("USD"));
        }
        assert_eq!(stored[1].matched, "20 USD");
        assert_eq!(res.hits[1].offset_start, 14);
    }

    #[test]
    fn empty_matches_are_skipped() {
        let idx = index(&["bbb a bb"]);
        let (res, _) = idx.search("a*", &SearchOptions::pattern()).unwrap();
        assert_eq!(res.total_hits, 1);
        assert_eq!(res.hits[0].offset_start, 4);
    }

    #[test]
    fn invalid_pattern_and_empty_query() {
        let idx = index(&["text"]);
        assert!(matches!(
            idx.search("(unclosed", &SearchOptions::pattern()),
            Err(DocError::InvalidQuery(_))
        ));
        let (res, _) = idx.search("   ", &SearchOptions::default()).unwrap();
        assert_eq!(res.total_hits, 0);
        assert!(!res.truncated);
    }

    #[test]
    fn case_insensitive_pattern() {
        let idx = index(&["Late fee", "late FEE"]);
        let (res, _) = idx.search("late fee", &SearchOptions::pattern()).unwrap();
        assert_eq!(res.total_hits, 0);
        let opts = SearchOptions::pattern().with_case_insensitive(true);
        let (res, _) = idx.search("late fee", &opts).unwrap();
        assert_eq!(res.total_hits, 2);
    }

    #[test]
    fn cap_reports_totals_and_counts() {
        let tree = HostDocument {
            blocks: vec![
                HostNode::Paragraph(HostParagraph::new("fee one")),
                HostNode::Table(HostTable {
                    id: None,
                    rows: vec![vec![HostCell::text("fee two"), HostCell::text("fee three")]],
                }),
                HostNode::Paragraph(HostParagraph::new("fee four")),
            ],
            comments: vec![],
        };
        let idx = SearchIndex::build(&build_udv(&tree, 2, 1).unwrap());
        let (res, _) = idx
            .search("fee", &SearchOptions::default().with_max_hits(2))
            .unwrap();
        assert_eq!(res.total_hits, 4);
        assert_eq!(res.hits.len(), 2);
        assert!(res.truncated);
        assert_eq!(res.counts, HitCounts { paragraphs: 2, cells: 2 });
        // Reading order: paragraph 0, then the table's cells.
        assert_eq!(res.hits[0].path, Path::Paragraph { index: 0 });
        assert!(res.hits[1].path.is_cell());
    }

    #[test]
    fn hit_ids_unique_across_searches() {
        let idx = index(&["fee", "fee"]);
        let (a, _) = idx.search("fee", &SearchOptions::default()).unwrap();
        let (b, _) = idx.search("fee", &SearchOptions::default()).unwrap();
        let mut ids: Vec<_> = a.hits.iter().chain(&b.hits).map(|h| h.hit_id.clone()).collect();
        assert_eq!(ids[0], "h1-0");
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn excerpt_windows_and_ellipses() {
        let opts = SearchOptions {
            context_before: 3,
            context_after: 3,
            ..SearchOptions::pattern()
        };
        let text = "aaaaaaaaaa MATCH bbbbbbbbbb";
        assert_eq!(excerpt(text, 11, 16, &opts), "…aa MATCH bb…");

        let capped = SearchOptions {
            max_excerpt_chars: 4,
            ..opts
        };
        assert_eq!(excerpt(text, 11, 16, &capped), "…MATC…");
        assert_eq!(excerpt("MATCH", 0, 5, &SearchOptions::pattern()), "MATCH");
    }
}
