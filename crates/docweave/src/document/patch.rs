//! Hit resolution and patch application.
//!
//! A patch names a hit id rather than a position. Before anything is written
//! the stored hit is walked through `Requested -> Located -> Confirmed`:
//! the id must still be registered, its path must still address a paragraph,
//! and the substring captured at search time must still be present there.
//! Only then is the edit `Applied`. Any failure leaves the host untouched.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

use super::host::{Boundary, DocumentHost};
use super::search::StoredHit;
use super::udv::Path;
use crate::error::{DocError, Result};

/// Pseudo hit id addressing the position before the first block.
pub const SENTINEL_START: &str = "doc:start";
/// Pseudo hit id addressing the position after the last block.
pub const SENTINEL_END: &str = "doc:end";

pub const DEFAULT_HIT_RETENTION: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PatchRequest {
    ReplaceByHitId { hit_id: String, new_text: String },
    InsertBeforeHitId { hit_id: String, new_text: String },
    InsertAfterHitId { hit_id: String, new_text: String },
    CommentByHitId { hit_id: String, comment: String },
}

impl PatchRequest {
    pub fn hit_id(&self) -> &str {
        match self {
            PatchRequest::ReplaceByHitId { hit_id, .. }
            | PatchRequest::InsertBeforeHitId { hit_id, .. }
            | PatchRequest::InsertAfterHitId { hit_id, .. }
            | PatchRequest::CommentByHitId { hit_id, .. } => hit_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PatchRequest::ReplaceByHitId { .. } => "replace",
            PatchRequest::InsertBeforeHitId { .. } => "insertBefore",
            PatchRequest::InsertAfterHitId { .. } => "insertAfter",
            PatchRequest::CommentByHitId { .. } => "comment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchStage {
    Requested,
    Located,
    Confirmed,
    Applied,
}

/// Why a hit could not be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolveFailure {
    /// Unknown id, or its snapshot has aged out of the registry.
    NotFound,
    PathOutOfRange,
    SubstringDrift,
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolveFailure::NotFound => "not found",
            ResolveFailure::PathOutOfRange => "path out of range",
            ResolveFailure::SubstringDrift => "substring drift",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    pub hit_id: String,
    pub stage: PatchStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    /// Byte range of the text that was written or commented on.
    pub offset_start: usize,
    pub offset_end: usize,
    pub host_revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
}

// ── Hit registry ───────────────────────────────────────────────────

/// Hits of the most recent snapshots, keyed by hit id.
pub struct HitRegistry {
    hits: HashMap<String, StoredHit>,
    versions: VecDeque<u64>,
    retention: usize,
}

impl Default for HitRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HIT_RETENTION)
    }
}

impl HitRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            hits: HashMap::new(),
            versions: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    /// Record hits from a search. Hits from snapshots older than the last
    /// `retention` versions are dropped.
    pub fn record(&mut self, hits: Vec<StoredHit>) {
        for h in hits {
            if !self.versions.contains(&h.snapshot_version) {
                self.versions.push_back(h.snapshot_version);
            }
            self.hits.insert(h.hit.hit_id.clone(), h);
        }
        while self.versions.len() > self.retention {
            if let Some(old) = self.versions.pop_front() {
                self.hits.retain(|_, h| h.snapshot_version != old);
                debug!(version = old, "Expired hits of old snapshot");
            }
        }
    }

    pub fn get(&self, hit_id: &str) -> Option<&StoredHit> {
        self.hits.get(hit_id)
    }

    /// Forget a hit so it cannot be applied again.
    pub fn consume(&mut self, hit_id: &str) -> Option<StoredHit> {
        self.hits.remove(hit_id)
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

// ── Resolution ─────────────────────────────────────────────────────

/// Re-read the hit's paragraph and find the captured substring.
///
/// The substring must still sit at the stored offset. If it moved, the move
/// is accepted only when the text before the hit changed and the substring
/// now occurs exactly once. Returns the confirmed byte range.
pub fn confirm(
    host: &dyn DocumentHost,
    stored: &StoredHit,
) -> std::result::Result<(usize, usize), ResolveFailure> {
    let text = host
        .text_at(&stored.hit.path)
        .ok_or(ResolveFailure::PathOutOfRange)?;
    let needle = stored.matched.as_str();
    if needle.is_empty() {
        return Err(ResolveFailure::SubstringDrift);
    }
    let anchor = stored.hit.offset_start;
    if text.get(anchor..anchor + needle.len()) == Some(needle) {
        return Ok((anchor, anchor + needle.len()));
    }

    let prefix_changed = text.get(..anchor) != Some(stored.prefix.as_str());
    let mut found = text.match_indices(needle).map(|(i, _)| i);
    match (prefix_changed, found.next(), found.next()) {
        (true, Some(i), None) => Ok((i, i + needle.len())),
        _ => Err(ResolveFailure::SubstringDrift),
    }
}

fn stale(hit_id: &str, reason: ResolveFailure) -> DocError {
    warn!(hit_id, %reason, "Hit failed confirmation");
    DocError::HitStale {
        hit_id: hit_id.to_string(),
        reason,
    }
}

/// Resolve the request's hit and apply the edit to the host.
///
/// Replace and comment hits are consumed once applied; their text is gone or
/// already annotated, so a replay fails with `HitStale`.
pub fn apply_patch(
    host: &mut dyn DocumentHost,
    registry: &mut HitRegistry,
    req: &PatchRequest,
) -> Result<PatchOutcome> {
    let hit_id = req.hit_id();
    debug!(hit_id, op = req.kind(), stage = ?PatchStage::Requested, "Patch");

    if hit_id == SENTINEL_START || hit_id == SENTINEL_END {
        return apply_at_boundary(host, req);
    }

    let stored = registry
        .get(hit_id)
        .ok_or_else(|| stale(hit_id, ResolveFailure::NotFound))?;
    let path = stored.hit.path;
    debug!(hit_id, %path, stage = ?PatchStage::Located, "Patch");

    let (start, end) = confirm(host, stored).map_err(|reason| stale(hit_id, reason))?;
    debug!(hit_id, start, end, stage = ?PatchStage::Confirmed, "Patch");

    let (offset_start, offset_end, comment_id) = match req {
        PatchRequest::ReplaceByHitId { new_text, .. } => {
            host.replace_range(&path, start, end, new_text)?;
            (start, start + new_text.len(), None)
        }
        PatchRequest::InsertBeforeHitId { new_text, .. } => {
            host.insert_text(&path, start, new_text)?;
            (start, start + new_text.len(), None)
        }
        PatchRequest::InsertAfterHitId { new_text, .. } => {
            host.insert_text(&path, end, new_text)?;
            (end, end + new_text.len(), None)
        }
        PatchRequest::CommentByHitId { comment, .. } => {
            let id = host.add_comment(&path, start, end, comment)?;
            (start, end, Some(id))
        }
    };

    info!(
        hit_id,
        op = req.kind(),
        %path,
        revision = host.revision(),
        "Patch applied"
    );
    if matches!(
        req,
        PatchRequest::ReplaceByHitId { .. } | PatchRequest::CommentByHitId { .. }
    ) {
        registry.consume(hit_id);
    }

    Ok(PatchOutcome {
        hit_id: hit_id.to_string(),
        stage: PatchStage::Applied,
        path: Some(path),
        offset_start,
        offset_end,
        host_revision: host.revision(),
        comment_id,
    })
}

fn apply_at_boundary(host: &mut dyn DocumentHost, req: &PatchRequest) -> Result<PatchOutcome> {
    let hit_id = req.hit_id();
    let boundary = if hit_id == SENTINEL_START {
        Boundary::Start
    } else {
        Boundary::End
    };
    let text = match req {
        PatchRequest::ReplaceByHitId { new_text, .. }
        | PatchRequest::InsertBeforeHitId { new_text, .. }
        | PatchRequest::InsertAfterHitId { new_text, .. } => new_text,
        PatchRequest::CommentByHitId { .. } => {
            return Err(DocError::InvalidRequest(format!(
                "cannot comment on '{hit_id}'; search for the text to comment on"
            )));
        }
    };
    host.insert_paragraph(boundary, text)?;
    info!(hit_id, revision = host.revision(), "Paragraph inserted at boundary");

    Ok(PatchOutcome {
        hit_id: hit_id.to_string(),
        stage: PatchStage::Applied,
        path: None,
        offset_start: 0,
        offset_end: text.len(),
        host_revision: host.revision(),
        comment_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::host::InMemoryDocument;
    use crate::document::search::{SearchIndex, SearchOptions};
    use crate::document::udv::build_udv;

    fn searched(
        doc: &InMemoryDocument,
        version: u64,
        query: &str,
        opts: &SearchOptions,
        registry: &mut HitRegistry,
    ) -> Vec<String> {
        let udv = build_udv(doc.tree(), version, doc.revision()).unwrap();
        let (res, stored) = SearchIndex::build(&udv).search(query, opts).unwrap();
        registry.record(stored);
        res.hits.into_iter().map(|h| h.hit_id).collect()
    }

    #[test]
    fn request_wire_shape() {
        let req: PatchRequest = serde_json::from_str(
            r#"{"type":"replaceByHitId","hitId":"h1-0","newText":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            PatchRequest::ReplaceByHitId {
                hit_id: "h1-0".into(),
                new_text: "x".into()
            }
        );
        let json = serde_json::to_value(PatchRequest::CommentByHitId {
            hit_id: "h1-0".into(),
            comment: "c".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "commentByHitId");
        assert_eq!(json["hitId"], "h1-0");
    }

    #[test]
    fn replace_immediately_after_search() {
        let mut doc = InMemoryDocument::from_paragraphs(&["Pay 10 USD now", "Other"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, r"10 USD", &SearchOptions::pattern(), &mut reg);
        let out = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: ids[0].clone(),
                new_text: "12 EUR".into(),
            },
        )
        .unwrap();
        assert_eq!(out.stage, PatchStage::Applied);
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("Pay 12 EUR now"));
        assert_eq!((out.offset_start, out.offset_end), (4, 10));
    }

    #[test]
    fn inserts_are_inline_around_the_match() {
        let mut doc = InMemoryDocument::from_paragraphs(&["late fee"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, "fee", &SearchOptions::pattern(), &mut reg);
        apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::InsertAfterHitId {
                hit_id: ids[0].clone(),
                new_text: " (waived)".into(),
            },
        )
        .unwrap();
        apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::InsertBeforeHitId {
                hit_id: ids[0].clone(),
                new_text: "flat ".into(),
            },
        )
        .unwrap();
        assert_eq!(
            doc.text_at(&Path::Paragraph { index: 0 }),
            Some("late flat fee (waived)")
        );
    }

    #[test]
    fn drift_leaves_document_unmodified() {
        let mut doc = InMemoryDocument::from_paragraphs(&["the fee is due"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, "fee", &SearchOptions::pattern(), &mut reg);
        doc.replace_range(&Path::Paragraph { index: 0 }, 4, 7, "charge")
            .unwrap();
        let rev = doc.revision();

        let err = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: ids[0].clone(),
                new_text: "x".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DocError::HitStale {
                reason: ResolveFailure::SubstringDrift,
                ..
            }
        ));
        assert_eq!(doc.revision(), rev);
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("the charge is due"));
    }

    #[test]
    fn unknown_id_and_missing_path() {
        let mut doc = InMemoryDocument::from_paragraphs(&["a", "b fee"]);
        let mut reg = HitRegistry::default();
        let err = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: "h9-9".into(),
                new_text: "x".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DocError::HitStale {
                reason: ResolveFailure::NotFound,
                ..
            }
        ));

        let ids = searched(&doc, 1, "fee", &SearchOptions::default(), &mut reg);
        let mut shorter = InMemoryDocument::from_paragraphs(&["a"]);
        let err = apply_patch(
            &mut shorter,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: ids[0].clone(),
                new_text: "x".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DocError::HitStale {
                reason: ResolveFailure::PathOutOfRange,
                ..
            }
        ));
        assert_eq!(doc.revision(), 1);
    }

    #[test]
    fn moved_match_confirms_only_when_unique() {
        let mut doc = InMemoryDocument::from_paragraphs(&["Pay the fee now"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, "fee", &SearchOptions::pattern(), &mut reg);
        doc.insert_text(&Path::Paragraph { index: 0 }, 0, "Please ").unwrap();
        apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: ids[0].clone(),
                new_text: "charge".into(),
            },
        )
        .unwrap();
        assert_eq!(
            doc.text_at(&Path::Paragraph { index: 0 }),
            Some("Please Pay the charge now")
        );

        let mut doc = InMemoryDocument::from_paragraphs(&["fee, fee, fee"]);
        let ids = searched(&doc, 2, "fee", &SearchOptions::pattern(), &mut reg);
        doc.insert_text(&Path::Paragraph { index: 0 }, 0, "A ").unwrap();
        let rev = doc.revision();
        let err = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: ids[2].clone(),
                new_text: "FEE".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DocError::HitStale {
                reason: ResolveFailure::SubstringDrift,
                ..
            }
        ));
        assert_eq!(doc.revision(), rev);
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("A fee, fee, fee"));
    }

    #[test]
    fn replayed_replace_does_not_touch_a_repeated_match() {
        let mut doc = InMemoryDocument::from_paragraphs(&["fee A, fee B"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, "fee", &SearchOptions::pattern(), &mut reg);
        let replace = |id: &str| PatchRequest::ReplaceByHitId {
            hit_id: id.to_string(),
            new_text: "charge".into(),
        };

        apply_patch(&mut doc, &mut reg, &replace(&ids[0])).unwrap();
        let rev = doc.revision();
        let err = apply_patch(&mut doc, &mut reg, &replace(&ids[0])).unwrap_err();
        assert!(matches!(
            err,
            DocError::HitStale {
                reason: ResolveFailure::NotFound,
                ..
            }
        ));
        assert_eq!(doc.revision(), rev);
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("charge A, fee B"));

        // The second hit moved because the text before it changed.
        apply_patch(&mut doc, &mut reg, &replace(&ids[1])).unwrap();
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("charge A, charge B"));
    }

    #[test]
    fn changed_target_with_unchanged_prefix_is_drift() {
        let mut doc = InMemoryDocument::from_paragraphs(&["fee A, fee B"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, "fee", &SearchOptions::pattern(), &mut reg);
        doc.replace_range(&Path::Paragraph { index: 0 }, 7, 10, "tax").unwrap();
        let rev = doc.revision();

        let err = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::ReplaceByHitId {
                hit_id: ids[1].clone(),
                new_text: "charge".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DocError::HitStale {
                reason: ResolveFailure::SubstringDrift,
                ..
            }
        ));
        assert_eq!(doc.revision(), rev);
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("fee A, tax B"));
    }

    #[test]
    fn sentinels_insert_paragraphs() {
        let mut doc = InMemoryDocument::from_paragraphs(&[]);
        let mut reg = HitRegistry::default();
        apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::InsertAfterHitId {
                hit_id: SENTINEL_END.into(),
                new_text: "Closing".into(),
            },
        )
        .unwrap();
        apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::InsertBeforeHitId {
                hit_id: SENTINEL_START.into(),
                new_text: "Title".into(),
            },
        )
        .unwrap();
        assert_eq!(doc.text_at(&Path::Paragraph { index: 0 }), Some("Title"));
        assert_eq!(doc.text_at(&Path::Paragraph { index: 1 }), Some("Closing"));

        let err = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::CommentByHitId {
                hit_id: SENTINEL_END.into(),
                comment: "x".into(),
            },
        );
        assert!(matches!(err, Err(DocError::InvalidRequest(_))));
    }

    #[test]
    fn comment_anchors_to_confirmed_range() {
        let mut doc = InMemoryDocument::from_paragraphs(&["the late fee applies"]);
        let mut reg = HitRegistry::default();
        let ids = searched(&doc, 1, "late fee", &SearchOptions::pattern(), &mut reg);
        let out = apply_patch(
            &mut doc,
            &mut reg,
            &PatchRequest::CommentByHitId {
                hit_id: ids[0].clone(),
                comment: "confirm amount".into(),
            },
        )
        .unwrap();
        assert_eq!(out.comment_id.as_deref(), Some("c1"));
        assert_eq!(doc.tree().comments[0].quoted, "late fee");
    }

    #[test]
    fn registry_expires_old_snapshots() {
        let doc = InMemoryDocument::from_paragraphs(&["fee"]);
        let mut reg = HitRegistry::new(2);
        let v1 = searched(&doc, 1, "fee", &SearchOptions::default(), &mut reg);
        let v2 = searched(&doc, 2, "fee", &SearchOptions::default(), &mut reg);
        let v3 = searched(&doc, 3, "fee", &SearchOptions::default(), &mut reg);
        assert!(reg.get(&v1[0]).is_none());
        assert!(reg.get(&v2[0]).is_some());
        assert!(reg.get(&v3[0]).is_some());
        assert_eq!(reg.len(), 2);
    }
}
