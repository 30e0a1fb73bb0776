//! Diff records and unified-diff rendering.

use std::collections::BTreeSet;
use std::io::Read;

use chrono::{DateTime, Utc};
use diffy::DiffOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::diffstat::{generate_diffstat, totals, Diffstat};
use super::store::DiffStore;
use crate::errors::{DiffError, StoreError};
use crate::revision::{is_null, RevisionId, Tree};

/// Reference to diff text held in a [`DiffStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffAttachment {
    pub filename: String,
    pub size: u64,
}

/// A computed comparison. Never mutated after creation.
///
/// `diffstat`, `added_lines_count` and `removed_lines_count` are either all
/// set or all `None` (the diff text could not be parsed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub text: Option<DiffAttachment>,
    pub lines_count: u64,
    pub diffstat: Option<Diffstat>,
    pub added_lines_count: Option<u32>,
    pub removed_lines_count: Option<u32>,
}

impl Diff {
    /// A diff with no changes and no stored text.
    pub fn empty() -> Self {
        Self {
            text: None,
            lines_count: 0,
            diffstat: Some(Diffstat::new()),
            added_lines_count: Some(0),
            removed_lines_count: Some(0),
        }
    }

    /// Read `size` bytes of diff text from `reader`, store them and compute
    /// statistics. A zero size gives [`Diff::empty`] without storing
    /// anything.
    pub fn from_file<R: Read>(
        store: &dyn DiffStore,
        reader: R,
        size: u64,
        filename: Option<&str>,
    ) -> Result<Self, DiffError> {
        if size == 0 {
            return Ok(Self::empty());
        }
        let mut content = Vec::new();
        reader
            .take(size)
            .read_to_end(&mut content)
            .map_err(StoreError::from)?;

        let filename = store.put(filename, &content)?;
        let (diffstat, added, removed) = match generate_diffstat(&content) {
            Ok(stats) => {
                let (added, removed) = totals(&stats);
                (Some(stats), Some(added), Some(removed))
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "failed to generate diffstat");
                (None, None, None)
            }
        };
        let diff = Self {
            text: Some(DiffAttachment {
                filename,
                size: content.len() as u64,
            }),
            lines_count: count_lines(&content),
            diffstat,
            added_lines_count: added,
            removed_lines_count: removed,
        };
        debug!(lines = diff.lines_count, ?added, ?removed, "diff created");
        Ok(diff)
    }

    /// `true` if stored text is larger than `max_read_size`.
    pub fn is_oversized(&self, max_read_size: u64) -> bool {
        self.text
            .as_ref()
            .is_some_and(|attachment| attachment.size > max_read_size)
    }

    /// Stored text, unless there is none or it is oversized.
    pub fn text(
        &self,
        store: &dyn DiffStore,
        max_read_size: u64,
    ) -> Result<Option<String>, DiffError> {
        let Some(attachment) = &self.text else {
            return Ok(None);
        };
        if self.is_oversized(max_read_size) {
            debug!(filename = %attachment.filename, size = attachment.size, "diff is oversized, not reading text");
            return Ok(None);
        }
        let bytes = store.get(&attachment.filename)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| DiffError::Encoding(e.to_string()))
    }
}

fn count_lines(content: &[u8]) -> u64 {
    let newlines = content.iter().filter(|b| **b == b'\n').count() as u64;
    match content.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

/// The current diff between a proposal's source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewDiff {
    /// Database row id once stored.
    pub id: Option<i64>,
    pub diff: Diff,
    pub source_revision_id: RevisionId,
    pub target_revision_id: RevisionId,
    pub prerequisite_revision_id: Option<RevisionId>,
    /// Newline-terminated conflict descriptors, empty when clean.
    pub conflicts: String,
    pub proposal_id: String,
    pub created_at: DateTime<Utc>,
}

impl PreviewDiff {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// `true` unless the recorded revisions still match the live tips.
    ///
    /// A missing tip and the null revision compare equal.
    pub fn is_stale(
        &self,
        source_tip: Option<&str>,
        target_tip: Option<&str>,
        prerequisite_tip: Option<&str>,
    ) -> bool {
        fn live(id: Option<&str>) -> Option<&str> {
            id.filter(|_| !is_null(id))
        }
        let recorded = (
            live(Some(self.source_revision_id.as_str())),
            live(Some(self.target_revision_id.as_str())),
            live(self.prerequisite_revision_id.as_deref()),
        );
        recorded != (live(source_tip), live(target_tip), live(prerequisite_tip))
    }
}

/// Diff between two revisions of a proposal's source branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalDiff {
    pub id: Option<i64>,
    pub diff: Diff,
    pub proposal_id: String,
    pub old_revision_id: RevisionId,
    pub new_revision_id: RevisionId,
}

/// Render a unified diff of every path that differs between two trees.
pub fn unified_tree_diff(old: &Tree, new: &Tree, context_lines: usize) -> String {
    let paths: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut out = String::new();
    for path in paths {
        let before = old.get(path);
        let after = new.get(path);
        if before == after {
            continue;
        }
        let (action, old_name, new_name) = match (before, after) {
            (None, Some(_)) => ("added", "/dev/null", path.as_str()),
            (Some(_), None) => ("removed", path.as_str(), "/dev/null"),
            _ => ("modified", path.as_str(), path.as_str()),
        };
        out.push_str(&format!(
            "=== {} file '{}'\n--- {}\n+++ {}\n",
            action, path, old_name, new_name
        ));
        let patch = DiffOptions::new()
            .set_context_len(context_lines)
            .create_patch(
                before.map(String::as_str).unwrap_or(""),
                after.map(String::as_str).unwrap_or(""),
            )
            .to_string();
        // diffy writes its own file header; keep only the hunks.
        if let Some(start) = patch.find("\n@@") {
            out.push_str(&patch[start + 1..]);
        }
    }
    out
}
