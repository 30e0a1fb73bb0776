//! Three-way merging of files and trees.
//!
//! File merges are line based (`diffy`). Conflicted regions are written with
//! `<<<<<<< TREE` / `=======` / `>>>>>>> MERGE-SOURCE` markers, TREE being
//! the side merged into.

use std::collections::BTreeSet;
use std::fmt;

use diffy::{ConflictStyle, MergeOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::revision::Tree;

pub const THIS_MARKER: &str = "<<<<<<< TREE";
pub const OTHER_MARKER: &str = ">>>>>>> MERGE-SOURCE";

/// Outcome of merging one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMerge {
    /// Merged text, with conflict markers if `has_conflicts`.
    pub text: String,
    pub has_conflicts: bool,
}

/// Kind of conflict left in a merged tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Overlapping line edits.
    Text,
    /// One side modified a file the other side deleted.
    Contents,
    /// Both sides added the same path with different content.
    Duplicate,
}

/// One conflict descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConflictKind::Text => write!(f, "Text conflict in {}", self.path),
            ConflictKind::Contents => write!(f, "Contents conflict in {}", self.path),
            ConflictKind::Duplicate => write!(f, "Duplicate entry {}", self.path),
        }
    }
}

/// One descriptor per line, each newline-terminated.
pub fn conflicts_text(conflicts: &[Conflict]) -> String {
    conflicts.iter().map(|c| format!("{}\n", c)).collect()
}

/// A merged tree plus the conflicts left in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeMerge {
    pub tree: Tree,
    pub conflicts: Vec<Conflict>,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `other`'s changes since `base` into `this`.
    pub fn three_way_merge(base: &str, this: &str, other: &str) -> FileMerge {
        if this == base || this == other {
            return FileMerge {
                text: other.to_string(),
                has_conflicts: false,
            };
        }
        if other == base {
            return FileMerge {
                text: this.to_string(),
                has_conflicts: false,
            };
        }

        match MergeOptions::new()
            .set_conflict_style(ConflictStyle::Merge)
            .merge(base, this, other)
        {
            Ok(text) => FileMerge {
                text,
                has_conflicts: false,
            },
            Err(text) => FileMerge {
                text: relabel_markers(&text),
                has_conflicts: true,
            },
        }
    }

    /// Merge every path of `other` into `this` against `base`.
    pub fn merge_trees(base: &Tree, this: &Tree, other: &Tree) -> TreeMerge {
        let paths: BTreeSet<&String> = base.keys().chain(this.keys()).chain(other.keys()).collect();
        let mut merged = TreeMerge::default();
        for path in paths {
            let b = base.get(path);
            let t = this.get(path);
            let o = other.get(path);
            let (content, kind) = match (b, t, o) {
                _ if t == o => (t.cloned(), None),
                _ if t == b => (o.cloned(), None),
                _ if o == b => (t.cloned(), None),
                (Some(b), Some(t), Some(o)) => {
                    let file = Self::three_way_merge(b, t, o);
                    let kind = file.has_conflicts.then_some(ConflictKind::Text);
                    (Some(file.text), kind)
                }
                (None, Some(t), Some(o)) => {
                    let file = Self::three_way_merge("", t, o);
                    let kind = file.has_conflicts.then_some(ConflictKind::Duplicate);
                    (Some(file.text), kind)
                }
                // Modified on one side, deleted on the other: keep the edit.
                (Some(_), Some(kept), None) | (Some(_), None, Some(kept)) => {
                    (Some(kept.clone()), Some(ConflictKind::Contents))
                }
                _ => (t.cloned(), None),
            };
            if let Some(kind) = kind {
                debug!(path = %path, ?kind, "merge conflict");
                merged.conflicts.push(Conflict {
                    path: path.clone(),
                    kind,
                });
            }
            if let Some(content) = content {
                merged.tree.insert(path.clone(), content);
            }
        }
        merged
    }
}

fn relabel_markers(text: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            let (body, ending) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            match body {
                "<<<<<<< ours" => format!("{}{}", THIS_MARKER, ending),
                ">>>>>>> theirs" => format!("{}{}", OTHER_MARKER, ending),
                _ => line.to_string(),
            }
        })
        .collect()
}
