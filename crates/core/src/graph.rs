//! Ancestry graph algorithms: ancestry sets, lowest common ancestor, and
//! merge-sorted history with dotted revision numbers.
//!
//! All walks are iterative and mark what they visit, so malformed histories
//! (missing parents, cycles) terminate instead of recursing forever.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::revision::{is_null, RevisionId, RevisionSource};

/// Every revision reachable from `tip` (inclusive) that `source` knows about.
pub fn ancestry(source: &dyn RevisionSource, tip: &str) -> HashSet<RevisionId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([tip.to_string()]);
    while let Some(id) = queue.pop_front() {
        if seen.contains(&id) {
            continue;
        }
        let Some(rev) = source.revision(&id) else {
            continue;
        };
        queue.extend(rev.parents.iter().filter(|p| !seen.contains(*p)).cloned());
        seen.insert(id);
    }
    seen
}

/// Lowest common ancestor of `a` and `b`.
///
/// Returns `None` when either side is null or the histories are unrelated.
/// When criss-cross merges leave several candidate heads, the one with the
/// largest ancestry wins, ties broken by the smallest id.
pub fn find_lca(source: &dyn RevisionSource, a: &str, b: &str) -> Option<RevisionId> {
    if is_null(Some(a)) || is_null(Some(b)) {
        return None;
    }
    let ancestry_a = ancestry(source, a);
    if ancestry_a.contains(b) {
        return Some(b.to_string());
    }
    let ancestry_b = ancestry(source, b);
    if ancestry_b.contains(a) {
        return Some(a.to_string());
    }

    let common: HashSet<&RevisionId> = ancestry_a.intersection(&ancestry_b).collect();
    if common.is_empty() {
        debug!(a, b, "no common ancestor");
        return None;
    }

    // Anything reachable from the parents of a common revision is dominated.
    let mut dominated: HashSet<RevisionId> = HashSet::new();
    let mut queue: VecDeque<RevisionId> = common
        .iter()
        .filter_map(|id| source.revision(id))
        .flat_map(|rev| rev.parents.iter().cloned())
        .collect();
    while let Some(id) = queue.pop_front() {
        if !dominated.insert(id.clone()) {
            continue;
        }
        if let Some(rev) = source.revision(&id) {
            queue.extend(rev.parents.iter().cloned());
        }
    }

    let mut heads: Vec<(usize, &RevisionId)> = common
        .into_iter()
        .filter(|id| !dominated.contains(*id))
        .map(|id| (ancestry(source, id).len(), id))
        .collect();
    heads.sort_by(|(size_a, id_a), (size_b, id_b)| size_b.cmp(size_a).then(id_a.cmp(id_b)));
    if heads.len() > 1 {
        debug!(a, b, candidates = heads.len(), "criss-cross merge, picking newest head");
    }
    heads.first().map(|(_, id)| (*id).clone())
}

// ---------------------------------------------------------------------------
// Merge sort
// ---------------------------------------------------------------------------

/// One row of a merge-sorted history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSortEntry {
    pub revision_id: RevisionId,
    /// 0 for mainline revisions, +1 per level of merge nesting.
    pub merge_depth: usize,
    /// `(n,)` on the mainline, `(base, branch, seq)` for merged revisions.
    pub revno: Vec<u32>,
    /// `true` when the next row belongs to a different line of development.
    pub end_of_merge: bool,
}

impl MergeSortEntry {
    pub fn new(revision_id: &str, merge_depth: usize, revno: &[u32], end_of_merge: bool) -> Self {
        Self {
            revision_id: revision_id.to_string(),
            merge_depth,
            revno: revno.to_vec(),
            end_of_merge,
        }
    }
}

/// Merge-sort the history of `tip`, newest first.
///
/// Each mainline revision is followed by the revisions it merged, nested by
/// depth. Dotted revnos are numbered per mainline base in the order merged
/// lines are discovered, oldest mainline first.
pub fn merge_sort(source: &dyn RevisionSource, tip: &str) -> Vec<MergeSortEntry> {
    let mut mainline: Vec<RevisionId> = Vec::new();
    let mut on_mainline: HashSet<RevisionId> = HashSet::new();
    let mut cursor = Some(tip.to_string());
    while let Some(id) = cursor {
        if is_null(Some(&id)) || on_mainline.contains(&id) {
            break;
        }
        let Some(rev) = source.revision(&id) else {
            break;
        };
        cursor = rev.left_parent().map(str::to_string);
        on_mainline.insert(id.clone());
        mainline.push(id);
    }
    mainline.reverse();

    let mut sorter = MergeSorter {
        source,
        claimed: on_mainline,
        mainline_revno: mainline
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx as u32 + 1))
            .collect(),
        bases: HashMap::new(),
        branch_counters: HashMap::new(),
    };

    let mut blocks: Vec<Vec<(RevisionId, usize, Vec<u32>)>> = Vec::with_capacity(mainline.len());
    for (idx, id) in mainline.iter().enumerate() {
        let mut block = vec![(id.clone(), 0, vec![idx as u32 + 1])];
        sorter.collect_merges(id, &mut block);
        blocks.push(block);
    }
    let flat: Vec<(RevisionId, usize, Vec<u32>)> = blocks.into_iter().rev().flatten().collect();

    let mut entries = Vec::with_capacity(flat.len());
    for (idx, (id, depth, revno)) in flat.iter().enumerate() {
        let end_of_merge = match flat.get(idx + 1) {
            None => true,
            Some((next_id, next_depth, _)) => {
                *next_depth < *depth
                    || (*next_depth == *depth
                        && source.revision(id).and_then(|rev| rev.left_parent())
                            != Some(next_id.as_str()))
            }
        };
        entries.push(MergeSortEntry {
            revision_id: id.clone(),
            merge_depth: *depth,
            revno: revno.clone(),
            end_of_merge,
        });
    }
    entries
}

enum Work {
    /// Queue the merge parents of a revision sitting at `depth`.
    Expand { revision_id: RevisionId, depth: usize },
    /// Walk a merged line starting at `start`.
    Line { start: RevisionId, depth: usize },
    /// Append a row.
    Emit { revision_id: RevisionId, depth: usize, revno: Vec<u32> },
}

struct MergeSorter<'a> {
    source: &'a dyn RevisionSource,
    claimed: HashSet<RevisionId>,
    mainline_revno: HashMap<RevisionId, u32>,
    bases: HashMap<RevisionId, u32>,
    branch_counters: HashMap<u32, u32>,
}

impl MergeSorter<'_> {
    fn collect_merges(&mut self, root: &str, out: &mut Vec<(RevisionId, usize, Vec<u32>)>) {
        let mut stack = vec![Work::Expand {
            revision_id: root.to_string(),
            depth: 0,
        }];
        while let Some(work) = stack.pop() {
            match work {
                Work::Emit {
                    revision_id,
                    depth,
                    revno,
                } => out.push((revision_id, depth, revno)),
                Work::Expand { revision_id, depth } => {
                    let Some(rev) = self.source.revision(&revision_id) else {
                        continue;
                    };
                    for parent in rev.merge_parents().iter().rev() {
                        stack.push(Work::Line {
                            start: parent.clone(),
                            depth: depth + 1,
                        });
                    }
                }
                Work::Line { start, depth } => {
                    let (line, stop) = self.claim_line(&start);
                    if line.is_empty() {
                        continue;
                    }
                    let base = stop
                        .and_then(|id| {
                            self.mainline_revno
                                .get(&id)
                                .or_else(|| self.bases.get(&id))
                                .copied()
                        })
                        .unwrap_or(0);
                    let counter = self.branch_counters.entry(base).or_insert(0);
                    *counter += 1;
                    let branch_no = *counter;
                    let len = line.len() as u32;
                    // Pushed oldest first so the newest row pops first.
                    for (idx, id) in line.into_iter().enumerate().rev() {
                        self.bases.insert(id.clone(), base);
                        stack.push(Work::Expand {
                            revision_id: id.clone(),
                            depth,
                        });
                        stack.push(Work::Emit {
                            revision_id: id,
                            depth,
                            revno: vec![base, branch_no, len - idx as u32],
                        });
                    }
                }
            }
        }
    }

    /// Follow left-hand parents from `start` over unclaimed revisions,
    /// claiming them. Returns the line (newest first) and the already-claimed
    /// revision it stopped at, if any.
    fn claim_line(&mut self, start: &str) -> (Vec<RevisionId>, Option<RevisionId>) {
        let mut line = Vec::new();
        let mut cursor = Some(start.to_string());
        while let Some(id) = cursor {
            if self.claimed.contains(&id) {
                return (line, Some(id));
            }
            let Some(rev) = self.source.revision(&id) else {
                return (line, None);
            };
            cursor = rev.left_parent().map(str::to_string);
            self.claimed.insert(id.clone());
            line.push(id);
        }
        (line, None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::revision::{Revision, Tree};

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<RevisionId, Revision> {
        edges
            .iter()
            .map(|(id, parents)| {
                (
                    id.to_string(),
                    Revision {
                        id: id.to_string(),
                        parents: parents.iter().map(|p| p.to_string()).collect(),
                        tree: Tree::new(),
                        message: String::new(),
                    },
                )
            })
            .collect()
    }

    /// base -> trunk -> merge, with branch (off base) merged at merge.
    fn merged_graph() -> BTreeMap<RevisionId, Revision> {
        graph(&[
            ("base", &[]),
            ("trunk", &["base"]),
            ("branch", &["base"]),
            ("merge", &["trunk", "branch"]),
        ])
    }

    #[test]
    fn test_ancestry() {
        let g = merged_graph();
        let anc = ancestry(&g, "merge");
        assert_eq!(anc.len(), 4);
        let anc = ancestry(&g, "branch");
        assert!(anc.contains("base"));
        assert!(!anc.contains("trunk"));
    }

    #[test]
    fn test_ancestry_survives_cycle_and_ghost() {
        let g = graph(&[("a", &["b"]), ("b", &["a", "ghost"])]);
        let anc = ancestry(&g, "a");
        assert_eq!(anc.len(), 2);
    }

    #[test]
    fn test_lca_simple_fork() {
        let g = merged_graph();
        assert_eq!(find_lca(&g, "trunk", "branch").as_deref(), Some("base"));
    }

    #[test]
    fn test_lca_when_one_contains_other() {
        let g = merged_graph();
        assert_eq!(find_lca(&g, "merge", "branch").as_deref(), Some("branch"));
        assert_eq!(find_lca(&g, "base", "merge").as_deref(), Some("base"));
    }

    #[test]
    fn test_lca_unrelated_and_null() {
        let g = graph(&[("a", &[]), ("b", &[])]);
        assert_eq!(find_lca(&g, "a", "b"), None);
        assert_eq!(find_lca(&g, "a", "null:"), None);
    }

    #[test]
    fn test_lca_criss_cross_is_deterministic() {
        let g = graph(&[
            ("root", &[]),
            ("x1", &["root"]),
            ("y1", &["root"]),
            ("x2", &["x1", "y1"]),
            ("y2", &["y1", "x1"]),
        ]);
        assert_eq!(find_lca(&g, "x2", "y2").as_deref(), Some("x1"));
    }

    #[test]
    fn test_merge_sort_linear() {
        let g = graph(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);
        let sorted = merge_sort(&g, "C");
        assert_eq!(
            sorted,
            vec![
                MergeSortEntry::new("C", 0, &[3], false),
                MergeSortEntry::new("B", 0, &[2], false),
                MergeSortEntry::new("A", 0, &[1], true),
            ]
        );
    }

    #[test]
    fn test_merge_sort_with_merge() {
        let g = merged_graph();
        let sorted = merge_sort(&g, "merge");
        assert_eq!(
            sorted,
            vec![
                MergeSortEntry::new("merge", 0, &[3], false),
                MergeSortEntry::new("branch", 1, &[1, 1, 1], true),
                MergeSortEntry::new("trunk", 0, &[2], false),
                MergeSortEntry::new("base", 0, &[1], true),
            ]
        );
    }

    #[test]
    fn test_merge_sort_nested_lines() {
        // feature (2 revs off trunk) merged a fix line before landing.
        let g = graph(&[
            ("t1", &[]),
            ("t2", &["t1"]),
            ("fix", &["t1"]),
            ("f1", &["t1"]),
            ("f2", &["f1", "fix"]),
            ("t3", &["t2", "f2"]),
        ]);
        let sorted = merge_sort(&g, "t3");
        let ids: Vec<(&str, usize)> = sorted
            .iter()
            .map(|e| (e.revision_id.as_str(), e.merge_depth))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("t3", 0),
                ("f2", 1),
                ("fix", 2),
                ("f1", 1),
                ("t2", 0),
                ("t1", 0),
            ]
        );
        assert_eq!(sorted[1].revno, vec![1, 1, 2]);
        assert_eq!(sorted[3].revno, vec![1, 1, 1]);
        assert_eq!(sorted[2].revno, vec![1, 2, 1]);
    }
}
