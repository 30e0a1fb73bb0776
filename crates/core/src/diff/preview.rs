//! Merge previews and incremental diffs between branches.

use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::merger::{conflicts_text, Conflict, Merger, TreeMerge};
use super::model::{unified_tree_diff, Diff, IncrementalDiff, PreviewDiff};
use super::store::DiffStore;
use crate::config::DiffConfig;
use crate::detection::MergeProposal;
use crate::errors::{BranchError, DiffError};
use crate::graph::find_lca;
use crate::hosting::branch::{Branch, ReadLocks};
use crate::revision::{is_null, RevisionSource, Tree, NULL_REVISION};

/// Computes diffs and merge previews, storing diff text in a [`DiffStore`].
#[derive(Clone)]
pub struct MergePreviewEngine {
    store: Arc<dyn DiffStore>,
    config: DiffConfig,
}

impl MergePreviewEngine {
    pub fn new(store: Arc<dyn DiffStore>, config: DiffConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &dyn DiffStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Diff two trees and store the text.
    pub fn from_trees(
        &self,
        old: &Tree,
        new: &Tree,
        filename: Option<&str>,
    ) -> Result<Diff, DiffError> {
        let text = unified_tree_diff(old, new, self.config.context_lines);
        self.from_file(text.as_bytes(), text.len() as u64, filename)
    }

    pub fn from_file<R: Read>(
        &self,
        reader: R,
        size: u64,
        filename: Option<&str>,
    ) -> Result<Diff, DiffError> {
        Diff::from_file(self.store.as_ref(), reader, size, filename)
    }

    /// Stored text of `diff`, unless it exceeds `max_read_size`.
    pub fn diff_text(&self, diff: &Diff) -> Result<Option<String>, DiffError> {
        diff.text(self.store.as_ref(), self.config.max_read_size)
    }

    /// Preview merging `source_revision` into `target`.
    ///
    /// With a prerequisite, the diff starts from the target merged with the
    /// part of the prerequisite that `source_revision` already contains, so
    /// prerequisite changes are not shown. All branches stay read-locked for
    /// the whole computation.
    pub fn merge_preview_from_branches(
        &self,
        source: &Branch,
        source_revision: &str,
        target: &Branch,
        prerequisite: Option<&Branch>,
    ) -> Result<(Diff, Vec<Conflict>), DiffError> {
        let mut branches = vec![source, target];
        branches.extend(prerequisite);
        let locks = ReadLocks::acquire(&branches)?;
        info!(
            source = %source.url(),
            target = %target.url(),
            revision = source_revision,
            "computing merge preview"
        );
        let (from_tree, to) = preview_trees(&locks, source_revision, target, prerequisite)?;
        let diff = self.from_trees(&from_tree, &to.tree, None)?;
        Ok((diff, to.conflicts))
    }

    /// Diff `old_revision` → `new_revision` of `source`, leaving out changes
    /// merged in from any of `ignore_branches`.
    pub fn generate_incremental_diff(
        &self,
        old_revision: &str,
        new_revision: &str,
        source: &Branch,
        ignore_branches: &[&Branch],
    ) -> Result<Diff, DiffError> {
        let mut branches = vec![source];
        branches.extend_from_slice(ignore_branches);
        let locks = ReadLocks::acquire(&branches)?;
        info!(
            source = %source.url(),
            old = old_revision,
            new = new_revision,
            ignored = ignore_branches.len(),
            "computing incremental diff"
        );

        let mut merge_target = tree_at(&locks, Some(old_revision))?;
        for branch in ignore_branches {
            let Some(ignore_tip) = locks.tip(branch) else {
                continue;
            };
            let Some(merge_point) = find_lca(&locks, new_revision, ignore_tip) else {
                debug!(branch = %branch.url(), "ignored branch shares no history");
                continue;
            };
            let base_id = find_lca(&locks, old_revision, &merge_point);
            let base = tree_at(&locks, base_id.as_deref())?;
            let other = tree_at(&locks, Some(&merge_point))?;
            merge_target = Merger::merge_trees(&base, &merge_target, &other).tree;
        }
        let to_tree = tree_at(&locks, Some(new_revision))?;
        self.from_trees(&merge_target, &to_tree, None)
    }

    /// Incremental diff for a proposal, ignoring its target and prerequisite.
    pub fn incremental_diff_for_proposal(
        &self,
        proposal: &MergeProposal,
        source: &Branch,
        target: &Branch,
        prerequisite: Option<&Branch>,
        old_revision: &str,
        new_revision: &str,
    ) -> Result<IncrementalDiff, DiffError> {
        let mut ignore = vec![target];
        ignore.extend(prerequisite);
        let diff = self.generate_incremental_diff(old_revision, new_revision, source, &ignore)?;
        Ok(IncrementalDiff {
            id: None,
            diff,
            proposal_id: proposal.id.clone(),
            old_revision_id: old_revision.to_string(),
            new_revision_id: new_revision.to_string(),
        })
    }
}

impl PreviewDiff {
    /// Preview the proposal's source tip merged into its target, recording
    /// the tips the preview was computed from.
    pub fn from_proposal(
        engine: &MergePreviewEngine,
        proposal: &MergeProposal,
        source: &Branch,
        target: &Branch,
        prerequisite: Option<&Branch>,
    ) -> Result<Self, DiffError> {
        let mut branches = vec![source, target];
        branches.extend(prerequisite);
        let locks = ReadLocks::acquire(&branches)?;
        let source_revision = locks
            .tip(source)
            .ok_or_else(|| BranchError::RevisionNotFound(NULL_REVISION.to_string()))?
            .to_string();
        let target_revision = locks.tip(target).unwrap_or(NULL_REVISION).to_string();
        let prerequisite_revision = prerequisite.and_then(|p| locks.tip(p)).map(str::to_string);

        let (from_tree, to) = preview_trees(&locks, &source_revision, target, prerequisite)?;
        let diff = engine.from_trees(&from_tree, &to.tree, Some(&preview_filename()))?;
        info!(
            proposal = %proposal.id,
            conflicts = to.conflicts.len(),
            "preview diff generated"
        );
        Ok(Self {
            id: None,
            diff,
            source_revision_id: source_revision,
            target_revision_id: target_revision,
            prerequisite_revision_id: prerequisite_revision,
            conflicts: conflicts_text(&to.conflicts),
            proposal_id: proposal.id.clone(),
            created_at: Utc::now(),
        })
    }
}

fn preview_filename() -> String {
    format!("preview-{}", super::store::random_filename())
}

/// The (from, to) trees of a merge preview.
fn preview_trees(
    locks: &ReadLocks<'_>,
    source_revision: &str,
    target: &Branch,
    prerequisite: Option<&Branch>,
) -> Result<(Tree, TreeMerge), BranchError> {
    let target_tip = locks.tip(target);
    let target_tree = tree_at(locks, target_tip)?;
    let from_tree = match prerequisite.and_then(|p| locks.tip(p)) {
        Some(prerequisite_tip) => match find_lca(locks, source_revision, prerequisite_tip) {
            Some(point) => merge_into(locks, &target_tree, target_tip, &point)?.tree,
            None => target_tree.clone(),
        },
        None => target_tree.clone(),
    };
    let to = merge_into(locks, &target_tree, target_tip, source_revision)?;
    Ok((from_tree, to))
}

/// Merge `revision` into a target tree, based on their common ancestor.
fn merge_into(
    source: &dyn RevisionSource,
    target_tree: &Tree,
    target_tip: Option<&str>,
    revision: &str,
) -> Result<TreeMerge, BranchError> {
    let other = tree_at(source, Some(revision))?;
    let base_id = target_tip.and_then(|tip| find_lca(source, revision, tip));
    let base = tree_at(source, base_id.as_deref())?;
    Ok(Merger::merge_trees(&base, target_tree, &other))
}

fn tree_at(source: &dyn RevisionSource, revision: Option<&str>) -> Result<Tree, BranchError> {
    match revision {
        id if is_null(id) => Ok(Tree::new()),
        Some(id) => source
            .tree(id)
            .cloned()
            .ok_or_else(|| BranchError::RevisionNotFound(id.to_string())),
        None => Ok(Tree::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{MergeProposal, ProposalStatus};
    use crate::diff::diffstat::Diffstat;
    use crate::diff::store::MemoryDiffStore;
    use crate::hosting::format::BranchFormat;

    fn engine() -> MergePreviewEngine {
        MergePreviewEngine::new(Arc::new(MemoryDiffStore::new()), DiffConfig::default())
    }

    fn commit_file(branch: &Branch, id: &str, path: &str, text: &str, merged: &[&str]) -> String {
        let mut tree = {
            let locks = branch.lock_read().unwrap();
            locks
                .tip(branch)
                .and_then(|tip| locks.tree(tip))
                .cloned()
                .unwrap_or_default()
        };
        tree.insert(path.to_string(), text.to_string());
        branch.commit(id, tree, merged, "").unwrap()
    }

    /// target: "a" → "c a"; source (from first target rev): "d a b".
    fn example_merge() -> (Branch, String, Branch, String) {
        let target = Branch::new("http://h/target", BranchFormat::stackable());
        commit_file(&target, "t1", "foo", "a\n", &[]);
        let source = target.sprout("http://h/source").unwrap();
        let source_rev = commit_file(&source, "s1", "foo", "d\na\nb\n", &[]);
        let target_rev = commit_file(&target, "t2", "foo", "c\na\n", &[]);
        (source, source_rev, target, target_rev)
    }

    fn prerequisite_merge() -> (Branch, String, Branch, Branch) {
        let target = Branch::new("http://h/target", BranchFormat::stackable());
        commit_file(&target, "t1", "file", "target text\n", &[]);
        let prerequisite = target.sprout("http://h/prereq").unwrap();
        commit_file(&prerequisite, "p1", "file", "target text\nprerequisite text\n", &[]);
        let source = prerequisite.sprout("http://h/source").unwrap();
        let source_rev = commit_file(
            &source,
            "s1",
            "file",
            "target text\nprerequisite text\nsource text\n",
            &[],
        );
        (source, source_rev, target, prerequisite)
    }

    fn proposal() -> MergeProposal {
        MergeProposal::new("mp-1", "source", "target", None)
    }

    #[test]
    fn test_merge_preview_with_conflicts() {
        let engine = engine();
        let (source, source_rev, target, _) = example_merge();
        let (diff, conflicts) = engine
            .merge_preview_from_branches(&source, &source_rev, &target, None)
            .unwrap();
        let text = engine.diff_text(&diff).unwrap().unwrap();
        assert!(text.contains("+b\n"));
        assert!(!text.contains("+a\n"));
        assert!(text.contains("+<<<<<<< TREE\n c\n+=======\n+d\n+>>>>>>> MERGE-SOURCE\n"));
        assert_eq!(conflicts_text(&conflicts), "Text conflict in foo\n");

        let expected: Diffstat = [("foo".to_string(), (5, 0))].into_iter().collect();
        assert_eq!(diff.diffstat, Some(expected));
    }

    #[test]
    fn test_merge_preview_without_conflicts() {
        let engine = engine();
        let target = Branch::new("http://h/target", BranchFormat::stackable());
        commit_file(&target, "t1", "foo", "a\n", &[]);
        let source = target.sprout("http://h/source").unwrap();
        let source_rev = commit_file(&source, "s1", "foo", "a\nb\n", &[]);
        commit_file(&target, "t2", "foo", "c\na\n", &[]);
        let (diff, conflicts) = engine
            .merge_preview_from_branches(&source, &source_rev, &target, None)
            .unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(diff.added_lines_count, Some(1));
    }

    #[test]
    fn test_merge_preview_with_prerequisite() {
        let engine = engine();
        let (source, source_rev, target, prerequisite) = prerequisite_merge();
        let (diff, _) = engine
            .merge_preview_from_branches(&source, &source_rev, &target, Some(&prerequisite))
            .unwrap();
        let text = engine.diff_text(&diff).unwrap().unwrap();
        assert!(text.contains("+source text\n"));
        assert!(!text.contains("+prerequisite text\n"));
    }

    #[test]
    fn test_merge_preview_with_newer_prerequisite() {
        let engine = engine();
        let (source, source_rev, target, prerequisite) = prerequisite_merge();
        commit_file(&prerequisite, "p2", "file", "prerequisite text2\n", &[]);
        let (diff, _) = engine
            .merge_preview_from_branches(&source, &source_rev, &target, Some(&prerequisite))
            .unwrap();
        let text = engine.diff_text(&diff).unwrap().unwrap();
        assert!(!text.contains("-prerequisite text2\n"));
        assert!(text.contains("+source text\n"));
        assert!(!text.contains("+prerequisite text\n"));
    }

    #[test]
    fn test_merged_source_gives_empty_diff() {
        let engine = engine();
        let target = Branch::new("http://h/target", BranchFormat::stackable());
        let rev = commit_file(&target, "t1", "foo", "a\n", &[]);
        let source = target.sprout("http://h/source").unwrap();
        let (diff, conflicts) = engine
            .merge_preview_from_branches(&source, &rev, &target, None)
            .unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(diff.lines_count, 0);
        assert!(diff.text.is_none());
    }

    #[test]
    fn test_locks_released_on_error() {
        let engine = engine();
        let (source, _, target, _) = example_merge();
        let err = engine
            .merge_preview_from_branches(&source, "missing", &target, None)
            .unwrap_err();
        assert!(matches!(err, DiffError::Branch(BranchError::RevisionNotFound(_))));
        assert!(!source.is_locked());
        assert!(!target.is_locked());
    }

    #[test]
    fn test_preview_diff_from_proposal() {
        let engine = engine();
        let (source, source_rev, target, target_rev) = example_merge();
        let preview = PreviewDiff::from_proposal(&engine, &proposal(), &source, &target, None).unwrap();
        assert_eq!(preview.source_revision_id, source_rev);
        assert_eq!(preview.target_revision_id, target_rev);
        assert_eq!(preview.prerequisite_revision_id, None);
        assert_eq!(preview.conflicts, "Text conflict in foo\n");
        assert!(preview.has_conflicts());
        assert!(!preview.is_stale(Some(source_rev.as_str()), Some(target_rev.as_str()), None));
        assert!(preview
            .diff
            .text
            .as_ref()
            .is_some_and(|t| t.filename.starts_with("preview-")));

        commit_file(&target, "t3", "foo", "z\n", &[]);
        let tip = target.tip_revision_id().unwrap();
        assert!(preview.is_stale(Some(source_rev.as_str()), tip.as_deref(), None));
        assert_eq!(proposal().status, ProposalStatus::WorkInProgress);
    }

    #[test]
    fn test_preview_against_empty_target_is_fresh() {
        let engine = engine();
        let target = Branch::new("http://h/target", BranchFormat::stackable());
        let source = Branch::new("http://h/source", BranchFormat::stackable());
        let source_rev = commit_file(&source, "s1", "foo", "a\n", &[]);

        let preview = PreviewDiff::from_proposal(&engine, &proposal(), &source, &target, None).unwrap();
        assert_eq!(preview.target_revision_id, NULL_REVISION);
        assert_eq!(preview.diff.added_lines_count, Some(1));

        let target_tip = target.tip_revision_id().unwrap();
        assert!(target_tip.is_none());
        assert!(!preview.is_stale(Some(source_rev.as_str()), target_tip.as_deref(), None));
    }

    #[test]
    fn test_incremental_diff_ignores_target_and_prerequisite() {
        let engine = engine();
        let target = Branch::new("http://h/target", BranchFormat::stackable());
        let old = commit_file(&target, "t1", "foo", "a\nb\ne\n", &[]);
        let source = target.sprout("http://h/source").unwrap();
        commit_file(&source, "s1", "foo", "a\nc\ne\n", &[]);
        let prerequisite = target.sprout("http://h/prereq").unwrap();
        let prereq_rev = commit_file(&prerequisite, "p1", "foo", "d\na\nb\ne\n", &[]);
        let merge_parent = commit_file(&target, "t2", "foo", "a\nb\ne\nf\n", &[]);
        source.fetch(&target, &merge_parent).unwrap();
        commit_file(&source, "s2", "foo", "a\nc\ne\nf\n", &[merge_parent.as_str()]);
        source.fetch(&prerequisite, &prereq_rev).unwrap();
        let new = commit_file(&source, "s3", "foo", "d\na\nc\ne\nf\n", &[prereq_rev.as_str()]);

        let incremental = engine
            .incremental_diff_for_proposal(
                &proposal(),
                &source,
                &target,
                Some(&prerequisite),
                &old,
                &new,
            )
            .unwrap();
        assert_eq!(incremental.old_revision_id, "t1");
        assert_eq!(incremental.new_revision_id, "s3");
        let text = engine.diff_text(&incremental.diff).unwrap().unwrap();
        let inserted: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .collect();
        let removed: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---"))
            .collect();
        assert_eq!(inserted, vec!["+c"]);
        assert_eq!(removed, vec!["-b"]);
    }

    #[test]
    fn test_oversized_preview_keeps_stats() {
        let config = DiffConfig {
            max_read_size: 8,
            ..DiffConfig::default()
        };
        let engine = MergePreviewEngine::new(Arc::new(MemoryDiffStore::new()), config);
        let (source, source_rev, target, _) = example_merge();
        let (diff, _) = engine
            .merge_preview_from_branches(&source, &source_rev, &target, None)
            .unwrap();
        assert!(diff.is_oversized(8));
        assert_eq!(engine.diff_text(&diff).unwrap(), None);
        assert_eq!(diff.added_lines_count, Some(5));
    }
}
