//! Opened branch handles.
//!
//! A [`Branch`] is a cheap, cloneable handle to one branch location and its
//! revision store. Stacked branches hold only their own new revisions and
//! delegate older history to the fallback branch they were opened with.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::format::BranchFormat;
use super::transport::{
    FORMAT_FILE, LAST_REVISION_FILE, REVISIONS_FILE, STACKED_ON_FILE,
};
use crate::errors::BranchError;
use crate::revision::{Revision, RevisionId, RevisionSource, Tree};

#[derive(Debug, Default)]
struct BranchState {
    tip: Option<RevisionId>,
    revisions: BTreeMap<RevisionId, Revision>,
}

struct BranchInner {
    url: String,
    format: BranchFormat,
    stacked_on_url: Option<String>,
    fallback: Option<Branch>,
    state: RwLock<BranchState>,
}

/// Handle to an opened branch.
#[derive(Clone)]
pub struct Branch {
    inner: Arc<BranchInner>,
}

impl Branch {
    /// A new, empty, unstacked branch.
    pub fn new(url: &str, format: BranchFormat) -> Self {
        Self::assemble(url, format, None, None, None, BTreeMap::new())
    }

    pub(crate) fn assemble(
        url: &str,
        format: BranchFormat,
        stacked_on_url: Option<String>,
        fallback: Option<Branch>,
        tip: Option<RevisionId>,
        revisions: BTreeMap<RevisionId, Revision>,
    ) -> Self {
        Self {
            inner: Arc::new(BranchInner {
                url: url.to_string(),
                format,
                stacked_on_url,
                fallback,
                state: RwLock::new(BranchState { tip, revisions }),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn format(&self) -> &BranchFormat {
        &self.inner.format
    }

    /// Stacked-on location as recorded by the branch, possibly relative.
    pub fn stacked_on_url(&self) -> Option<&str> {
        self.inner.stacked_on_url.as_deref()
    }

    /// The branch older history is delegated to, if it was opened.
    pub fn fallback(&self) -> Option<&Branch> {
        self.inner.fallback.as_ref()
    }

    /// `true` if both handles point at the same opened branch.
    pub fn same_branch(&self, other: &Branch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// This branch followed by every fallback below it.
    pub fn chain(&self) -> impl Iterator<Item = &Branch> {
        std::iter::successors(Some(self), |branch| branch.fallback())
    }

    /// URLs of the stacking chain, this branch first.
    pub fn stacking_chain(&self) -> Vec<String> {
        self.chain().map(|branch| branch.url().to_string()).collect()
    }

    pub fn tip_revision_id(&self) -> Result<Option<RevisionId>, BranchError> {
        Ok(self.read_state()?.tip.clone())
    }

    /// Take read locks on this branch and its fallbacks.
    pub fn lock_read(&self) -> Result<ReadLocks<'_>, BranchError> {
        ReadLocks::acquire(&[self])
    }

    /// Record a new revision on top of the current tip and advance the tip.
    pub fn commit(
        &self,
        revision_id: &str,
        tree: Tree,
        merge_parents: &[&str],
        message: &str,
    ) -> Result<RevisionId, BranchError> {
        let mut state = self.write_state()?;
        if state.revisions.contains_key(revision_id) {
            return Err(BranchError::DuplicateRevision(revision_id.to_string()));
        }
        let parents = state
            .tip
            .iter()
            .cloned()
            .chain(merge_parents.iter().map(|id| id.to_string()))
            .collect();
        state.revisions.insert(
            revision_id.to_string(),
            Revision {
                id: revision_id.to_string(),
                parents,
                tree,
                message: message.to_string(),
            },
        );
        state.tip = Some(revision_id.to_string());
        debug!(url = %self.url(), revision = revision_id, "committed revision");
        Ok(revision_id.to_string())
    }

    /// Copy `revision_id` and its ancestry from `other` into this branch's
    /// store without moving the tip. Returns how many revisions were copied.
    pub fn fetch(&self, other: &Branch, revision_id: &str) -> Result<usize, BranchError> {
        if self.same_branch(other) {
            return Ok(0);
        }
        let missing: Vec<Revision> = {
            let locks = ReadLocks::acquire(&[other, self])?;
            if !locks.has_revision(other, revision_id) {
                return Err(BranchError::RevisionNotFound(revision_id.to_string()));
            }
            let mut seen = HashSet::new();
            let mut queue = VecDeque::from([revision_id.to_string()]);
            let mut missing = Vec::new();
            while let Some(id) = queue.pop_front() {
                if !seen.insert(id.clone()) || locks.has_revision(self, &id) {
                    continue;
                }
                if let Some(rev) = locks.revision(&id) {
                    queue.extend(rev.parents.iter().cloned());
                    missing.push(rev.clone());
                }
            }
            missing
        };
        let mut state = self.write_state()?;
        let copied = missing.len();
        for rev in missing {
            state.revisions.entry(rev.id.clone()).or_insert(rev);
        }
        debug!(from = %other.url(), to = %self.url(), copied, "fetched revisions");
        Ok(copied)
    }

    /// Move the tip to a revision already present in the store.
    pub fn set_tip(&self, revision_id: &str) -> Result<(), BranchError> {
        if self.lock_read()?.revision(revision_id).is_none() {
            return Err(BranchError::RevisionNotFound(revision_id.to_string()));
        }
        self.write_state()?.tip = Some(revision_id.to_string());
        Ok(())
    }

    /// Copy this branch, with its full reachable history, to `url`.
    pub fn sprout(&self, url: &str) -> Result<Branch, BranchError> {
        let locks = self.lock_read()?;
        let tip = locks.tip(self).map(str::to_string);
        let revisions = match &tip {
            Some(tip) => collect_ancestry(&locks, tip),
            None => BTreeMap::new(),
        };
        Ok(Self::assemble(
            url,
            self.format().clone(),
            None,
            None,
            tip,
            revisions,
        ))
    }

    /// A new branch at `url` stacked on this one, starting at the same tip.
    pub fn stack_on(&self, url: &str) -> Result<Branch, BranchError> {
        let tip = self.tip_revision_id()?;
        Ok(Self::assemble(
            url,
            BranchFormat::stackable(),
            Some(self.url().to_string()),
            Some(self.clone()),
            tip,
            BTreeMap::new(),
        ))
    }

    /// Control files describing this branch, as read back by the opener.
    /// Only revisions stored locally are written; stacked history stays with
    /// the fallback.
    pub fn control_files(&self) -> Result<Vec<(&'static str, Vec<u8>)>, BranchError> {
        let state = self.read_state()?;
        let revisions: Vec<&Revision> = state.revisions.values().collect();
        let revisions_json = serde_json::to_vec_pretty(&revisions)
            .map_err(|e| BranchError::Serialization(e.to_string()))?;
        let mut files = vec![
            (FORMAT_FILE, format!("{}\n", self.format()).into_bytes()),
            (
                LAST_REVISION_FILE,
                state.tip.clone().unwrap_or_default().into_bytes(),
            ),
            (REVISIONS_FILE, revisions_json),
        ];
        if let Some(stacked_on) = self.stacked_on_url() {
            files.push((STACKED_ON_FILE, stacked_on.as_bytes().to_vec()));
        }
        Ok(files)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, BranchState>, BranchError> {
        self.inner
            .state
            .read()
            .map_err(|e| BranchError::LockPoisoned(format!("{}: {}", self.url(), e)))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, BranchState>, BranchError> {
        self.inner
            .state
            .write()
            .map_err(|e| BranchError::LockPoisoned(format!("{}: {}", self.url(), e)))
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.inner.state.try_write().is_err()
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("url", &self.inner.url)
            .field("format", &self.inner.format.signature)
            .field("stacked_on_url", &self.inner.stacked_on_url)
            .finish()
    }
}

fn collect_ancestry(source: &dyn RevisionSource, tip: &str) -> BTreeMap<RevisionId, Revision> {
    crate::graph::ancestry(source, tip)
        .into_iter()
        .filter_map(|id| source.revision(&id).cloned().map(|rev| (id, rev)))
        .collect()
}

// ---------------------------------------------------------------------------
// Scoped read locks
// ---------------------------------------------------------------------------

/// Read locks over a set of branches and their fallback chains.
///
/// Each distinct branch is locked once, however many times it appears, and
/// every lock is released when the set is dropped. The set doubles as a
/// revision source over all locked stores.
pub struct ReadLocks<'a> {
    entries: Vec<(&'a Branch, RwLockReadGuard<'a, BranchState>)>,
}

impl<'a> ReadLocks<'a> {
    pub fn acquire(branches: &[&'a Branch]) -> Result<Self, BranchError> {
        let mut entries: Vec<(&'a Branch, RwLockReadGuard<'a, BranchState>)> = Vec::new();
        for &branch in branches {
            for member in branch.chain() {
                if entries.iter().any(|(locked, _)| locked.same_branch(member)) {
                    continue;
                }
                let guard = member.read_state()?;
                entries.push((member, guard));
            }
        }
        Ok(Self { entries })
    }

    /// Tip of `branch`, if it is part of this set.
    pub fn tip(&self, branch: &Branch) -> Option<&str> {
        self.entries
            .iter()
            .find(|(locked, _)| locked.same_branch(branch))
            .and_then(|(_, state)| state.tip.as_deref())
    }

    /// `true` if `id` is stored in `branch` or one of its fallbacks.
    pub fn has_revision(&self, branch: &Branch, id: &str) -> bool {
        branch.chain().any(|member| {
            self.entries
                .iter()
                .find(|(locked, _)| locked.same_branch(member))
                .is_some_and(|(_, state)| state.revisions.contains_key(id))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RevisionSource for ReadLocks<'_> {
    fn revision(&self, id: &str) -> Option<&Revision> {
        self.entries
            .iter()
            .find_map(|(_, state)| state.revisions.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(&str, &str)]) -> Tree {
        entries
            .iter()
            .map(|(path, text)| (path.to_string(), text.to_string()))
            .collect()
    }

    #[test]
    fn test_commit_chains_parents() {
        let branch = Branch::new("http://h/trunk", BranchFormat::stackable());
        branch.commit("r1", tree(&[("a", "1\n")]), &[], "first").unwrap();
        branch.commit("r2", tree(&[("a", "2\n")]), &[], "second").unwrap();

        assert_eq!(branch.tip_revision_id().unwrap().as_deref(), Some("r2"));
        let locks = branch.lock_read().unwrap();
        assert_eq!(locks.revision("r2").unwrap().parents, vec!["r1"]);
        assert!(locks.revision("r1").unwrap().parents.is_empty());
    }

    #[test]
    fn test_commit_rejects_duplicate() {
        let branch = Branch::new("http://h/trunk", BranchFormat::stackable());
        branch.commit("r1", Tree::new(), &[], "").unwrap();
        let err = branch.commit("r1", Tree::new(), &[], "").unwrap_err();
        assert!(matches!(err, BranchError::DuplicateRevision(_)));
    }

    #[test]
    fn test_fetch_and_merge() {
        let trunk = Branch::new("http://h/trunk", BranchFormat::stackable());
        trunk.commit("base", tree(&[("a", "1\n")]), &[], "").unwrap();
        let feature = trunk.sprout("http://h/feature").unwrap();
        feature.commit("f1", tree(&[("a", "2\n")]), &[], "").unwrap();

        assert_eq!(trunk.fetch(&feature, "f1").unwrap(), 1);
        trunk.commit("m", tree(&[("a", "2\n")]), &["f1"], "merge").unwrap();

        let locks = trunk.lock_read().unwrap();
        assert_eq!(locks.revision("m").unwrap().parents, vec!["base", "f1"]);
    }

    #[test]
    fn test_fetch_unknown_revision() {
        let a = Branch::new("http://h/a", BranchFormat::stackable());
        let b = Branch::new("http://h/b", BranchFormat::stackable());
        assert!(matches!(
            a.fetch(&b, "nope"),
            Err(BranchError::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_stacked_branch_reads_through_fallback() {
        let base = Branch::new("http://h/base", BranchFormat::stackable());
        base.commit("r1", tree(&[("a", "1\n")]), &[], "").unwrap();
        let stacked = base.stack_on("http://h/stacked").unwrap();
        stacked.commit("r2", tree(&[("a", "2\n")]), &[], "").unwrap();

        assert_eq!(
            stacked.stacking_chain(),
            vec!["http://h/stacked", "http://h/base"]
        );
        let locks = stacked.lock_read().unwrap();
        assert_eq!(locks.len(), 2);
        assert!(locks.revision("r1").is_some());
        assert_eq!(locks.tip(&stacked), Some("r2"));
        assert_eq!(locks.tip(&base), Some("r1"));
    }

    #[test]
    fn test_read_locks_dedupe_and_release() {
        let base = Branch::new("http://h/base", BranchFormat::stackable());
        let stacked = base.stack_on("http://h/stacked").unwrap();
        {
            let locks = ReadLocks::acquire(&[&stacked, &base, &stacked]).unwrap();
            assert_eq!(locks.len(), 2);
            assert!(base.is_locked());
        }
        assert!(!base.is_locked());
        assert!(!stacked.is_locked());
    }

    #[test]
    fn test_control_files() {
        let base = Branch::new("http://h/base", BranchFormat::stackable());
        base.commit("r1", Tree::new(), &[], "").unwrap();
        let stacked = base.stack_on("http://h/stacked").unwrap();
        let files = stacked.control_files().unwrap();
        let names: Vec<&str> = files.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![FORMAT_FILE, LAST_REVISION_FILE, REVISIONS_FILE, STACKED_ON_FILE]
        );
        assert_eq!(files[1].1, b"r1");
        assert_eq!(files[2].1, b"[]");
    }
}
