//! Ancestry-based merge detection.
//!
//! After a branch is rescanned, its new ancestry is compared against the
//! tips of its sibling branches and of branches proposed for merging into
//! it. A tip contained in the ancestry has been merged: open proposals move
//! to `Merged` with the mainline revno that brought the tip in, and a branch
//! merged into its product's development focus is itself marked merged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DetectionError;
use crate::graph::{merge_sort, MergeSortEntry};
use crate::hosting::branch::Branch;
use crate::revision::{is_null, RevisionId};

// ---------------------------------------------------------------------------
// Merge proposals
// ---------------------------------------------------------------------------

/// Review state of a merge proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    WorkInProgress,
    NeedsReview,
    CodeApproved,
    Rejected,
    Queued,
    MergeFailed,
    Superseded,
    Merged,
}

impl ProposalStatus {
    /// States a proposal never leaves for a non-final one.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Rejected | Self::Merged | Self::Superseded)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkInProgress => write!(f, "work_in_progress"),
            Self::NeedsReview => write!(f, "needs_review"),
            Self::CodeApproved => write!(f, "code_approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Queued => write!(f, "queued"),
            Self::MergeFailed => write!(f, "merge_failed"),
            Self::Superseded => write!(f, "superseded"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// A request to merge one branch into another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeProposal {
    pub id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub prerequisite_branch: Option<String>,
    pub status: ProposalStatus,
    /// Mainline revno of the target that merged the source.
    pub merged_revno: Option<u32>,
    pub date_merged: Option<DateTime<Utc>>,
}

impl MergeProposal {
    /// A new work-in-progress proposal.
    pub fn new(id: &str, source_branch: &str, target_branch: &str, prerequisite_branch: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            prerequisite_branch: prerequisite_branch.map(str::to_string),
            status: ProposalStatus::WorkInProgress,
            merged_revno: None,
            date_merged: None,
        }
    }

    /// Move to `next`. Final states can only move to other final states.
    pub fn transition_to(&mut self, next: ProposalStatus) -> Result<(), DetectionError> {
        if self.status.is_final() && !next.is_final() {
            return Err(DetectionError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!(proposal = %self.id, from = %self.status, to = %next, "proposal transition");
        self.status = next;
        Ok(())
    }

    pub fn mark_as_merged(&mut self, merged_revno: Option<u32>) -> Result<(), DetectionError> {
        self.transition_to(ProposalStatus::Merged)?;
        self.merged_revno = merged_revno;
        self.date_merged = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Branch records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Experimental,
    #[default]
    Development,
    Mature,
    Merged,
    Abandoned,
}

/// What the detector knows about a hosted branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchRecord {
    pub id: String,
    /// Owning product; branches without one have no siblings.
    pub product: Option<String>,
    pub tip_revision_id: Option<RevisionId>,
    pub lifecycle_status: LifecycleStatus,
}

impl BranchRecord {
    pub fn new(id: &str, product: Option<&str>, tip_revision_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            product: product.map(str::to_string),
            tip_revision_id: tip_revision_id.map(str::to_string),
            lifecycle_status: LifecycleStatus::default(),
        }
    }

    fn live_tip(&self) -> Option<&str> {
        self.tip_revision_id
            .as_deref()
            .filter(|tip| !is_null(Some(tip)))
    }
}

/// The branch and proposal records merge detection reads and updates.
pub trait BranchCatalog: Send + Sync {
    fn branch(&self, id: &str) -> Result<Option<BranchRecord>, DetectionError>;

    /// Every branch of `product`.
    fn product_branches(&self, product: &str) -> Result<Vec<BranchRecord>, DetectionError>;

    /// Proposals from `source` into `target` that are not in a final state.
    fn active_proposals(&self, source: &str, target: &str) -> Result<Vec<MergeProposal>, DetectionError>;

    /// Non-final proposals targeting `target`.
    fn proposals_targeting(&self, target: &str) -> Result<Vec<MergeProposal>, DetectionError>;

    fn save_proposal(&self, proposal: &MergeProposal) -> Result<(), DetectionError>;

    fn set_lifecycle_status(&self, branch: &str, status: LifecycleStatus) -> Result<(), DetectionError>;

    /// The development-focus branch of `product`, if any.
    fn development_focus(&self, product: &str) -> Result<Option<String>, DetectionError>;

    /// `true` if `branch` is linked to a product series.
    fn is_series_branch(&self, branch: &str) -> Result<bool, DetectionError>;

    /// Merge-sorted history of `branch`, newest first.
    fn merge_sorted_revisions(&self, branch: &str) -> Result<Vec<MergeSortEntry>, DetectionError>;
}

/// Told about each proposal marked merged.
pub trait MergeNotifier: Send + Sync {
    fn proposal_merged(&self, proposal: &MergeProposal);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl MergeNotifier for LogNotifier {
    fn proposal_merged(&self, proposal: &MergeProposal) {
        info!(
            proposal = %proposal.id,
            source = %proposal.source_branch,
            target = %proposal.target_branch,
            revno = ?proposal.merged_revno,
            "merge proposal merged"
        );
    }
}

// ---------------------------------------------------------------------------
// In-memory catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CatalogState {
    branches: BTreeMap<String, BranchRecord>,
    proposals: BTreeMap<String, MergeProposal>,
    focus: HashMap<String, String>,
    series: HashSet<String>,
    histories: HashMap<String, Vec<MergeSortEntry>>,
}

/// [`BranchCatalog`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CatalogState>, DetectionError> {
        self.state
            .read()
            .map_err(|e| DetectionError::Catalog(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, CatalogState>, DetectionError> {
        self.state
            .write()
            .map_err(|e| DetectionError::Catalog(format!("lock poisoned: {}", e)))
    }

    pub fn add_branch(&self, record: BranchRecord) -> Result<(), DetectionError> {
        self.write()?.branches.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn add_proposal(&self, proposal: MergeProposal) -> Result<(), DetectionError> {
        self.save_proposal(&proposal)
    }

    pub fn proposal(&self, id: &str) -> Result<Option<MergeProposal>, DetectionError> {
        Ok(self.read()?.proposals.get(id).cloned())
    }

    pub fn set_development_focus(&self, product: &str, branch: &str) -> Result<(), DetectionError> {
        self.write()?
            .focus
            .insert(product.to_string(), branch.to_string());
        Ok(())
    }

    pub fn link_series_branch(&self, branch: &str) -> Result<(), DetectionError> {
        self.write()?.series.insert(branch.to_string());
        Ok(())
    }

    pub fn set_history(&self, branch: &str, entries: Vec<MergeSortEntry>) -> Result<(), DetectionError> {
        self.write()?.histories.insert(branch.to_string(), entries);
        Ok(())
    }

    /// Record the merge-sorted history and tip of an opened branch.
    pub fn record_branch_history(&self, branch_id: &str, branch: &Branch) -> Result<(), DetectionError> {
        let (tip, entries) = {
            let locks = branch.lock_read()?;
            let tip = locks.tip(branch).map(str::to_string);
            let entries = match &tip {
                Some(tip) => merge_sort(&locks, tip),
                None => Vec::new(),
            };
            (tip, entries)
        };
        let mut state = self.write()?;
        if let Some(record) = state.branches.get_mut(branch_id) {
            record.tip_revision_id = tip;
        }
        state.histories.insert(branch_id.to_string(), entries);
        Ok(())
    }
}

impl BranchCatalog for MemoryCatalog {
    fn branch(&self, id: &str) -> Result<Option<BranchRecord>, DetectionError> {
        Ok(self.read()?.branches.get(id).cloned())
    }

    fn product_branches(&self, product: &str) -> Result<Vec<BranchRecord>, DetectionError> {
        Ok(self
            .read()?
            .branches
            .values()
            .filter(|b| b.product.as_deref() == Some(product))
            .cloned()
            .collect())
    }

    fn active_proposals(&self, source: &str, target: &str) -> Result<Vec<MergeProposal>, DetectionError> {
        Ok(self
            .read()?
            .proposals
            .values()
            .filter(|p| p.source_branch == source && p.target_branch == target && !p.status.is_final())
            .cloned()
            .collect())
    }

    fn proposals_targeting(&self, target: &str) -> Result<Vec<MergeProposal>, DetectionError> {
        Ok(self
            .read()?
            .proposals
            .values()
            .filter(|p| p.target_branch == target && !p.status.is_final())
            .cloned()
            .collect())
    }

    fn save_proposal(&self, proposal: &MergeProposal) -> Result<(), DetectionError> {
        self.write()?
            .proposals
            .insert(proposal.id.clone(), proposal.clone());
        Ok(())
    }

    fn set_lifecycle_status(&self, branch: &str, status: LifecycleStatus) -> Result<(), DetectionError> {
        let mut state = self.write()?;
        let record = state
            .branches
            .get_mut(branch)
            .ok_or_else(|| DetectionError::BranchNotFound(branch.to_string()))?;
        record.lifecycle_status = status;
        Ok(())
    }

    fn development_focus(&self, product: &str) -> Result<Option<String>, DetectionError> {
        Ok(self.read()?.focus.get(product).cloned())
    }

    fn is_series_branch(&self, branch: &str) -> Result<bool, DetectionError> {
        Ok(self.read()?.series.contains(branch))
    }

    fn merge_sorted_revisions(&self, branch: &str) -> Result<Vec<MergeSortEntry>, DetectionError> {
        Ok(self.read()?.histories.get(branch).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// A branch finished scanning with the given ancestry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCompleted {
    pub branch_id: String,
    pub new_ancestry: Vec<RevisionId>,
}

/// One detected merge of `source` into `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedMerge {
    pub source_branch: String,
    pub target_branch: String,
    /// Proposals moved to `Merged`.
    pub proposals: Vec<String>,
    pub merged_revno: Option<u32>,
    /// `true` if the source branch's lifecycle was set to `Merged`.
    pub source_marked_merged: bool,
}

/// Outcome of processing one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub merges: Vec<DetectedMerge>,
    /// `(branch id, error)` for each branch whose detection failed.
    pub failures: Vec<(String, String)>,
}

impl ScanReport {
    fn extend(&mut self, other: ScanReport) {
        self.merges.extend(other.merges);
        self.failures.extend(other.failures);
    }
}

/// Mainline revno of the revision that brought `revision_id` into the
/// history.
///
/// `merge_sorted` is newest first, so the merging mainline revision is the
/// closest depth-0 entry at or above the match.
pub fn find_merged_revno(merge_sorted: &[MergeSortEntry], revision_id: &str) -> Option<u32> {
    let mut last_mainline = None;
    for entry in merge_sorted {
        if entry.merge_depth == 0 {
            last_mainline = entry.revno.first().copied();
        }
        if entry.revision_id == revision_id {
            return last_mainline;
        }
    }
    None
}

/// Detects merges from branch scan results.
pub struct MergeDetector {
    catalog: Arc<dyn BranchCatalog>,
    notifier: Arc<dyn MergeNotifier>,
}

impl MergeDetector {
    pub fn new(catalog: Arc<dyn BranchCatalog>) -> Self {
        Self {
            catalog,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn MergeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run both sibling and proposal detection for a scan event.
    pub fn handle_scan_completed(&self, event: &ScanCompleted) -> Result<ScanReport, DetectionError> {
        let scanned = self
            .catalog
            .branch(&event.branch_id)?
            .ok_or_else(|| DetectionError::BranchNotFound(event.branch_id.clone()))?;
        let ancestry: HashSet<RevisionId> = event.new_ancestry.iter().cloned().collect();
        info!(branch = %scanned.id, revisions = ancestry.len(), "processing scan");

        let mut report = self.auto_merge_branches(&scanned, &ancestry)?;
        report.extend(self.auto_merge_proposals(&scanned, &ancestry)?);
        Ok(report)
    }

    /// Detect sibling branches of `scanned` whose tips are in its ancestry.
    ///
    /// Each branch is processed independently; failures are logged and
    /// collected in the report.
    pub fn auto_merge_branches(
        &self,
        scanned: &BranchRecord,
        new_ancestry: &HashSet<RevisionId>,
    ) -> Result<ScanReport, DetectionError> {
        let mut report = ScanReport::default();
        let Some(product) = scanned.product.as_deref() else {
            debug!(branch = %scanned.id, "branch has no product, skipping sibling scan");
            return Ok(report);
        };
        for other in self.catalog.product_branches(product)? {
            if other.id == scanned.id || !self.tip_merged(&other, scanned, new_ancestry) {
                continue;
            }
            if other.lifecycle_status == LifecycleStatus::Merged {
                debug!(branch = %other.id, "already merged, skipping");
                continue;
            }
            self.record(&mut report, &other, scanned, None);
        }
        Ok(report)
    }

    /// Detect open proposals into `scanned` whose source tips are in its
    /// ancestry, wherever the source branch lives.
    pub fn auto_merge_proposals(
        &self,
        scanned: &BranchRecord,
        new_ancestry: &HashSet<RevisionId>,
    ) -> Result<ScanReport, DetectionError> {
        let mut report = ScanReport::default();
        for proposal in self.catalog.proposals_targeting(&scanned.id)? {
            let source = match self.catalog.branch(&proposal.source_branch) {
                Ok(Some(source)) => source,
                Ok(None) => {
                    let err = DetectionError::BranchNotFound(proposal.source_branch.clone());
                    warn!(proposal = %proposal.id, error = %err, "skipping proposal");
                    report.failures.push((proposal.source_branch.clone(), err.to_string()));
                    continue;
                }
                Err(e) => {
                    warn!(proposal = %proposal.id, error = %e, "skipping proposal");
                    report.failures.push((proposal.source_branch.clone(), e.to_string()));
                    continue;
                }
            };
            if self.tip_merged(&source, scanned, new_ancestry) {
                self.record(&mut report, &source, scanned, Some(proposal));
            }
        }
        Ok(report)
    }

    /// Record that `source` was merged into `target`.
    pub fn merge_detected(
        &self,
        source: &BranchRecord,
        target: &BranchRecord,
        proposal: Option<MergeProposal>,
    ) -> Result<DetectedMerge, DetectionError> {
        let proposals = match proposal {
            Some(proposal) => vec![proposal],
            None => self.catalog.active_proposals(&source.id, &target.id)?,
        };

        let mut detected = DetectedMerge {
            source_branch: source.id.clone(),
            target_branch: target.id.clone(),
            proposals: Vec::new(),
            merged_revno: None,
            source_marked_merged: false,
        };

        if !proposals.is_empty() {
            let merge_sorted = self.catalog.merge_sorted_revisions(&target.id)?;
            detected.merged_revno = source
                .live_tip()
                .and_then(|tip| find_merged_revno(&merge_sorted, tip));
            for mut proposal in proposals {
                if proposal.status.is_final() {
                    debug!(proposal = %proposal.id, status = %proposal.status, "proposal already final");
                    continue;
                }
                proposal.mark_as_merged(detected.merged_revno)?;
                self.catalog.save_proposal(&proposal)?;
                self.notifier.proposal_merged(&proposal);
                detected.proposals.push(proposal.id);
            }
        }

        if let Some(product) = target.product.as_deref() {
            let is_focus = self.catalog.development_focus(product)?.as_deref() == Some(target.id.as_str());
            if is_focus && !self.catalog.is_series_branch(&source.id)? {
                self.catalog
                    .set_lifecycle_status(&source.id, LifecycleStatus::Merged)?;
                detected.source_marked_merged = true;
            }
        }

        info!(
            source = %source.id,
            target = %target.id,
            proposals = detected.proposals.len(),
            revno = ?detected.merged_revno,
            "merge detected"
        );
        Ok(detected)
    }

    fn tip_merged(&self, source: &BranchRecord, target: &BranchRecord, ancestry: &HashSet<RevisionId>) -> bool {
        match source.live_tip() {
            Some(tip) => target.live_tip() != Some(tip) && ancestry.contains(tip),
            None => false,
        }
    }

    fn record(
        &self,
        report: &mut ScanReport,
        source: &BranchRecord,
        target: &BranchRecord,
        proposal: Option<MergeProposal>,
    ) {
        match self.merge_detected(source, target, proposal) {
            Ok(merge) => report.merges.push(merge),
            Err(e) => {
                warn!(source = %source.id, target = %target.id, error = %e, "merge detection failed");
                report.failures.push((source.id.clone(), e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::hosting::format::BranchFormat;
    use crate::revision::Tree;

    fn entry(id: &str, depth: usize, revno: &[u32]) -> MergeSortEntry {
        MergeSortEntry::new(id, depth, revno, false)
    }

    #[derive(Default)]
    struct RecordingNotifier {
        merged: Mutex<Vec<String>>,
    }

    impl MergeNotifier for RecordingNotifier {
        fn proposal_merged(&self, proposal: &MergeProposal) {
            self.merged.lock().unwrap().push(proposal.id.clone());
        }
    }

    /// Delegates to a [`MemoryCatalog`] but fails proposal lookups for one
    /// source branch.
    struct FlakyCatalog {
        inner: MemoryCatalog,
        failing_source: String,
    }

    impl BranchCatalog for FlakyCatalog {
        fn branch(&self, id: &str) -> Result<Option<BranchRecord>, DetectionError> {
            self.inner.branch(id)
        }
        fn product_branches(&self, product: &str) -> Result<Vec<BranchRecord>, DetectionError> {
            self.inner.product_branches(product)
        }
        fn active_proposals(&self, source: &str, target: &str) -> Result<Vec<MergeProposal>, DetectionError> {
            if source == self.failing_source {
                return Err(DetectionError::Catalog("connection reset".into()));
            }
            self.inner.active_proposals(source, target)
        }
        fn proposals_targeting(&self, target: &str) -> Result<Vec<MergeProposal>, DetectionError> {
            self.inner.proposals_targeting(target)
        }
        fn save_proposal(&self, proposal: &MergeProposal) -> Result<(), DetectionError> {
            self.inner.save_proposal(proposal)
        }
        fn set_lifecycle_status(&self, branch: &str, status: LifecycleStatus) -> Result<(), DetectionError> {
            self.inner.set_lifecycle_status(branch, status)
        }
        fn development_focus(&self, product: &str) -> Result<Option<String>, DetectionError> {
            self.inner.development_focus(product)
        }
        fn is_series_branch(&self, branch: &str) -> Result<bool, DetectionError> {
            self.inner.is_series_branch(branch)
        }
        fn merge_sorted_revisions(&self, branch: &str) -> Result<Vec<MergeSortEntry>, DetectionError> {
            self.inner.merge_sorted_revisions(branch)
        }
    }

    /// Product "widget": trunk (focus) at "t2", which merged feature tip "f1".
    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        catalog
            .add_branch(BranchRecord::new("trunk", Some("widget"), Some("t2")))
            .unwrap();
        catalog
            .add_branch(BranchRecord::new("feature", Some("widget"), Some("f1")))
            .unwrap();
        catalog.set_development_focus("widget", "trunk").unwrap();
        catalog
            .set_history(
                "trunk",
                vec![entry("t2", 0, &[2]), entry("f1", 1, &[1, 1, 1]), entry("t1", 0, &[1])],
            )
            .unwrap();
        catalog
    }

    fn ancestry(ids: &[&str]) -> HashSet<RevisionId> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_find_merged_revno() {
        let merge_sorted = vec![
            entry("rev-4", 0, &[4]),
            entry("rev-3", 0, &[3]),
            MergeSortEntry::new("rev-3b", 1, &[15, 4, 8], false),
            entry("rev-2", 0, &[2]),
        ];
        assert_eq!(find_merged_revno(&merge_sorted, "rev-3b"), Some(3));
        assert_eq!(find_merged_revno(&merge_sorted, "rev-2"), Some(2));
        assert_eq!(find_merged_revno(&merge_sorted, "rev-9"), None);
    }

    #[test]
    fn test_proposal_transitions() {
        let mut proposal = MergeProposal::new("mp", "feature", "trunk", None);
        proposal.transition_to(ProposalStatus::NeedsReview).unwrap();
        proposal.transition_to(ProposalStatus::NeedsReview).unwrap();
        proposal.transition_to(ProposalStatus::Rejected).unwrap();
        let err = proposal.transition_to(ProposalStatus::NeedsReview).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidTransition { .. }));
        proposal.mark_as_merged(Some(7)).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Merged);
        assert_eq!(proposal.merged_revno, Some(7));
        assert!(proposal.date_merged.is_some());
    }

    #[test]
    fn test_own_tip_is_not_a_merge() {
        let catalog = Arc::new(catalog());
        let detector = MergeDetector::new(catalog.clone());
        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let report = detector.auto_merge_branches(&trunk, &ancestry(&["t2"])).unwrap();
        assert!(report.merges.is_empty());
    }

    #[test]
    fn test_detects_merge_into_focus() {
        let catalog = Arc::new(catalog());
        catalog
            .add_proposal(MergeProposal::new("mp-1", "feature", "trunk", None))
            .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let detector = MergeDetector::new(catalog.clone()).with_notifier(notifier.clone());

        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let report = detector
            .auto_merge_branches(&trunk, &ancestry(&["t1", "f1", "t2"]))
            .unwrap();

        assert_eq!(report.merges.len(), 1);
        let merge = &report.merges[0];
        assert_eq!(merge.source_branch, "feature");
        assert_eq!(merge.proposals, vec!["mp-1"]);
        assert_eq!(merge.merged_revno, Some(2));
        assert!(merge.source_marked_merged);

        let proposal = catalog.proposal("mp-1").unwrap().unwrap();
        assert_eq!(proposal.status, ProposalStatus::Merged);
        assert_eq!(proposal.merged_revno, Some(2));
        assert_eq!(
            catalog.branch("feature").unwrap().unwrap().lifecycle_status,
            LifecycleStatus::Merged
        );
        assert_eq!(*notifier.merged.lock().unwrap(), vec!["mp-1"]);
    }

    #[test]
    fn test_merged_branch_is_skipped() {
        let catalog = Arc::new(catalog());
        catalog
            .set_lifecycle_status("feature", LifecycleStatus::Merged)
            .unwrap();
        let detector = MergeDetector::new(catalog.clone());
        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let report = detector.auto_merge_branches(&trunk, &ancestry(&["f1", "t2"])).unwrap();
        assert!(report.merges.is_empty());
    }

    #[test]
    fn test_abandoned_branch_is_detected() {
        let catalog = Arc::new(catalog());
        catalog
            .set_lifecycle_status("feature", LifecycleStatus::Abandoned)
            .unwrap();
        let detector = MergeDetector::new(catalog.clone());
        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let report = detector
            .auto_merge_branches(&trunk, &ancestry(&["t1", "f1", "t2"]))
            .unwrap();
        assert_eq!(report.merges.len(), 1);
        assert!(report.merges[0].source_marked_merged);
        assert_eq!(
            catalog.branch("feature").unwrap().unwrap().lifecycle_status,
            LifecycleStatus::Merged
        );
    }

    #[test]
    fn test_series_branch_keeps_lifecycle() {
        let catalog = Arc::new(catalog());
        catalog.link_series_branch("feature").unwrap();
        let detector = MergeDetector::new(catalog.clone());
        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let report = detector.auto_merge_branches(&trunk, &ancestry(&["f1", "t2"])).unwrap();
        assert_eq!(report.merges.len(), 1);
        assert!(!report.merges[0].source_marked_merged);
        assert_eq!(
            catalog.branch("feature").unwrap().unwrap().lifecycle_status,
            LifecycleStatus::Development
        );
    }

    #[test]
    fn test_non_focus_target_keeps_lifecycle() {
        let catalog = Arc::new(catalog());
        catalog
            .add_branch(BranchRecord::new("stable", Some("widget"), Some("s9")))
            .unwrap();
        let detector = MergeDetector::new(catalog.clone());
        let stable = catalog.branch("stable").unwrap().unwrap();
        let report = detector.auto_merge_branches(&stable, &ancestry(&["f1", "s9"])).unwrap();
        assert_eq!(report.merges.len(), 1);
        assert_eq!(
            catalog.branch("feature").unwrap().unwrap().lifecycle_status,
            LifecycleStatus::Development
        );
    }

    #[test]
    fn test_final_proposal_not_reopened() {
        let catalog = Arc::new(catalog());
        let mut rejected = MergeProposal::new("mp-r", "feature", "trunk", None);
        rejected.transition_to(ProposalStatus::Rejected).unwrap();
        catalog.add_proposal(rejected.clone()).unwrap();

        let detector = MergeDetector::new(catalog.clone());
        let feature = catalog.branch("feature").unwrap().unwrap();
        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let merge = detector.merge_detected(&feature, &trunk, Some(rejected)).unwrap();
        assert!(merge.proposals.is_empty());
        assert_eq!(
            catalog.proposal("mp-r").unwrap().unwrap().status,
            ProposalStatus::Rejected
        );
    }

    #[test]
    fn test_failure_is_isolated() {
        let inner = catalog();
        inner
            .add_branch(BranchRecord::new("broken", Some("widget"), Some("b1")))
            .unwrap();
        let catalog = Arc::new(FlakyCatalog {
            inner,
            failing_source: "broken".into(),
        });
        let detector = MergeDetector::new(catalog.clone());
        let trunk = catalog.branch("trunk").unwrap().unwrap();
        let report = detector
            .auto_merge_branches(&trunk, &ancestry(&["b1", "f1", "t2"]))
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "broken");
        assert_eq!(report.merges.len(), 1);
        assert_eq!(report.merges[0].source_branch, "feature");
    }

    #[test]
    fn test_scan_completed_detects_outside_proposals() {
        let catalog = Arc::new(catalog());
        catalog
            .add_branch(BranchRecord::new("fork", Some("other-product"), Some("x1")))
            .unwrap();
        catalog
            .add_proposal(MergeProposal::new("mp-fork", "fork", "trunk", None))
            .unwrap();
        let detector = MergeDetector::new(catalog.clone());

        let report = detector
            .handle_scan_completed(&ScanCompleted {
                branch_id: "trunk".into(),
                new_ancestry: vec!["t1".into(), "t2".into(), "x1".into()],
            })
            .unwrap();
        assert_eq!(report.merges.len(), 1);
        assert_eq!(report.merges[0].source_branch, "fork");
        assert_eq!(report.merges[0].proposals, vec!["mp-fork"]);
        assert_eq!(
            catalog.proposal("mp-fork").unwrap().unwrap().status,
            ProposalStatus::Merged
        );
    }

    #[test]
    fn test_scan_completed_unknown_branch() {
        let detector = MergeDetector::new(Arc::new(MemoryCatalog::new()));
        let err = detector
            .handle_scan_completed(&ScanCompleted {
                branch_id: "ghost".into(),
                new_ancestry: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, DetectionError::BranchNotFound(_)));
    }

    #[test]
    fn test_record_branch_history() {
        let branch = Branch::new("http://h/trunk", BranchFormat::stackable());
        branch.commit("t1", Tree::new(), &[], "").unwrap();
        let feature = branch.sprout("http://h/feature").unwrap();
        feature.commit("f1", Tree::new(), &[], "").unwrap();
        branch.fetch(&feature, "f1").unwrap();
        branch.commit("t2", Tree::new(), &["f1"], "").unwrap();

        let catalog = MemoryCatalog::new();
        catalog
            .add_branch(BranchRecord::new("trunk", Some("widget"), None))
            .unwrap();
        catalog.record_branch_history("trunk", &branch).unwrap();
        assert_eq!(
            catalog.branch("trunk").unwrap().unwrap().tip_revision_id.as_deref(),
            Some("t2")
        );
        let history = catalog.merge_sorted_revisions("trunk").unwrap();
        assert_eq!(find_merged_revno(&history, "f1"), Some(2));
    }
}
