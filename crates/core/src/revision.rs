//! Revisions and the trees they record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque revision identifier.
pub type RevisionId = String;

/// Identifier of the empty revision every history starts from.
pub const NULL_REVISION: &str = "null:";

/// File path → text content.
pub type Tree = BTreeMap<String, String>;

/// One committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    /// Left-hand (mainline) parent first, merged parents after it.
    #[serde(default)]
    pub parents: Vec<RevisionId>,
    #[serde(default)]
    pub tree: Tree,
    #[serde(default)]
    pub message: String,
}

impl Revision {
    pub fn left_parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    pub fn merge_parents(&self) -> &[RevisionId] {
        self.parents.get(1..).unwrap_or(&[])
    }
}

/// Anything that can look revisions up by id.
pub trait RevisionSource {
    fn revision(&self, id: &str) -> Option<&Revision>;

    /// Tree recorded at `id`; the null revision and unknown ids give `None`.
    fn tree(&self, id: &str) -> Option<&Tree> {
        self.revision(id).map(|rev| &rev.tree)
    }
}

/// Lookup across several sources, first hit wins.
pub struct CombinedSource<'a> {
    sources: Vec<&'a dyn RevisionSource>,
}

impl<'a> CombinedSource<'a> {
    pub fn new(sources: Vec<&'a dyn RevisionSource>) -> Self {
        Self { sources }
    }
}

impl RevisionSource for CombinedSource<'_> {
    fn revision(&self, id: &str) -> Option<&Revision> {
        self.sources.iter().find_map(|source| source.revision(id))
    }
}

impl RevisionSource for BTreeMap<RevisionId, Revision> {
    fn revision(&self, id: &str) -> Option<&Revision> {
        self.get(id)
    }
}

/// `true` for ids that denote "no revision".
pub fn is_null(id: Option<&str>) -> bool {
    matches!(id, None | Some(NULL_REVISION))
}
