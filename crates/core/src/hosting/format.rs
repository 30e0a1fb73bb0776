//! Control-directory format detection.
//!
//! A [`FormatProber`] inspects a location and says what lives there. The
//! opener only ever consults the probers its caller hands it, never the whole
//! [`ProberRegistry`], so an untrusted location cannot select an arbitrary
//! registered format handler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::transport::{Transport, FORMAT_FILE};
use crate::errors::TransportError;

/// Signature of the current, stackable branch format.
pub const BRANCH_FORMAT_7: &str = "branch format 7";
/// Signature of the legacy branch format that cannot be stacked.
pub const BRANCH_FORMAT_6: &str = "branch format 6";
/// Signature of a branch reference.
pub const REFERENCE_FORMAT: &str = "branch reference format 1";

/// A concrete branch format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFormat {
    pub signature: String,
    pub supports_stacking: bool,
}

impl BranchFormat {
    pub fn stackable() -> Self {
        Self {
            signature: BRANCH_FORMAT_7.to_string(),
            supports_stacking: true,
        }
    }

    pub fn unstackable() -> Self {
        Self {
            signature: BRANCH_FORMAT_6.to_string(),
            supports_stacking: false,
        }
    }
}

impl fmt::Display for BranchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature)
    }
}

/// What a prober found at a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// A branch holding revisions.
    Branch(BranchFormat),
    /// A pointer to another location.
    Reference,
}

/// Recognises one family of control-directory formats.
pub trait FormatProber: Send + Sync {
    /// Registry name, as used in `policy.probers`.
    fn name(&self) -> &str;

    /// Inspect `url`; `Ok(None)` means "not mine".
    fn probe(
        &self,
        transport: &dyn Transport,
        url: &str,
    ) -> Result<Option<ControlKind>, TransportError>;
}

fn read_signature(transport: &dyn Transport, url: &str) -> Result<Option<String>, TransportError> {
    Ok(transport
        .get_text(url, FORMAT_FILE)?
        .and_then(|text| text.lines().next().map(|line| line.trim().to_string())))
}

/// Recognises the built-in branch formats.
#[derive(Debug, Default)]
pub struct BranchFormatProber;

impl FormatProber for BranchFormatProber {
    fn name(&self) -> &str {
        "branch"
    }

    fn probe(
        &self,
        transport: &dyn Transport,
        url: &str,
    ) -> Result<Option<ControlKind>, TransportError> {
        let kind = match read_signature(transport, url)?.as_deref() {
            Some(BRANCH_FORMAT_7) => Some(ControlKind::Branch(BranchFormat::stackable())),
            Some(BRANCH_FORMAT_6) => Some(ControlKind::Branch(BranchFormat::unstackable())),
            _ => None,
        };
        Ok(kind)
    }
}

/// Recognises branch references.
#[derive(Debug, Default)]
pub struct ReferenceFormatProber;

impl FormatProber for ReferenceFormatProber {
    fn name(&self) -> &str {
        "reference"
    }

    fn probe(
        &self,
        transport: &dyn Transport,
        url: &str,
    ) -> Result<Option<ControlKind>, TransportError> {
        match read_signature(transport, url)?.as_deref() {
            Some(REFERENCE_FORMAT) => Ok(Some(ControlKind::Reference)),
            _ => Ok(None),
        }
    }
}

/// Every prober known to the process, by name.
///
/// Callers pick a restricted subset with [`ProberRegistry::select`] and pass
/// only that to the opener.
#[derive(Clone, Default)]
pub struct ProberRegistry {
    probers: BTreeMap<String, Arc<dyn FormatProber>>,
}

impl ProberRegistry {
    /// Registry holding the built-in probers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(BranchFormatProber));
        registry.register(Arc::new(ReferenceFormatProber));
        registry
    }

    pub fn register(&mut self, prober: Arc<dyn FormatProber>) {
        debug!(name = prober.name(), "registering format prober");
        self.probers.insert(prober.name().to_string(), prober);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.probers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.probers.keys().cloned().collect()
    }

    /// The probers named in `names`, in that order. Unknown names are
    /// returned as the error.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn FormatProber>>, String> {
        names
            .iter()
            .map(|name| {
                self.probers
                    .get(name.as_ref())
                    .cloned()
                    .ok_or_else(|| name.as_ref().to_string())
            })
            .collect()
    }
}

impl fmt::Debug for ProberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProberRegistry")
            .field("probers", &self.names())
            .finish()
    }
}
