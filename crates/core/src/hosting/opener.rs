//! Policy-checked branch opening.
//!
//! [`SafeBranchOpener`] resolves a start URL through branch references and
//! stacked-on locations. Every URL it touches is checked against the
//! [`AccessPolicy`] first, and each `open` call tracks the URLs it has
//! visited so reference and stacking cycles fail fast instead of looping.
//!
//! Resolution is an explicit loop, not recursion: one outer iteration per
//! stacking hop, one inner iteration per reference hop, and a hard bound on
//! the total number of hops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::branch::Branch;
use super::format::{BranchFormat, ControlKind, FormatProber};
use super::transport::{
    Transport, LAST_REVISION_FILE, LOCATION_FILE, REVISIONS_FILE, STACKED_ON_FILE,
};
use super::urlutils;
use crate::errors::OpenError;
use crate::policy::{AccessPolicy, BranchLocation};
use crate::revision::{Revision, NULL_REVISION};

/// Default bound on reference plus stacking hops for a single open.
pub const DEFAULT_MAX_HOPS: usize = 32;

/// Told about every URL the opener checks against the policy, in order.
pub trait OpenObserver: Send + Sync {
    fn url_checked(&self, url: &str);
}

/// Observer that keeps the checked URLs for later inspection.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    urls: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.urls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl OpenObserver for RecordingObserver {
    fn url_checked(&self, url: &str) {
        self.urls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(url.to_string());
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Open only the branch itself, without its stacked-on fallbacks.
    pub ignore_fallbacks: bool,
}

/// URLs visited while resolving one chain, in visit order.
#[derive(Debug, Default)]
struct VisitedUrls {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl VisitedUrls {
    /// Record `url`; `false` if it was already visited.
    fn visit(&mut self, url: &str) -> bool {
        if !self.seen.insert(url.to_string()) {
            return false;
        }
        self.order.push(url.to_string());
        true
    }

    fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    fn loop_error(&self, url: &str) -> OpenError {
        warn!(url = %url, chain = ?self.order, "branch loop detected");
        OpenError::BranchLoop {
            url: url.to_string(),
            chain: self.order.clone(),
        }
    }
}

/// URLs visited following branch references for one location.
type ReferenceChain = VisitedUrls;
/// URLs visited following stacked-on locations for one `open` call.
type StackingChain = VisitedUrls;

/// Everything read from one concrete branch location.
struct LoadedBranch {
    url: String,
    format: BranchFormat,
    stacked_on_url: Option<String>,
    tip: Option<String>,
    revisions: Vec<Revision>,
}

/// Opens branches on untrusted locations under an access policy.
pub struct SafeBranchOpener {
    policy: Arc<dyn AccessPolicy>,
    probers: Vec<Arc<dyn FormatProber>>,
    transport: Arc<dyn Transport>,
    observer: Option<Arc<dyn OpenObserver>>,
    max_hops: usize,
}

impl SafeBranchOpener {
    /// `probers` is the complete set consulted at every hop.
    pub fn new(
        policy: Arc<dyn AccessPolicy>,
        probers: Vec<Arc<dyn FormatProber>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            policy,
            probers,
            transport,
            observer: None,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OpenObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn open(&self, url: &str) -> Result<Branch, OpenError> {
        self.open_with(url, OpenOptions::default())
    }

    pub fn open_with(&self, url: &str, options: OpenOptions) -> Result<Branch, OpenError> {
        let start = urlutils::normalize(url);
        if !urlutils::is_absolute(&start) {
            return Err(OpenError::BadUrl { url: start });
        }
        info!(url = %start, ignore_fallbacks = options.ignore_fallbacks, "opening branch");

        let mut stacking = StackingChain::default();
        let mut hops = 0;
        let mut loaded: Vec<LoadedBranch> = Vec::new();
        let mut next = start;
        loop {
            if !stacking.visit(&next) {
                return Err(stacking.loop_error(&next));
            }
            let (url, format) = self.resolve(&next, &mut hops)?;
            if url != next && !stacking.visit(&url) {
                return Err(stacking.loop_error(&url));
            }
            let branch = self.load(url, format)?;

            let fallback = match (&branch.stacked_on_url, options.ignore_fallbacks) {
                (Some(stacked_on), false) => {
                    let location = BranchLocation {
                        url: &branch.url,
                        format: &branch.format,
                    };
                    let (absolute, recurse) =
                        self.policy.transform_fallback_location(&location, stacked_on);
                    if recurse {
                        debug!(url = %branch.url, stacked_on = %absolute, "following stacked-on location");
                        Some(absolute)
                    } else {
                        debug!(url = %branch.url, format = %branch.format, "format cannot stack, ignoring stacked-on location");
                        None
                    }
                }
                _ => None,
            };
            loaded.push(branch);
            match fallback {
                Some(url) => next = url,
                None => break,
            }
        }

        let mut opened: Option<Branch> = None;
        for branch in loaded.into_iter().rev() {
            let revisions = branch
                .revisions
                .into_iter()
                .map(|rev| (rev.id.clone(), rev))
                .collect();
            opened = Some(Branch::assemble(
                &branch.url,
                branch.format,
                branch.stacked_on_url,
                opened.take(),
                branch.tip,
                revisions,
            ));
        }
        let branch = opened.ok_or_else(|| OpenError::NotBranch {
            url: url.to_string(),
            detail: "nothing was opened".to_string(),
        })?;
        info!(url = %branch.url(), chain = ?branch.stacking_chain(), "branch opened");
        Ok(branch)
    }

    /// Follow branch references from `url` to a concrete branch location.
    fn resolve(&self, url: &str, hops: &mut usize) -> Result<(String, BranchFormat), OpenError> {
        let mut references = ReferenceChain::default();
        let mut current = url.to_string();
        loop {
            *hops += 1;
            if *hops > self.max_hops {
                warn!(url = %current, limit = self.max_hops, "hop limit exceeded");
                return Err(OpenError::HopLimitExceeded {
                    limit: self.max_hops,
                    url: current,
                });
            }
            if !references.visit(&current) {
                return Err(references.loop_error(&current));
            }
            self.check_url(&current)?;

            match self.probe(&current)? {
                ControlKind::Branch(format) => return Ok((current, format)),
                ControlKind::Reference => {
                    let location = self
                        .transport
                        .get_text(&current, LOCATION_FILE)?
                        .ok_or_else(|| OpenError::Corrupt {
                            url: current.clone(),
                            detail: "branch reference has no location".to_string(),
                        })?;
                    let target = urlutils::join(&current, &location);
                    if references.contains(&target) {
                        return Err(references.loop_error(&target));
                    }
                    if !self.policy.should_follow_references() {
                        warn!(url = %current, target = %target, "branch references are forbidden");
                        return Err(OpenError::BranchReferenceForbidden { url: current });
                    }
                    debug!(from = %current, to = %target, "following branch reference");
                    current = target;
                }
            }
        }
    }

    fn check_url(&self, url: &str) -> Result<(), OpenError> {
        if let Some(observer) = &self.observer {
            observer.url_checked(url);
        }
        if self.policy.check_one_url(url) {
            Ok(())
        } else {
            Err(OpenError::BadUrl {
                url: url.to_string(),
            })
        }
    }

    /// Ask the restricted prober set what lives at `url`.
    fn probe(&self, url: &str) -> Result<ControlKind, OpenError> {
        for prober in &self.probers {
            if let Some(kind) = prober.probe(self.transport.as_ref(), url)? {
                debug!(url = %url, prober = prober.name(), "format recognised");
                return Ok(kind);
            }
        }
        let names: Vec<&str> = self.probers.iter().map(|p| p.name()).collect();
        Err(OpenError::NotBranch {
            url: url.to_string(),
            detail: format!("no format recognised by probers [{}]", names.join(", ")),
        })
    }

    fn load(&self, url: String, format: BranchFormat) -> Result<LoadedBranch, OpenError> {
        let tip = self
            .transport
            .get_text(&url, LAST_REVISION_FILE)?
            .filter(|tip| tip != NULL_REVISION);
        let revisions = match self.transport.get(&url, REVISIONS_FILE)? {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                serde_json::from_slice::<Vec<Revision>>(&bytes).map_err(|e| {
                    OpenError::Corrupt {
                        url: url.clone(),
                        detail: format!("unreadable revisions: {}", e),
                    }
                })?
            }
            _ => Vec::new(),
        };
        let stacked_on_url = self.transport.get_text(&url, STACKED_ON_FILE)?;
        debug!(
            url = %url,
            tip = tip.as_deref().unwrap_or(NULL_REVISION),
            revisions = revisions.len(),
            "loaded branch"
        );
        Ok(LoadedBranch {
            url,
            format,
            stacked_on_url,
            tip,
            revisions,
        })
    }
}
