//! Access policies for opening untrusted branch locations.
//!
//! An [`AccessPolicy`] answers three questions for the opener:
//!
//! | Question | Method |
//! |----------|--------|
//! | May this URL be touched at all? | [`AccessPolicy::check_one_url`] |
//! | May branch references be followed? | [`AccessPolicy::should_follow_references`] |
//! | Where does a stacked-on location point, and is stacking in effect? | [`AccessPolicy::transform_fallback_location`] |
//!
//! URLs are compared after normalisation, so `http://h/a/` and `http://h/a`
//! are the same location.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::hosting::format::BranchFormat;
use crate::hosting::urlutils;

/// The concrete branch a stacked-on location was read from.
#[derive(Debug, Clone, Copy)]
pub struct BranchLocation<'a> {
    /// Absolute base URL of the branch.
    pub url: &'a str,
    pub format: &'a BranchFormat,
}

/// Decisions the opener defers to.
pub trait AccessPolicy: Send + Sync {
    /// `true` if `url` (already absolute) may be opened.
    fn check_one_url(&self, url: &str) -> bool;

    /// `true` if branch references may be followed.
    fn should_follow_references(&self) -> bool;

    /// Resolve `stacked_on_url` against the branch's own base URL.
    ///
    /// The flag is `false` when the branch format cannot stack, in which case
    /// the stacked-on location is ignored rather than treated as an error.
    fn transform_fallback_location(
        &self,
        branch: &BranchLocation<'_>,
        stacked_on_url: &str,
    ) -> (String, bool) {
        (
            urlutils::join(branch.url, stacked_on_url),
            branch.format.supports_stacking,
        )
    }
}

// ---------------------------------------------------------------------------
// URL list policies
// ---------------------------------------------------------------------------

/// How the URL list of a [`UrlListPolicy`] is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Listed URLs are denied, everything else allowed.
    #[default]
    Blacklist,
    /// Only listed URLs are allowed.
    Whitelist,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blacklist => write!(f, "blacklist"),
            Self::Whitelist => write!(f, "whitelist"),
        }
    }
}

/// Allow/deny by exact URL match, optionally restricted to a set of schemes.
#[derive(Debug, Clone)]
pub struct UrlListPolicy {
    mode: PolicyMode,
    urls: HashSet<String>,
    follow_references: bool,
    /// Lowercase schemes; empty means any scheme.
    allowed_schemes: BTreeSet<String>,
}

impl UrlListPolicy {
    pub fn new<I, S>(mode: PolicyMode, urls: I, follow_references: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            mode,
            urls: urls
                .into_iter()
                .map(|url| urlutils::normalize(url.as_ref()))
                .collect(),
            follow_references,
            allowed_schemes: BTreeSet::new(),
        }
    }

    pub fn blacklist<I, S>(urls: I, follow_references: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(PolicyMode::Blacklist, urls, follow_references)
    }

    pub fn whitelist<I, S>(urls: I, follow_references: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(PolicyMode::Whitelist, urls, follow_references)
    }

    /// Restrict every URL to the given schemes on top of the list check.
    pub fn with_allowed_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_schemes = schemes
            .into_iter()
            .map(|scheme| scheme.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.mode, &config.urls, config.follow_references)
            .with_allowed_schemes(&config.allowed_schemes)
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    fn scheme_allowed(&self, url: &str) -> bool {
        if self.allowed_schemes.is_empty() {
            return true;
        }
        urlutils::scheme(url)
            .map(|scheme| self.allowed_schemes.contains(&scheme.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

impl AccessPolicy for UrlListPolicy {
    fn check_one_url(&self, url: &str) -> bool {
        let url = urlutils::normalize(url);
        if !self.scheme_allowed(&url) {
            warn!(url = %url, "scheme not allowed by policy");
            return false;
        }
        let listed = self.urls.contains(&url);
        let allowed = match self.mode {
            PolicyMode::Blacklist => !listed,
            PolicyMode::Whitelist => listed,
        };
        if allowed {
            debug!(url = %url, mode = %self.mode, "url allowed");
        } else {
            warn!(url = %url, mode = %self.mode, "url rejected by policy");
        }
        allowed
    }

    fn should_follow_references(&self) -> bool {
        self.follow_references
    }
}
