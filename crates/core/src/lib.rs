//! branchgate core library.
//!
//! The trust and diff layer of a branch-hosting service: an access policy
//! over branch URLs, a safe opener that follows references and stacking
//! without escaping that policy, merge-preview and incremental diff
//! generation, and ancestry-based merge detection.

pub mod config;
pub mod db;
pub mod detection;
pub mod diff;
pub mod errors;
pub mod graph;
pub mod hosting;
pub mod policy;
pub mod revision;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use detection::{MergeDetector, MergeProposal, ProposalStatus};
pub use diff::{Diff, MergePreviewEngine, PreviewDiff};
pub use errors::CoreError;
pub use hosting::{Branch, SafeBranchOpener};
pub use policy::{AccessPolicy, UrlListPolicy};
