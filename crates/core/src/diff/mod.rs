//! Diffs, diff statistics and merge previews.

pub mod diffstat;
pub mod merger;
pub mod model;
pub mod preview;
pub mod store;

pub use diffstat::{generate_diffstat, Diffstat};
pub use merger::{Conflict, ConflictKind, Merger};
pub use model::{Diff, DiffAttachment, IncrementalDiff, PreviewDiff};
pub use preview::MergePreviewEngine;
pub use store::{DiffStore, FileDiffStore, MemoryDiffStore};
