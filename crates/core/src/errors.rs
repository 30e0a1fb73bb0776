//! Error types for the branchgate core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Branch opening errors
// ---------------------------------------------------------------------------

/// Errors raised while opening a branch location.
///
/// `BadUrl`, `BranchReferenceForbidden` and `BranchLoop` are security
/// failures: they end the single `open` call and are never retried.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The access policy rejected a URL encountered while opening.
    #[error("URL not permitted by branch access policy: {url}")]
    BadUrl { url: String },

    /// A branch reference was found but the policy does not follow them.
    #[error("branch reference to '{url}' is not permitted by policy")]
    BranchReferenceForbidden { url: String },

    /// A reference or stacking cycle was detected.
    #[error("branch loop detected at '{url}' (visited: {})", .chain.join(" -> "))]
    BranchLoop { url: String, chain: Vec<String> },

    /// More distinct locations were visited than the configured bound.
    #[error("gave up opening branch after {limit} hops (last: '{url}')")]
    HopLimitExceeded { limit: usize, url: String },

    /// No branch exists at the resolved location.
    #[error("not a branch: '{url}': {detail}")]
    NotBranch { url: String, detail: String },

    /// The branch control files are present but unreadable.
    #[error("corrupt branch at '{url}': {detail}")]
    Corrupt { url: String, detail: String },

    /// Underlying transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OpenError {
    /// `true` for the policy-driven failures (bad URL, forbidden reference,
    /// loop, hop limit).
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            Self::BadUrl { .. }
                | Self::BranchReferenceForbidden { .. }
                | Self::BranchLoop { .. }
                | Self::HopLimitExceeded { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from reading branch control files.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport cannot serve URLs with this scheme.
    #[error("unsupported URL scheme for '{url}'")]
    UnsupportedScheme { url: String },

    /// Filesystem error while reading a control file.
    #[error("transport I/O error at '{url}': {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Branch errors
// ---------------------------------------------------------------------------

/// Errors from branch handles and their repositories.
#[derive(Debug, Error)]
pub enum BranchError {
    /// A previous lock holder panicked.
    #[error("branch lock poisoned: {0}")]
    LockPoisoned(String),

    /// The requested revision is not present in the branch or its fallbacks.
    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    /// A revision with this id already exists in the branch.
    #[error("revision already exists: {0}")]
    DuplicateRevision(String),

    #[error("failed to serialise branch data: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Diff errors
// ---------------------------------------------------------------------------

/// Errors from parsing unified diff text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchParseError {
    /// The input contains no recognisable file header.
    #[error("malformed patch header: {0:?}")]
    MalformedPatchHeader(String),

    /// A `@@` line could not be parsed.
    #[error("malformed hunk header: {0:?}")]
    MalformedHunkHeader(String),
}

/// Errors from the diff text store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No stored text has this filename.
    #[error("diff text not found: {0}")]
    NotFound(String),

    /// The filename would escape the store directory.
    #[error("invalid diff filename: {0:?}")]
    InvalidFilename(String),

    /// Filesystem error.
    #[error("diff store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A poisoned in-memory store.
    #[error("diff store lock poisoned")]
    LockPoisoned,
}

/// Errors from merge preview and diff computation.
#[derive(Debug, Error)]
pub enum DiffError {
    /// Branch access failed.
    #[error("diff branch error: {0}")]
    Branch(#[from] BranchError),

    /// Storing or reading diff text failed.
    #[error("diff store error: {0}")]
    Store(#[from] StoreError),

    /// The stored diff text is not valid UTF-8.
    #[error("stored diff text is not valid UTF-8: {0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// Merge detection errors
// ---------------------------------------------------------------------------

/// Errors from merge detection and proposal state changes.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// The branch/proposal catalog failed.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// A branch referenced by id does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// A proposal state transition was not allowed.
    #[error("invalid merge proposal transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Reading the target's ancestry failed.
    #[error("detection branch error: {0}")]
    Branch(#[from] BranchError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON column could not be decoded.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
