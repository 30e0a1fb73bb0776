//! Read access to branch control files at a location.
//!
//! A location's control directory holds a handful of small files:
//!
//! | File | Meaning |
//! |------|---------|
//! | `format` | format signature, first line |
//! | `location` | target of a branch reference |
//! | `stacked-on` | URL the branch delegates old history to |
//! | `last-revision` | tip revision id (absent or empty = no revisions) |
//! | `revisions` | JSON list of revisions stored at this location |

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::debug;

use super::urlutils;
use crate::errors::TransportError;

pub const FORMAT_FILE: &str = "format";
pub const LOCATION_FILE: &str = "location";
pub const STACKED_ON_FILE: &str = "stacked-on";
pub const LAST_REVISION_FILE: &str = "last-revision";
pub const REVISIONS_FILE: &str = "revisions";

/// Name of the control directory inside a local branch directory.
pub const CONTROL_DIR: &str = ".branchgate";

/// Read-only access to control files, keyed by normalised location URL.
pub trait Transport: Send + Sync {
    /// Read control file `name` at `url`. `Ok(None)` means it does not exist.
    fn get(&self, url: &str, name: &str) -> Result<Option<Vec<u8>>, TransportError>;

    /// Read a control file as trimmed UTF-8 text, treating empty as absent.
    fn get_text(&self, url: &str, name: &str) -> Result<Option<String>, TransportError> {
        Ok(self
            .get(url, name)?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|text| !text.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// Transport backed by a map; used by tests and by embedders that already
/// hold control data in memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    files: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store control file `name` at `url`.
    pub fn put(&self, url: &str, name: &str, content: impl Into<Vec<u8>>) {
        let url = urlutils::normalize(url);
        let mut files = self.files.write().unwrap_or_else(|p| p.into_inner());
        files
            .entry(url)
            .or_default()
            .insert(name.to_string(), content.into());
    }

    /// Remove every control file at `url`.
    pub fn remove(&self, url: &str) {
        let url = urlutils::normalize(url);
        let mut files = self.files.write().unwrap_or_else(|p| p.into_inner());
        files.remove(&url);
    }
}

impl Transport for MemoryTransport {
    fn get(&self, url: &str, name: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let url = urlutils::normalize(url);
        let files = self.files.read().unwrap_or_else(|p| p.into_inner());
        Ok(files.get(&url).and_then(|dir| dir.get(name)).cloned())
    }
}

// ---------------------------------------------------------------------------
// Local filesystem transport
// ---------------------------------------------------------------------------

/// Transport for `file://` URLs. Control files live in
/// `<directory>/.branchgate/<name>`.
#[derive(Debug, Default, Clone)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }

    fn control_path(url: &str, name: &str) -> Result<PathBuf, TransportError> {
        let dir = urlutils::local_path(url).ok_or_else(|| TransportError::UnsupportedScheme {
            url: url.to_string(),
        })?;
        Ok(dir.join(CONTROL_DIR).join(name))
    }

    /// Write control file `name` for the branch directory at `url`, creating
    /// the control directory if needed.
    pub fn put(&self, url: &str, name: &str, content: &[u8]) -> Result<(), TransportError> {
        let path = Self::control_path(url, name)?;
        let io_err = |source| TransportError::Io {
            url: url.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&path, content).map_err(io_err)
    }
}

impl Transport for LocalTransport {
    fn get(&self, url: &str, name: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let path = Self::control_path(url, name)?;
        match std::fs::read(&path) {
            Ok(bytes) => {
                debug!(path = %path.display(), bytes = bytes.len(), "read control file");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TransportError::Io {
                url: url.to_string(),
                source,
            }),
        }
    }
}
