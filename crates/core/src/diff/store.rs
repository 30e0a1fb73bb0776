//! Storage for diff text.
//!
//! Diff rows only carry a filename and size; the text itself lives in a
//! [`DiffStore`]. Filenames are random unless the caller supplies one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;
use uuid::Uuid;

use crate::errors::StoreError;

/// Where stored diff text lives.
pub trait DiffStore: Send + Sync {
    /// Store `content`, returning the filename it was stored under.
    fn put(&self, filename: Option<&str>, content: &[u8]) -> Result<String, StoreError>;

    fn get(&self, filename: &str) -> Result<Vec<u8>, StoreError>;
}

/// A fresh opaque filename.
pub fn random_filename() -> String {
    format!("{}.diff", Uuid::new_v4())
}

fn check_filename(filename: &str) -> Result<(), StoreError> {
    let valid = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidFilename(filename.to_string()))
    }
}

/// Diff text kept in files under one directory.
#[derive(Debug, Clone)]
pub struct FileDiffStore {
    root: PathBuf,
}

impl FileDiffStore {
    /// Store rooted at `root`, created if missing.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DiffStore for FileDiffStore {
    fn put(&self, filename: Option<&str>, content: &[u8]) -> Result<String, StoreError> {
        let filename = match filename {
            Some(name) => name.to_string(),
            None => random_filename(),
        };
        check_filename(&filename)?;
        let path = self.root.join(&filename);
        std::fs::write(&path, content)?;
        debug!(path = %path.display(), bytes = content.len(), "stored diff text");
        Ok(filename)
    }

    fn get(&self, filename: &str) -> Result<Vec<u8>, StoreError> {
        check_filename(filename)?;
        match std::fs::read(self.root.join(filename)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(filename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Diff text kept in memory.
#[derive(Debug, Default)]
pub struct MemoryDiffStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDiffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiffStore for MemoryDiffStore {
    fn put(&self, filename: Option<&str>, content: &[u8]) -> Result<String, StoreError> {
        let filename = match filename {
            Some(name) => name.to_string(),
            None => random_filename(),
        };
        check_filename(&filename)?;
        self.files
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(filename.clone(), content.to_vec());
        Ok(filename)
    }

    fn get(&self, filename: &str) -> Result<Vec<u8>, StoreError> {
        self.files
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(filename)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))
    }
}
