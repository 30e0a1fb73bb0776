//! SQLite persistence for computed diffs.
//!
//! Preview and incremental diff rows live in one database under the data
//! directory; the diff text they point at lives beside it in the diff store
//! directory. [`Database::open`] lays out both before the schema is migrated.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::GeneralConfig;
use crate::errors::DatabaseError;

/// Pragmas applied to every file-backed connection.
const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Handle to the diff database.
///
/// The connection is serialized behind a `Mutex`; share the handle through an
/// `Arc` when previews are generated from several worker threads.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Prepare the data directory and diff store directory, then open and
    /// migrate the database at [`GeneralConfig::database_path`].
    pub fn open(general: &GeneralConfig) -> Result<Self, DatabaseError> {
        for dir in [general.data_dir.clone(), general.diff_dir()] {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "creating directory");
                std::fs::create_dir_all(&dir)?;
            }
        }
        let db = Self::new(general.database_path())?;
        db.initialize()?;
        Ok(db)
    }

    /// Open (or create) the database file at `path` without migrating it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening diff database");
        let conn = Connection::open(path)?;
        conn.execute_batch(FILE_PRAGMAS)?;
        Ok(Self::wrap(conn))
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Bring the diff tables up to the latest schema version.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::run_migrations(&self.conn())
    }

    /// Lock the connection. A mutex poisoned by a panicking holder is
    /// recovered; SQLite has already rolled back any open transaction.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("diff database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction, committing only if it returns `Ok`.
    ///
    /// A diff row and the preview or incremental row that owns it are always
    /// written through here, so a failed insert never leaves an orphan diff.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
