//! Schema migrations.
//!
//! Migrations are SQL strings applied in order; the SQLite `user_version`
//! pragma records the last one applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "diffs and preview diffs",
        r#"
        CREATE TABLE IF NOT EXISTS diffs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            filename            TEXT,
            size                INTEGER NOT NULL DEFAULT 0,
            lines_count         INTEGER NOT NULL DEFAULT 0,
            diffstat            TEXT,
            added_lines_count   INTEGER,
            removed_lines_count INTEGER
        );

        CREATE TABLE IF NOT EXISTS preview_diffs (
            id                       INTEGER PRIMARY KEY AUTOINCREMENT,
            proposal_id              TEXT    NOT NULL,
            diff_id                  INTEGER NOT NULL REFERENCES diffs (id) ON DELETE CASCADE,
            source_revision_id       TEXT    NOT NULL,
            target_revision_id       TEXT    NOT NULL,
            prerequisite_revision_id TEXT,
            conflicts                TEXT    NOT NULL DEFAULT '',
            created_at               TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_preview_diffs_proposal ON preview_diffs (proposal_id, created_at);
        "#,
    ),
    (
        2,
        "incremental diffs",
        r#"
        CREATE TABLE IF NOT EXISTS incremental_diffs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            proposal_id     TEXT    NOT NULL,
            diff_id         INTEGER NOT NULL REFERENCES diffs (id) ON DELETE CASCADE,
            old_revision_id TEXT    NOT NULL,
            new_revision_id TEXT    NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_incremental_diffs_range
            ON incremental_diffs (proposal_id, old_revision_id, new_revision_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
