//! Typed query helpers for the diff tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::diff::{Diff, DiffAttachment, Diffstat, IncrementalDiff, PreviewDiff};
use crate::errors::DatabaseError;

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Columns of the `diffs` table as stored; `diffstat` is still JSON.
struct DiffRow {
    filename: Option<String>,
    size: i64,
    lines_count: i64,
    diffstat: Option<String>,
    added_lines_count: Option<u32>,
    removed_lines_count: Option<u32>,
}

impl DiffRow {
    /// Read the six diff columns starting at `offset`.
    fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            filename: row.get(offset)?,
            size: row.get(offset + 1)?,
            lines_count: row.get(offset + 2)?,
            diffstat: row.get(offset + 3)?,
            added_lines_count: row.get(offset + 4)?,
            removed_lines_count: row.get(offset + 5)?,
        })
    }

    fn into_diff(self) -> Result<Diff, DatabaseError> {
        let diffstat = self
            .diffstat
            .as_deref()
            .map(serde_json::from_str::<Diffstat>)
            .transpose()?;
        Ok(Diff {
            text: self.filename.map(|filename| DiffAttachment {
                filename,
                size: self.size.max(0) as u64,
            }),
            lines_count: self.lines_count.max(0) as u64,
            diffstat,
            added_lines_count: self.added_lines_count,
            removed_lines_count: self.removed_lines_count,
        })
    }
}

const DIFF_COLUMNS: &str =
    "d.filename, d.size, d.lines_count, d.diffstat, d.added_lines_count, d.removed_lines_count";

fn insert_diff(conn: &Connection, diff: &Diff) -> Result<i64, DatabaseError> {
    let diffstat = diff.diffstat.as_ref().map(serde_json::to_string).transpose()?;
    let (filename, size) = match &diff.text {
        Some(attachment) => (Some(attachment.filename.as_str()), attachment.size as i64),
        None => (None, 0),
    };
    conn.execute(
        "INSERT INTO diffs (filename, size, lines_count, diffstat, added_lines_count, removed_lines_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            filename,
            size,
            diff.lines_count as i64,
            diffstat,
            diff.added_lines_count,
            diff.removed_lines_count
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- preview_diffs ------------------------------------------------------

    /// Store a preview diff and its diff record, returning the preview's id.
    pub fn insert_preview_diff(&self, preview: &PreviewDiff) -> Result<i64, DatabaseError> {
        let id = self.transaction(|conn| {
            let diff_id = insert_diff(conn, &preview.diff)?;
            conn.execute(
                "INSERT INTO preview_diffs (proposal_id, diff_id, source_revision_id, target_revision_id,
                 prerequisite_revision_id, conflicts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    preview.proposal_id,
                    diff_id,
                    preview.source_revision_id,
                    preview.target_revision_id,
                    preview.prerequisite_revision_id,
                    preview.conflicts,
                    preview.created_at.to_rfc3339()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(id, proposal = %preview.proposal_id, "inserted preview diff");
        Ok(id)
    }

    /// The most recently created preview diff of `proposal_id`.
    pub fn current_preview_diff(&self, proposal_id: &str) -> Result<Option<PreviewDiff>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT p.id, p.source_revision_id, p.target_revision_id, p.prerequisite_revision_id,
             p.conflicts, p.created_at, {}
             FROM preview_diffs p JOIN diffs d ON d.id = p.diff_id
             WHERE p.proposal_id = ?1
             ORDER BY p.created_at DESC, p.id DESC LIMIT 1",
            DIFF_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![proposal_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    DiffRow::read(row, 6)?,
                ))
            })
            .optional()?;

        let Some((id, source, target, prerequisite, conflicts, created_at, diff)) = row else {
            return Ok(None);
        };
        Ok(Some(PreviewDiff {
            id: Some(id),
            diff: diff.into_diff()?,
            source_revision_id: source,
            target_revision_id: target,
            prerequisite_revision_id: prerequisite,
            conflicts,
            proposal_id: proposal_id.to_string(),
            created_at: parse_datetime(&created_at),
        }))
    }

    // -- incremental_diffs --------------------------------------------------

    /// Store an incremental diff, returning its id.
    pub fn insert_incremental_diff(&self, incremental: &IncrementalDiff) -> Result<i64, DatabaseError> {
        let id = self.transaction(|conn| {
            let diff_id = insert_diff(conn, &incremental.diff)?;
            conn.execute(
                "INSERT INTO incremental_diffs (proposal_id, diff_id, old_revision_id, new_revision_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    incremental.proposal_id,
                    diff_id,
                    incremental.old_revision_id,
                    incremental.new_revision_id
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(
            id,
            proposal = %incremental.proposal_id,
            old = %incremental.old_revision_id,
            new = %incremental.new_revision_id,
            "inserted incremental diff"
        );
        Ok(id)
    }

    /// Every incremental diff of `proposal_id`, oldest first.
    pub fn incremental_diffs_for(&self, proposal_id: &str) -> Result<Vec<IncrementalDiff>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT i.id, i.old_revision_id, i.new_revision_id, {}
             FROM incremental_diffs i JOIN diffs d ON d.id = i.diff_id
             WHERE i.proposal_id = ?1
             ORDER BY i.id",
            DIFF_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![proposal_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                DiffRow::read(row, 3)?,
            ))
        })?;

        let mut diffs = Vec::new();
        for row in rows {
            let (id, old_revision_id, new_revision_id, diff) = row?;
            diffs.push(IncrementalDiff {
                id: Some(id),
                diff: diff.into_diff()?,
                proposal_id: proposal_id.to_string(),
                old_revision_id,
                new_revision_id,
            });
        }
        Ok(diffs)
    }

    /// The incremental diff covering exactly `old..new`, if one was stored.
    pub fn incremental_diff(
        &self,
        proposal_id: &str,
        old_revision_id: &str,
        new_revision_id: &str,
    ) -> Result<Option<IncrementalDiff>, DatabaseError> {
        Ok(self
            .incremental_diffs_for(proposal_id)?
            .into_iter()
            .find(|d| d.old_revision_id == old_revision_id && d.new_revision_id == new_revision_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sample_diff() -> Diff {
        let mut diffstat = Diffstat::new();
        diffstat.insert("foo".into(), (5, 0));
        Diff {
            text: Some(DiffAttachment {
                filename: "preview.diff".into(),
                size: 120,
            }),
            lines_count: 9,
            diffstat: Some(diffstat),
            added_lines_count: Some(5),
            removed_lines_count: Some(0),
        }
    }

    fn preview(source: &str, created_at: DateTime<Utc>) -> PreviewDiff {
        PreviewDiff {
            id: None,
            diff: sample_diff(),
            source_revision_id: source.into(),
            target_revision_id: "target-1".into(),
            prerequisite_revision_id: None,
            conflicts: "Text conflict in foo\n".into(),
            proposal_id: "mp-1".into(),
            created_at,
        }
    }

    #[test]
    fn test_preview_diff_round_trip() {
        let db = setup_db();
        let stored = preview("source-1", Utc::now());
        let id = db.insert_preview_diff(&stored).unwrap();
        assert!(id > 0);

        let loaded = db.current_preview_diff("mp-1").unwrap().unwrap();
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.diff, stored.diff);
        assert_eq!(loaded.conflicts, stored.conflicts);
        assert!(loaded.has_conflicts());
        assert_eq!(loaded.prerequisite_revision_id, None);
    }

    #[test]
    fn test_current_preview_diff_is_newest() {
        let db = setup_db();
        let now = Utc::now();
        db.insert_preview_diff(&preview("newer", now)).unwrap();
        db.insert_preview_diff(&preview("older", now - Duration::hours(1))).unwrap();

        let current = db.current_preview_diff("mp-1").unwrap().unwrap();
        assert_eq!(current.source_revision_id, "newer");
        assert!(db.current_preview_diff("mp-unknown").unwrap().is_none());
    }

    #[test]
    fn test_unparsable_diff_keeps_missing_stats() {
        let db = setup_db();
        let mut stored = preview("source-1", Utc::now());
        stored.diff.diffstat = None;
        stored.diff.added_lines_count = None;
        stored.diff.removed_lines_count = None;
        db.insert_preview_diff(&stored).unwrap();

        let loaded = db.current_preview_diff("mp-1").unwrap().unwrap();
        assert!(loaded.diff.diffstat.is_none());
        assert!(loaded.diff.added_lines_count.is_none());
    }

    #[test]
    fn test_incremental_diffs() {
        let db = setup_db();
        for (old, new) in [("r1", "r2"), ("r2", "r3")] {
            db.insert_incremental_diff(&IncrementalDiff {
                id: None,
                diff: Diff::empty(),
                proposal_id: "mp-1".into(),
                old_revision_id: old.into(),
                new_revision_id: new.into(),
            })
            .unwrap();
        }

        let diffs = db.incremental_diffs_for("mp-1").unwrap();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].old_revision_id, "r1");
        assert_eq!(diffs[1].diff, Diff::empty());
        assert!(db.incremental_diff("mp-1", "r2", "r3").unwrap().is_some());
        assert!(db.incremental_diff("mp-1", "r1", "r3").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_incremental_range_rejected() {
        let db = setup_db();
        let incremental = IncrementalDiff {
            id: None,
            diff: Diff::empty(),
            proposal_id: "mp-1".into(),
            old_revision_id: "r1".into(),
            new_revision_id: "r2".into(),
        };
        db.insert_incremental_diff(&incremental).unwrap();
        assert!(db.insert_incremental_diff(&incremental).is_err());
        // The failed insert left no orphaned diff row.
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM diffs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
