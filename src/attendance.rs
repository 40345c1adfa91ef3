//! Attendance records for a class session and the store that replaces them.
//!
//! The store only knows two things: wipe-and-rewrite a session, and read a
//! session back. Both reconciliation paths write through `replace_all`, so
//! re-submitting the same batch always converges on the same rows.

use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::academy::now_rfc3339;
use crate::error::{is_busy, query_error, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Excused,
}

impl AttendanceStatus {
    /// Accepts the Portuguese tokens and their English equivalents, ignoring
    /// case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "presente" | "present" => Some(Self::Present),
            "ausente" | "absent" => Some(Self::Absent),
            "justificado" | "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "presente",
            Self::Absent => "ausente",
            Self::Excused => "justificado",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttendance {
    pub student_id: String,
    pub status: AttendanceStatus,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub class_session_id: String,
    pub status: String,
    pub note: Option<String>,
    pub recorded_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl AttendanceRecord {
    fn stamp(session_id: &str, entry: &NewAttendance, recorded_by: &str, now: &str) -> Self {
        AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            student_id: entry.student_id.clone(),
            class_session_id: session_id.to_string(),
            status: entry.status.as_str().to_string(),
            note: entry.note.clone(),
            recorded_by: recorded_by.to_string(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

pub trait AttendanceStore {
    /// Deletes every record of the session, then inserts `records`. Returns
    /// the number of rows written.
    fn replace_all(
        &mut self,
        session_id: &str,
        records: &[NewAttendance],
        recorded_by: &str,
    ) -> Result<usize, StoreError>;

    fn list_for_session(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, StoreError>;
}

pub struct SqliteAttendanceStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteAttendanceStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn clear(&self, session_id: &str) -> Result<usize, StoreError> {
        self.conn
            .execute(
                "DELETE FROM attendance_records WHERE class_session_id = ?",
                [session_id],
            )
            .map_err(|e| {
                if is_busy(&e) {
                    StoreError::Timeout(e.to_string())
                } else {
                    StoreError::ClearFailed {
                        session_id: session_id.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    fn insert_batch(&self, rows: &[AttendanceRecord]) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO attendance_records(
                    id, student_id, class_session_id, status, note, recorded_by, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for r in rows {
                stmt.execute((
                    &r.id,
                    &r.student_id,
                    &r.class_session_id,
                    &r.status,
                    &r.note,
                    &r.recorded_by,
                    &r.created_at,
                    &r.updated_at,
                ))?;
            }
        }
        tx.commit()
    }
}

/// Busy or locked during the insert leaves the session empty but is worth
/// retrying; any other insert failure is not.
fn repopulate_error(session_id: &str, e: rusqlite::Error) -> StoreError {
    StoreError::RepopulateFailed {
        session_id: session_id.to_string(),
        retryable: is_busy(&e),
        message: e.to_string(),
    }
}

impl AttendanceStore for SqliteAttendanceStore<'_> {
    fn replace_all(
        &mut self,
        session_id: &str,
        records: &[NewAttendance],
        recorded_by: &str,
    ) -> Result<usize, StoreError> {
        let removed = self.clear(session_id)?;
        tracing::debug!(session_id, removed, "cleared attendance");

        let now = now_rfc3339();
        let rows: Vec<AttendanceRecord> = records
            .iter()
            .map(|e| AttendanceRecord::stamp(session_id, e, recorded_by, &now))
            .collect();
        self.insert_batch(&rows)
            .map_err(|e| repopulate_error(session_id, e))?;
        Ok(rows.len())
    }

    fn list_for_session(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, student_id, class_session_id, status, note, recorded_by, created_at, updated_at
                 FROM attendance_records
                 WHERE class_session_id = ?
                 ORDER BY created_at, rowid",
            )
            .map_err(query_error)?;
        stmt.query_map([session_id], |r| {
            Ok(AttendanceRecord {
                id: r.get(0)?,
                student_id: r.get(1)?,
                class_session_id: r.get(2)?,
                status: r.get(3)?,
                note: r.get(4)?,
                recorded_by: r.get(5)?,
                created_at: r.get(6)?,
                updated_at: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_error)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::academy::fixtures::*;

    fn mark(student_id: &str, status: AttendanceStatus) -> NewAttendance {
        NewAttendance {
            student_id: student_id.to_string(),
            status,
            note: None,
        }
    }

    #[test]
    fn status_tokens_accept_both_languages() {
        assert_eq!(AttendanceStatus::parse(" Presente "), Some(AttendanceStatus::Present));
        assert_eq!(AttendanceStatus::parse("ABSENT"), Some(AttendanceStatus::Absent));
        assert_eq!(AttendanceStatus::parse("excused"), Some(AttendanceStatus::Excused));
        assert_eq!(AttendanceStatus::parse("late"), None);
        assert_eq!(AttendanceStatus::Excused.as_str(), "justificado");
    }

    #[test]
    fn replace_all_drops_previous_marks() {
        let c = conn();
        for id in ["a", "b", "c"] {
            student(&c, id, id, "2024-01-01T00:00:00Z");
        }
        let session = session_for_group(&c, None);
        let other = session_for_group(&c, None);
        let mut store = SqliteAttendanceStore::new(&c);
        store
            .replace_all(
                &session,
                &[mark("a", AttendanceStatus::Present), mark("b", AttendanceStatus::Absent)],
                "prof-1",
            )
            .expect("first");
        store
            .replace_all(&other, &[mark("a", AttendanceStatus::Present)], "prof-1")
            .expect("other session");
        let n = store
            .replace_all(&session, &[mark("c", AttendanceStatus::Present)], "prof-2")
            .expect("second");
        assert_eq!(n, 1);

        let rows = store.list_for_session(&session).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].student_id, "c");
        assert_eq!(rows[0].status, "presente");
        assert_eq!(rows[0].recorded_by, "prof-2");
        assert_eq!(store.list_for_session(&other).expect("list").len(), 1);
    }

    #[test]
    fn insert_failure_after_clear_is_reported_separately() {
        let c = conn();
        student(&c, "a", "Ana", "2024-01-01T00:00:00Z");
        let session = session_for_group(&c, None);
        let mut store = SqliteAttendanceStore::new(&c);
        store
            .replace_all(&session, &[mark("a", AttendanceStatus::Present)], "prof")
            .expect("seed");

        // Unknown student violates the foreign key inside the insert transaction.
        let err = store
            .replace_all(
                &session,
                &[mark("a", AttendanceStatus::Absent), mark("ghost", AttendanceStatus::Present)],
                "prof",
            )
            .expect_err("fk violation");
        assert!(matches!(err, StoreError::RepopulateFailed { retryable: false, .. }));
        assert!(store.list_for_session(&session).expect("list").is_empty());
    }

    fn locked_workspace() -> (std::path::PathBuf, Connection, Connection, String) {
        let dir = std::env::temp_dir().join(format!("dojod-lock-{}", Uuid::new_v4()));
        let writer = crate::db::open_db(&dir).expect("open writer");
        student(&writer, "a", "Ana", "2024-01-01T00:00:00Z");
        let session = session_for_group(&writer, None);
        SqliteAttendanceStore::new(&writer)
            .replace_all(&session, &[mark("a", AttendanceStatus::Present)], "prof")
            .expect("seed");
        writer
            .busy_timeout(std::time::Duration::from_millis(50))
            .expect("busy timeout");

        let holder = crate::db::open_db(&dir).expect("open holder");
        holder.execute_batch("BEGIN IMMEDIATE").expect("take write lock");
        (dir, writer, holder, session)
    }

    #[test]
    fn busy_clear_times_out_without_touching_rows() {
        let (dir, writer, holder, session) = locked_workspace();
        let mut store = SqliteAttendanceStore::new(&writer);

        let err = store
            .replace_all(&session, &[mark("a", AttendanceStatus::Absent)], "prof-2")
            .expect_err("locked");
        assert!(matches!(err, StoreError::Timeout(_)), "{:?}", err);
        let engine = crate::error::EngineError::from(err);
        assert_eq!(engine.code(), "store_timeout");
        assert!(engine.retryable());

        holder.execute_batch("ROLLBACK").expect("release lock");
        let rows = store.list_for_session(&session).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "presente");
        assert_eq!(rows[0].recorded_by, "prof");

        drop(store);
        drop(holder);
        drop(writer);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn busy_insert_is_a_retryable_repopulate_failure() {
        let (dir, writer, holder, session) = locked_workspace();
        let busy = writer
            .execute(
                "INSERT INTO attendance_records(
                    id, student_id, class_session_id, status, note, recorded_by, created_at, updated_at
                 ) VALUES('x', 'a', ?, 'presente', NULL, 'prof', '', '')",
                [&session],
            )
            .expect_err("locked");
        assert!(is_busy(&busy));

        let err = repopulate_error(&session, busy);
        assert!(matches!(err, StoreError::RepopulateFailed { retryable: true, .. }));
        let engine = crate::error::EngineError::from(err);
        assert_eq!(engine.code(), "attendance_cleared_not_saved");
        assert!(engine.retryable());

        drop(holder);
        drop(writer);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn memory_store_clear_failure_keeps_prior_rows() {
        let mut store = memory::MemoryStore::default();
        store
            .replace_all("s1", &[mark("a", AttendanceStatus::Present)], "prof")
            .expect("seed");
        store.fail_clear = true;
        let err = store
            .replace_all("s1", &[mark("b", AttendanceStatus::Present)], "prof")
            .expect_err("clear fails");
        assert!(matches!(err, StoreError::ClearFailed { .. }));
        assert_eq!(store.list_for_session("s1").expect("list").len(), 1);
    }
}
