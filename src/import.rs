//! Attendance import from an uploaded spreadsheet.
//!
//! Layout: column A holds a student id or part of a name, column B the
//! status token, column C an optional note. The first row is a header. Row
//! problems are collected as user-facing messages and never abort the import
//! on their own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::academy::StudentName;
use crate::attendance::{AttendanceStatus, AttendanceStore, NewAttendance};
use crate::config::ImportSettings;
use crate::error::EngineError;
use crate::reconcile::last_wins;
use crate::sheet;

/// Canonical hyphenated UUID, versions 1 to 5, RFC 4122 variant.
pub fn looks_like_uuid(token: &str) -> bool {
    let b = token.as_bytes();
    if b.len() != 36 {
        return false;
    }
    for (i, c) in b.iter().enumerate() {
        let ok = match i {
            8 | 13 | 18 | 23 => *c == b'-',
            _ => c.is_ascii_hexdigit(),
        };
        if !ok {
            return false;
        }
    }
    matches!(b[14], b'1'..=b'5') && matches!(b[19].to_ascii_lowercase(), b'8' | b'9' | b'a' | b'b')
}

/// Students as the importer sees them: a set of ids for exact lookups and
/// the name list, in creation order, for substring matching.
pub struct StudentIndex {
    ids: HashSet<String>,
    names: Vec<(String, String)>,
}

impl StudentIndex {
    pub fn new(directory: Vec<StudentName>) -> Self {
        let ids = directory.iter().map(|s| s.id.clone()).collect();
        let names = directory
            .into_iter()
            .map(|s| (s.id, s.name.to_lowercase()))
            .collect();
        Self { ids, names }
    }

    /// UUID-shaped tokens only ever match an id; anything else is searched
    /// for inside student names and the first hit wins.
    pub fn resolve(&self, token: &str) -> Option<String> {
        if looks_like_uuid(token) {
            if self.ids.contains(token) {
                return Some(token.to_string());
            }
            let lowered = token.to_lowercase();
            return self.ids.contains(&lowered).then_some(lowered);
        }
        let needle = token.to_lowercase();
        self.names
            .iter()
            .find(|(_, name)| name.contains(&needle))
            .map(|(id, _)| id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Staged(NewAttendance),
    Rejected(String),
}

fn cell(row: &[String], i: usize) -> &str {
    row.get(i).map(|s| s.trim()).unwrap_or("")
}

/// Validates one data row. `None` means the row is blank and is skipped.
pub fn validate_row(row: &[String], line: usize, students: &StudentIndex) -> Option<RowOutcome> {
    if row.iter().all(|c| c.trim().is_empty()) {
        return None;
    }
    let token = cell(row, 0);
    let raw_status = cell(row, 1);
    if token.is_empty() || raw_status.is_empty() {
        return Some(RowOutcome::Rejected(format!(
            "Linha {}: aluno_id/nome e status são obrigatórios",
            line
        )));
    }
    let Some(status) = AttendanceStatus::parse(raw_status) else {
        return Some(RowOutcome::Rejected(format!(
            "Linha {}: status deve ser presente, ausente ou justificado",
            line
        )));
    };
    let Some(student_id) = students.resolve(token) else {
        return Some(RowOutcome::Rejected(format!(
            "Linha {}: aluno não encontrado: {}",
            line, token
        )));
    };
    let note = cell(row, 2);
    Some(RowOutcome::Staged(NewAttendance {
        student_id,
        status,
        note: (!note.is_empty()).then(|| note.to_string()),
    }))
}

/// Deadline and cancellation checked between rows.
#[derive(Default, Clone, Copy)]
pub struct ImportBudget<'a> {
    pub deadline: Option<Instant>,
    pub cancel: Option<&'a AtomicBool>,
}

impl<'a> ImportBudget<'a> {
    pub fn from_settings(settings: &ImportSettings, cancel: Option<&'a AtomicBool>) -> Self {
        Self {
            deadline: settings.deadline.map(|d| Instant::now() + d),
            cancel,
        }
    }

    fn check(&self, processed: usize) -> Result<(), EngineError> {
        let cancelled = self.cancel.is_some_and(|c| c.load(Ordering::Relaxed));
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        if cancelled || expired {
            return Err(EngineError::Cancelled { processed });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub imported_count: usize,
    pub rows_total: usize,
    pub errors: Vec<String>,
    pub file_digest: String,
}

pub fn file_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn submit_import<S: AttendanceStore + ?Sized>(
    store: &mut S,
    session_id: &str,
    bytes: &[u8],
    recorded_by: &str,
    students: &StudentIndex,
    max_rows: usize,
    budget: ImportBudget<'_>,
) -> Result<ImportOutcome, EngineError> {
    let digest = file_digest(bytes);
    let rows = sheet::read_rows(bytes).map_err(|e| EngineError::UnreadableSheet(e.to_string()))?;
    if rows.len() < 2 {
        return Err(EngineError::EmptySheet);
    }
    let data = &rows[1..];
    if data.len() > max_rows {
        return Err(EngineError::TooManyRows {
            rows: data.len(),
            limit: max_rows,
        });
    }

    let mut staged = Vec::new();
    let mut errors = Vec::new();
    for (i, row) in data.iter().enumerate() {
        budget.check(i)?;
        match validate_row(row, i + 2, students) {
            Some(RowOutcome::Staged(record)) => staged.push(record),
            Some(RowOutcome::Rejected(message)) => errors.push(message),
            None => {}
        }
    }

    if staged.is_empty() {
        tracing::warn!(session_id, rows = data.len(), errors = errors.len(), "import had no valid rows");
        return Err(EngineError::NoValidRows { errors });
    }
    let staged = last_wins(staged);
    let imported_count = store.replace_all(session_id, &staged, recorded_by)?;
    tracing::info!(
        session_id,
        imported = imported_count,
        rows = data.len(),
        errors = errors.len(),
        digest = %digest,
        "attendance import saved"
    );
    Ok(ImportOutcome {
        imported_count,
        rows_total: data.len(),
        errors,
        file_digest: digest,
    })
}
