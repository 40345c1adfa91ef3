use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::attendance::{AttendanceStatus, AttendanceStore, NewAttendance};
use crate::error::{EngineError, EntryProblem};

/// One row of the manual attendance form. An entry without a status is a
/// student the instructor did not mark.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntry {
    #[serde(default)]
    pub student_id: String,
    pub status: Option<String>,
    pub note: Option<String>,
}

fn blank_to_none(note: Option<&str>) -> Option<String> {
    note.filter(|n| !n.trim().is_empty()).map(str::to_string)
}

/// Collapses repeated students onto one record. The last record wins but
/// keeps the position of the first occurrence.
pub fn last_wins(records: Vec<NewAttendance>) -> Vec<NewAttendance> {
    let mut out: Vec<NewAttendance> = Vec::with_capacity(records.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for r in records {
        match index.get(&r.student_id) {
            Some(&i) => out[i] = r,
            None => {
                index.insert(r.student_id.clone(), out.len());
                out.push(r);
            }
        }
    }
    out
}

/// Validates a manual batch and replaces the session's attendance with it.
///
/// The batch is all-or-nothing: a single bad entry rejects everything and
/// leaves the stored records untouched.
pub fn submit_manual<S: AttendanceStore + ?Sized>(
    store: &mut S,
    session_id: &str,
    entries: &[ManualEntry],
    recorded_by: &str,
    known_students: &HashSet<String>,
) -> Result<usize, EngineError> {
    let mut problems = Vec::new();
    let mut staged = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let Some(raw_status) = entry.status.as_deref().filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        let student_id = entry.student_id.trim();
        let mut reject = |reason: String| {
            problems.push(EntryProblem {
                index,
                student_id: entry.student_id.clone(),
                reason,
            })
        };
        let Some(status) = AttendanceStatus::parse(raw_status) else {
            reject(format!("status inválido: {}", raw_status.trim()));
            continue;
        };
        if student_id.is_empty() {
            reject("studentId é obrigatório".to_string());
            continue;
        }
        if !known_students.contains(student_id) {
            reject(format!("aluno não encontrado: {}", student_id));
            continue;
        }
        staged.push(NewAttendance {
            student_id: student_id.to_string(),
            status,
            note: blank_to_none(entry.note.as_deref()),
        });
    }

    if !problems.is_empty() {
        return Err(EngineError::Validation { problems });
    }
    let staged = last_wins(staged);
    if staged.is_empty() {
        return Err(EngineError::EmptyBatch);
    }
    let applied = store.replace_all(session_id, &staged, recorded_by)?;
    tracing::info!(session_id, applied, "manual attendance saved");
    Ok(applied)
}
