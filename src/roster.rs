use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::academy;
use crate::belts::{resolve_belt, ResolvedBelt};
use crate::catalog::BeltCatalog;
use crate::error::EngineError;

/// A student eligible for attendance in a session, with display-safe fields only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub belt_key: String,
    pub belt_degree: u32,
    pub belt_label: String,
    pub belt_color: String,
}

/// Students actively enrolled in the group that owns the session's class, in
/// enrollment order, each with the belt they currently hold.
pub fn resolve_roster(
    conn: &Connection,
    catalog: &BeltCatalog,
    session_id: &str,
) -> Result<Vec<RosterEntry>, EngineError> {
    let Some(group_id) = academy::session_group(conn, session_id)? else {
        return Ok(Vec::new());
    };
    let student_ids = academy::active_enrollment_student_ids(conn, &group_id)?;
    if student_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut students = academy::students_by_ids(conn, &student_ids)?;
    let gradings = academy::gradings_for_students(conn, &student_ids)?;

    let roster = student_ids
        .iter()
        .filter_map(|id| students.remove(id))
        .map(|s| {
            let events = gradings.get(&s.id).map(Vec::as_slice).unwrap_or(&[]);
            let belt = resolve_belt(catalog, &s.belt_facts, events);
            RosterEntry {
                id: s.id,
                name: s.name,
                email: s.email,
                phone: s.phone,
                photo_url: s.photo_url,
                belt_key: belt.rank_key,
                belt_degree: belt.degree,
                belt_label: belt.label,
                belt_color: belt.color,
            }
        })
        .collect();
    Ok(roster)
}

/// Resolved belts for arbitrary students, keyed by student id.
pub fn resolve_belts_for(
    conn: &Connection,
    catalog: &BeltCatalog,
    students: &[academy::Student],
) -> Result<HashMap<String, ResolvedBelt>, EngineError> {
    let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let gradings = academy::gradings_for_students(conn, &ids)?;
    Ok(students
        .iter()
        .map(|s| {
            let events = gradings.get(&s.id).map(Vec::as_slice).unwrap_or(&[]);
            (s.id.clone(), resolve_belt(catalog, &s.belt_facts, events))
        })
        .collect())
}
