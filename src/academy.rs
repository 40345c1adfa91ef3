//! Students, groups, enrollments, classes, sessions and gradings as stored in
//! the workspace database. The engine only reads most of this; the create
//! operations exist so the surrounding application can populate a workspace.

use std::collections::{HashMap, HashSet};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Deserialize;
use uuid::Uuid;

use crate::belts::{is_active_status, GradingEvent, ProfileBelt, StudentBeltFacts};
use crate::error::EngineError;

/// SQLite caps bound parameters per statement; IN-lists are split at this size.
const MAX_IN_PARAMS: usize = 900;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub photo_url: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub belt_facts: StudentBeltFacts,
}

const STUDENT_COLUMNS: &str = "s.id, s.name, s.email, s.phone, s.photo_url, s.active, s.created_at,
     s.current_rank, s.current_degree,
     p.student_id, p.belt_id, p.belt_name, p.degree";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    let profile_owner: Option<String> = r.get(9)?;
    let profile = profile_owner.map(|_| -> rusqlite::Result<ProfileBelt> {
        Ok(ProfileBelt {
            belt_id: r.get(10)?,
            rank: r.get(11)?,
            degree: r.get(12)?,
        })
    });
    Ok(Student {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        phone: r.get(3)?,
        photo_url: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
        created_at: r.get(6)?,
        belt_facts: StudentBeltFacts {
            profile: profile.transpose()?,
            legacy_rank: r.get(7)?,
            legacy_degree: r.get(8)?,
        },
    })
}

pub fn students_by_ids(conn: &Connection, ids: &[String]) -> rusqlite::Result<HashMap<String, Student>> {
    let mut out = HashMap::new();
    for chunk in ids.chunks(MAX_IN_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {STUDENT_COLUMNS}
             FROM students s
             LEFT JOIN student_profiles p ON p.student_id = s.id
             WHERE s.id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for s in rows {
            out.insert(s.id.clone(), s);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentStatusFilter {
    All,
    Active,
    Inactive,
}

impl StudentStatusFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" | "todos" => Some(Self::All),
            "ativo" | "active" => Some(Self::Active),
            "inativo" | "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Newest students first, optionally narrowed by a name/email search.
pub fn list_students(
    conn: &Connection,
    search: Option<&str>,
    status: StudentStatusFilter,
) -> rusqlite::Result<Vec<Student>> {
    let mut sql = format!(
        "SELECT {STUDENT_COLUMNS}
         FROM students s
         LEFT JOIN student_profiles p ON p.student_id = s.id
         WHERE 1 = 1"
    );
    let mut values: Vec<String> = Vec::new();
    if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
        sql.push_str(" AND (lower(s.name) LIKE ? OR lower(s.email) LIKE ?)");
        let pattern = format!("%{}%", term.to_lowercase());
        values.push(pattern.clone());
        values.push(pattern);
    }
    match status {
        StudentStatusFilter::All => {}
        StudentStatusFilter::Active => sql.push_str(" AND s.active = 1"),
        StudentStatusFilter::Inactive => sql.push_str(" AND s.active = 0"),
    }
    sql.push_str(" ORDER BY s.created_at DESC, s.rowid DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentName {
    pub id: String,
    pub name: String,
}

/// Every student in creation order; this is the order name matching walks.
pub fn student_directory(conn: &Connection) -> rusqlite::Result<Vec<StudentName>> {
    let mut stmt = conn.prepare("SELECT id, name FROM students ORDER BY created_at, rowid")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StudentName {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn known_student_ids(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM students")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// All gradings for the given students, fetched in one pass and grouped by
/// student.
pub fn gradings_for_students(
    conn: &Connection,
    student_ids: &[String],
) -> rusqlite::Result<HashMap<String, Vec<GradingEvent>>> {
    let mut out: HashMap<String, Vec<GradingEvent>> = HashMap::new();
    for chunk in student_ids.chunks(MAX_IN_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT id, student_id, previous_rank, previous_degree, new_rank, new_degree,
                    graded_on, evaluator_id, status, created_at
             FROM gradings
             WHERE student_id IN ({placeholders})
             ORDER BY created_at DESC, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |r| {
                Ok(GradingEvent {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    previous_rank: r.get(2)?,
                    previous_degree: r.get(3)?,
                    new_rank: r.get(4)?,
                    new_degree: r.get(5)?,
                    date: r.get(6)?,
                    evaluator_id: r.get(7)?,
                    status: r.get(8)?,
                    created_at: r.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for g in rows {
            out.entry(g.student_id.clone()).or_default().push(g);
        }
    }
    Ok(out)
}

pub fn session_exists(conn: &Connection, session_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM class_sessions WHERE id = ?",
        [session_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

/// Follows session → class → group. `Ok(None)` means the class exists but
/// is not tied to a group.
pub fn session_group(conn: &Connection, session_id: &str) -> Result<Option<String>, EngineError> {
    let class_id: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM class_sessions WHERE id = ?",
            [session_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(class_id) = class_id else {
        return Err(EngineError::not_found("class session", session_id));
    };
    let Some(class_id) = class_id else {
        return Err(EngineError::not_found("class for session", session_id));
    };
    let group_id: Option<Option<String>> = conn
        .query_row(
            "SELECT group_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(group_id) = group_id else {
        return Err(EngineError::not_found("class", class_id));
    };
    let Some(group_id) = group_id.filter(|g| !g.trim().is_empty()) else {
        return Ok(None);
    };
    if !group_exists(conn, &group_id)? {
        return Err(EngineError::not_found("group", group_id));
    }
    Ok(Some(group_id))
}

/// Students with an active enrollment in the group, in enrollment order.
pub fn active_enrollment_student_ids(conn: &Connection, group_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, status FROM enrollments WHERE group_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([group_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    Ok(rows
        .into_iter()
        .filter(|(_, status)| is_active_status(status.as_deref()))
        .filter_map(|(student_id, _)| seen.insert(student_id.clone()).then_some(student_id))
        .collect())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProfile {
    pub belt_id: Option<i64>,
    pub belt_name: Option<String>,
    pub degree: Option<i64>,
    pub started_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub photo_url: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub current_rank: Option<String>,
    pub current_degree: Option<i64>,
    pub created_at: Option<String>,
    pub profile: Option<NewProfile>,
}

fn default_true() -> bool {
    true
}

pub fn create_student(conn: &Connection, s: &NewStudent) -> rusqlite::Result<String> {
    let id = s.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = s.created_at.clone().unwrap_or_else(now_rfc3339);
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO students(id, name, email, phone, photo_url, active, current_rank, current_degree, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            s.name.trim(),
            s.email.trim(),
            &s.phone,
            &s.photo_url,
            if s.active { 1 } else { 0 },
            &s.current_rank,
            s.current_degree,
            &created_at,
        ),
    )?;
    if let Some(p) = &s.profile {
        upsert_profile(&tx, &id, p)?;
    }
    tx.commit()?;
    Ok(id)
}

/// Administrative belt edit on the student's profile.
pub fn upsert_profile(conn: &Connection, student_id: &str, p: &NewProfile) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO student_profiles(student_id, belt_id, belt_name, degree, started_on, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           belt_id = excluded.belt_id,
           belt_name = excluded.belt_name,
           degree = excluded.degree,
           started_on = COALESCE(excluded.started_on, student_profiles.started_on),
           updated_at = excluded.updated_at",
        (
            student_id,
            p.belt_id,
            &p.belt_name,
            p.degree,
            &p.started_on,
            now_rfc3339(),
        ),
    )?;
    Ok(())
}

pub fn student_exists(conn: &Connection, student_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

pub fn group_exists(conn: &Connection, group_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM groups WHERE id = ?", [group_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

pub fn class_exists(conn: &Connection, class_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

pub fn create_group(conn: &Connection, id: Option<String>, name: &str) -> rusqlite::Result<String> {
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO groups(id, name, active) VALUES(?, ?, 1)",
        (&id, name.trim()),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEnrollment {
    pub id: Option<String>,
    pub student_id: String,
    pub group_id: String,
    #[serde(default = "default_enrollment_status")]
    pub status: String,
    pub number: Option<i64>,
}

fn default_enrollment_status() -> String {
    "ativa".to_string()
}

pub fn create_enrollment(conn: &Connection, e: &NewEnrollment) -> rusqlite::Result<String> {
    let id = e.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO enrollments(id, student_id, group_id, status, number, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &e.student_id, &e.group_id, e.status.trim(), e.number, &now, &now),
    )?;
    Ok(id)
}

/// Returns false when no enrollment has that id.
pub fn set_enrollment_status(conn: &Connection, enrollment_id: &str, status: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollments SET status = ?, updated_at = ? WHERE id = ?",
        (status.trim(), now_rfc3339(), enrollment_id),
    )?;
    Ok(changed > 0)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClass {
    pub id: Option<String>,
    pub name: String,
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
    pub group_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

pub fn create_class(conn: &Connection, c: &NewClass) -> rusqlite::Result<String> {
    let id = c.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO classes(id, name, weekday, start_time, end_time, group_id, active)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            c.name.trim(),
            c.weekday,
            &c.start_time,
            &c.end_time,
            &c.group_id,
            if c.active { 1 } else { 0 },
        ),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub id: Option<String>,
    pub class_id: Option<String>,
    pub date: String,
    pub status: Option<String>,
    pub substitute_instructor_id: Option<String>,
}

pub fn create_session(conn: &Connection, s: &NewSession) -> rusqlite::Result<String> {
    let id = s.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO class_sessions(id, class_id, session_date, status, substitute_instructor_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &s.class_id,
            &s.date,
            &s.status,
            &s.substitute_instructor_id,
            now_rfc3339(),
        ),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGrading {
    pub id: Option<String>,
    pub student_id: String,
    pub previous_rank: Option<String>,
    pub previous_degree: Option<i64>,
    pub new_rank: Option<String>,
    pub new_degree: Option<i64>,
    pub date: String,
    pub evaluator_id: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
}

pub fn create_grading(conn: &Connection, g: &NewGrading) -> rusqlite::Result<String> {
    let id = g.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = g.created_at.clone().unwrap_or_else(now_rfc3339);
    conn.execute(
        "INSERT INTO gradings(id, student_id, previous_rank, previous_degree, new_rank, new_degree,
                              graded_on, evaluator_id, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &g.student_id,
            &g.previous_rank,
            g.previous_degree,
            &g.new_rank,
            g.new_degree,
            &g.date,
            &g.evaluator_id,
            &g.status,
            &created_at,
        ),
    )?;
    Ok(id)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn session_group_reports_each_missing_link() {
        let c = conn();
        assert!(matches!(
            session_group(&c, "nope"),
            Err(EngineError::NotFound { entity: "class session", .. })
        ));

        let loose = session_for_group(&c, None);
        assert_eq!(session_group(&c, &loose).expect("no group"), None);

        c.execute("PRAGMA foreign_keys = OFF", []).expect("pragma");
        let orphan = session_for_group(&c, Some("ghost-group"));
        assert!(matches!(
            session_group(&c, &orphan),
            Err(EngineError::NotFound { entity: "group", .. })
        ));
    }

    #[test]
    fn active_enrollments_keep_order_and_skip_inactive() {
        let c = conn();
        for (id, name) in [("a", "Ana"), ("b", "Bruno"), ("c", "Carla")] {
            student(&c, id, name, "2024-01-01T00:00:00Z");
        }
        let g = create_group(&c, None, "Adulto").expect("group");
        enroll(&c, "c", &g, "Ativa");
        enroll(&c, "b", &g, "inativa");
        enroll(&c, "a", &g, "active");
        enroll(&c, "c", &g, "ativa");
        assert_eq!(
            active_enrollment_student_ids(&c, &g).expect("ids"),
            vec!["c".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn profile_is_joined_into_belt_facts() {
        let c = conn();
        student(&c, "a", "Ana", "2024-01-01T00:00:00Z");
        upsert_profile(
            &c,
            "a",
            &NewProfile {
                belt_id: Some(6),
                belt_name: Some("azul".into()),
                degree: Some(1),
                started_on: None,
            },
        )
        .expect("profile");
        student(&c, "b", "Bia", "2024-01-02T00:00:00Z");
        let map = students_by_ids(&c, &["a".to_string(), "b".to_string()]).expect("load");
        let a = map.get("a").expect("a");
        assert_eq!(a.belt_facts.profile.as_ref().and_then(|p| p.belt_id), Some(6));
        assert!(map.get("b").expect("b").belt_facts.profile.is_none());
    }

    #[test]
    fn list_students_filters_and_orders_newest_first() {
        let c = conn();
        student(&c, "a", "Ana Souza", "2024-01-01T00:00:00Z");
        student(&c, "b", "Bruno Lima", "2024-02-01T00:00:00Z");
        c.execute("UPDATE students SET active = 0 WHERE id = 'a'", [])
            .expect("deactivate");
        let all = list_students(&c, None, StudentStatusFilter::All).expect("all");
        assert_eq!(all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
        let inactive = list_students(&c, Some("SOUZA"), StudentStatusFilter::Inactive).expect("search");
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].id, "a");
        assert!(list_students(&c, Some("souza"), StudentStatusFilter::Active)
            .expect("active")
            .is_empty());
    }
}
