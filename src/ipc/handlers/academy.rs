use crate::academy::{
    self, NewClass, NewEnrollment, NewGrading, NewProfile, NewSession, NewStudent,
    StudentStatusFilter,
};
use crate::catalog::BeltCatalog;
use crate::error::EngineError;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, parse_params, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::resolve_belts_for;
use rusqlite::Connection;
use serde_json::{json, Value};

fn insert_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_insert_failed", e.to_string())
}

fn ensure_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if !academy::student_exists(conn, student_id)? {
        return Err(EngineError::not_found("student", student_id).into());
    }
    Ok(())
}

fn ensure_group(conn: &Connection, group_id: &str) -> Result<(), HandlerErr> {
    if !academy::group_exists(conn, group_id)? {
        return Err(EngineError::not_found("group", group_id).into());
    }
    Ok(())
}

fn belts_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let catalog = BeltCatalog::load(conn)?;
    Ok(json!({ "belts": catalog.entries() }))
}

fn check_profile(catalog: &BeltCatalog, p: &NewProfile) -> Result<(), HandlerErr> {
    if let Some(id) = p.belt_id {
        if catalog.by_id(id).is_none() {
            return Err(HandlerErr::bad_params(format!("unknown beltId {}", id)));
        }
    }
    check_degree("degree", p.degree)
}

fn check_degree(key: &str, degree: Option<i64>) -> Result<(), HandlerErr> {
    match degree {
        Some(d) if u32::try_from(d).is_err() => Err(HandlerErr::bad_params(format!(
            "{} must be between 0 and {}",
            key,
            u32::MAX
        ))),
        _ => Ok(()),
    }
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student: NewStudent = parse_params(params)?;
    if student.name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    if let Some(p) = &student.profile {
        check_profile(&BeltCatalog::load(conn)?, p)?;
    }
    let id = academy::create_student(conn, &student).map_err(insert_failed)?;
    Ok(json!({ "studentId": id }))
}

fn students_update_belt(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let profile: NewProfile = parse_params(params)?;
    check_profile(&BeltCatalog::load(conn)?, &profile)?;
    ensure_student(conn, &student_id)?;
    academy::upsert_profile(conn, &student_id, &profile)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let search = get_optional_str(params, "search");
    let status_raw = get_optional_str(params, "status").unwrap_or_default();
    let Some(status) = StudentStatusFilter::parse(&status_raw) else {
        return Err(HandlerErr::bad_params("status must be ativo, inativo or all"));
    };
    let catalog = BeltCatalog::load(conn)?;
    let students = academy::list_students(conn, search.as_deref(), status)?;
    let belts = resolve_belts_for(conn, &catalog, &students)?;
    let rows: Vec<Value> = students
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "email": s.email,
                "phone": s.phone,
                "photoUrl": s.photo_url,
                "active": s.active,
                "createdAt": s.created_at,
                "belt": belts.get(&s.id),
            })
        })
        .collect();
    Ok(json!({ "students": rows }))
}

fn groups_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let id = academy::create_group(conn, get_optional_str(params, "id"), &name).map_err(insert_failed)?;
    Ok(json!({ "groupId": id }))
}

fn enrollments_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment: NewEnrollment = parse_params(params)?;
    ensure_student(conn, &enrollment.student_id)?;
    ensure_group(conn, &enrollment.group_id)?;
    let id = academy::create_enrollment(conn, &enrollment).map_err(insert_failed)?;
    Ok(json!({ "enrollmentId": id }))
}

fn enrollments_set_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let status = get_required_str(params, "status")?;
    let changed = academy::set_enrollment_status(conn, &enrollment_id, &status)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if !changed {
        return Err(EngineError::not_found("enrollment", enrollment_id).into());
    }
    Ok(json!({ "ok": true }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class: NewClass = parse_params(params)?;
    if class.name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    if !(0..=6).contains(&class.weekday) {
        return Err(HandlerErr::bad_params("weekday must be 0..=6"));
    }
    if let Some(group_id) = class.group_id.as_deref().filter(|g| !g.trim().is_empty()) {
        ensure_group(conn, group_id)?;
    }
    let id = academy::create_class(conn, &class).map_err(insert_failed)?;
    Ok(json!({ "classId": id }))
}

fn sessions_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let session: NewSession = parse_params(params)?;
    let Some(class_id) = session.class_id.as_deref() else {
        return Err(HandlerErr::bad_params("missing classId"));
    };
    if !academy::class_exists(conn, class_id)? {
        return Err(EngineError::not_found("class", class_id).into());
    }
    let id = academy::create_session(conn, &session).map_err(insert_failed)?;
    Ok(json!({ "sessionId": id }))
}

fn gradings_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let grading: NewGrading = parse_params(params)?;
    check_degree("previousDegree", grading.previous_degree)?;
    check_degree("newDegree", grading.new_degree)?;
    ensure_student(conn, &grading.student_id)?;
    let id = academy::create_grading(conn, &grading).map_err(insert_failed)?;
    Ok(json!({ "gradingId": id }))
}

fn gradings_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ensure_student(conn, &student_id)?;
    let mut by_student = academy::gradings_for_students(conn, std::slice::from_ref(&student_id))?;
    let gradings = by_student.remove(&student_id).unwrap_or_default();
    Ok(json!({ "gradings": gradings }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let body: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "belts.list" => belts_list,
        "students.create" => students_create,
        "students.updateBelt" => students_update_belt,
        "students.list" => students_list,
        "groups.create" => groups_create,
        "enrollments.create" => enrollments_create,
        "enrollments.setStatus" => enrollments_set_status,
        "classes.create" => classes_create,
        "sessions.create" => sessions_create,
        "gradings.create" => gradings_create,
        "gradings.list" => gradings_list,
        _ => return None,
    };
    Some(with_db(state, req, body))
}
