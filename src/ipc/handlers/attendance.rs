use crate::academy;
use crate::attendance::{AttendanceStore, SqliteAttendanceStore};
use crate::config;
use crate::error::EngineError;
use crate::import::{submit_import, ImportBudget, StudentIndex};
use crate::ipc::helpers::{get_optional_u64, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{submit_manual, ManualEntry};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::time::Duration;

fn ensure_session(conn: &Connection, session_id: &str) -> Result<(), HandlerErr> {
    if !academy::session_exists(conn, session_id)? {
        return Err(EngineError::not_found("class session", session_id).into());
    }
    Ok(())
}

/// Runs `body` with the request's `timeoutMs` as the SQLite busy timeout,
/// then puts the workspace setting back.
fn with_request_timeout<T>(
    conn: &Connection,
    params: &Value,
    body: impl FnOnce() -> Result<T, HandlerErr>,
) -> Result<T, HandlerErr> {
    let Some(ms) = get_optional_u64(params, "timeoutMs")? else {
        return body();
    };
    conn.busy_timeout(Duration::from_millis(ms))?;
    let out = body();
    let restore = config::storage_settings(conn).unwrap_or_default().busy_timeout;
    if let Err(e) = conn.busy_timeout(restore) {
        tracing::warn!(error = %e, "failed to restore busy timeout");
    }
    out
}

fn attendance_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let session_id = get_required_str(params, "classSessionId")?;
    ensure_session(conn, &session_id)?;
    let records = SqliteAttendanceStore::new(conn)
        .list_for_session(&session_id)
        .map_err(EngineError::from)?;
    Ok(json!({ "records": records }))
}

fn attendance_submit_manual(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let session_id = get_required_str(params, "classSessionId")?;
    let recorded_by = get_required_str(params, "recordedBy")?;
    let Some(raw_entries) = params.get("entries") else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let entries: Vec<ManualEntry> = serde_json::from_value(raw_entries.clone())
        .map_err(|e| HandlerErr::bad_params(format!("entries: {}", e)))?;

    with_request_timeout(conn, params, || {
        ensure_session(conn, &session_id)?;
        let known = academy::known_student_ids(conn)?;
        let mut store = SqliteAttendanceStore::new(conn);
        let applied = submit_manual(&mut store, &session_id, &entries, &recorded_by, &known)
            .map_err(|e| {
                log_failure(&session_id, &e);
                e
            })?;
        Ok(json!({ "appliedCount": applied }))
    })
}

fn attendance_import_sheet(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let session_id = get_required_str(params, "classSessionId")?;
    let recorded_by = get_required_str(params, "recordedBy")?;
    let in_path = get_required_str(params, "inPath")?;
    let bytes = std::fs::read(&in_path).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path })),
    })?;

    with_request_timeout(conn, params, || {
        ensure_session(conn, &session_id)?;
        let settings = config::import_settings(conn)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        let students = StudentIndex::new(academy::student_directory(conn)?);
        let mut store = SqliteAttendanceStore::new(conn);
        let outcome = submit_import(
            &mut store,
            &session_id,
            &bytes,
            &recorded_by,
            &students,
            settings.max_rows,
            ImportBudget::from_settings(&settings, None),
        )
        .map_err(|e| {
            log_failure(&session_id, &e);
            e
        })?;
        Ok(json!(outcome))
    })
}

fn log_failure(session_id: &str, e: &EngineError) {
    match e {
        EngineError::Store(store) => {
            tracing::error!(session_id, code = e.code(), error = %store, "attendance write failed")
        }
        _ => tracing::warn!(session_id, code = e.code(), error = %e, "attendance rejected"),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "attendance.list" => Some(with_db(state, req, attendance_list)),
        "attendance.submitManual" => Some(with_db(state, req, attendance_submit_manual)),
        "attendance.importSheet" => Some(with_db(state, req, attendance_import_sheet)),
        _ => None,
    }
}
