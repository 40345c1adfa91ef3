use crate::catalog::BeltCatalog;
use crate::ipc::helpers::{get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roster::resolve_roster;
use rusqlite::Connection;
use serde_json::{json, Value};

fn roster_resolve(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let session_id = get_required_str(params, "classSessionId")?;
    let catalog = BeltCatalog::load(conn)?;
    let students = resolve_roster(conn, &catalog, &session_id)?;
    tracing::debug!(session_id = %session_id, students = students.len(), "roster resolved");
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "roster.resolve" => Some(with_db(state, req, roster_resolve)),
        _ => None,
    }
}
