use crate::config;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to open workspace");
            return err(&req.id, "db_open_failed", format!("{e:#}"), None);
        }
    };
    // A broken storage section must not keep the workspace closed.
    let busy_timeout = config::storage_settings(&conn)
        .map(|s| s.busy_timeout)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "storage settings unreadable, using defaults");
            config::StorageSettings::default().busy_timeout
        });
    if let Err(e) = conn.busy_timeout(busy_timeout) {
        return err(&req.id, "db_open_failed", e.to_string(), None);
    }

    tracing::info!(path = %path.display(), "workspace selected");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
