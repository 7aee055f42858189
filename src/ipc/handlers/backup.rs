use crate::backup;
use crate::db;
use crate::ipc::helpers::{get_required_str, require_admin, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_export(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_db(state)?;
    require_admin(state)?;
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
    let summary = backup::export_workspace_bundle(workspace, &out_path)
        .map_err(|e| HandlerErr::new("backup_failed", format!("{e:?}")))?;
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "materialCount": summary.material_count,
    }))
}

/// Replaces the workspace contents, reopens the database and signs the
/// caller out (the restored data has its own sessions). A failed import
/// keeps the session; the next request revalidates it against the reopened
/// database.
fn handle_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_db(state)?;
    require_admin(state)?;
    let Some(workspace) = state.workspace.clone() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let in_path = PathBuf::from(get_required_str(&req.params, "inPath")?);

    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace);
    let reopened = db::open_db(&workspace);
    if imported.is_ok() {
        state.sign_out();
    } else {
        state.last_validated = None;
    }
    match reopened {
        Ok(conn) => state.db = Some(conn),
        Err(e) => return Err(HandlerErr::new("db_open_failed", format!("{e:?}"))),
    }
    let summary = imported.map_err(|e| {
        tracing::warn!(bundle = %in_path.to_string_lossy(), "workspace import failed");
        HandlerErr::new("backup_failed", format!("{e:?}"))
    })?;
    tracing::info!(bundle = %in_path.to_string_lossy(), "workspace restored");

    Ok(json!({
        "ok": true,
        "workspacePath": workspace.to_string_lossy(),
        "bundleFormatDetected": summary.bundle_format_detected,
        "materialCount": summary.material_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.export" => handle_export(state, req),
        "backup.import" => handle_import(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
