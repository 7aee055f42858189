use crate::config::PortalConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{config, db_err, require_admin, require_db, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::session;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedIn": state.session.is_some(),
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

    match db::open_db(&path) {
        Ok(conn) => {
            match session::purge_expired(&conn, Utc::now()) {
                Ok(n) if n > 0 => tracing::info!(purged = n, "expired sessions removed"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to purge expired sessions"),
            }
            // Sessions belong to a workspace; switching drops the current one.
            state.sign_out();
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            tracing::info!(workspace = %path.to_string_lossy(), "workspace opened");
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_config_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    to_json(config(conn)?)
}

fn handle_config_set(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let patch = req
        .params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;
    let next: PortalConfig = config(conn)?
        .patched(patch)
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    next.save(conn).map_err(db_err("db_update_failed"))?;
    tracing::info!("portal config updated");
    to_json(next)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "config.get" => Some(respond(&req.id, handle_config_get(state))),
        "config.set" => Some(respond(&req.id, handle_config_set(state, req))),
        _ => None,
    }
}
