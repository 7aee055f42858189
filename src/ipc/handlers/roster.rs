use crate::db;
use crate::ipc::helpers::{db_err, get_required_str, require_admin, require_db, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, RosterError};
use std::fs::File;
use std::path::PathBuf;

fn open_csv(req: &Request) -> Result<File, HandlerErr> {
    let path = PathBuf::from(get_required_str(&req.params, "path")?);
    File::open(&path).map_err(|e| {
        HandlerErr::new(
            "io_failed",
            format!("failed to open {}: {}", path.to_string_lossy(), e),
        )
    })
}

fn import_err(e: RosterError) -> HandlerErr {
    match e {
        RosterError::Csv(_) | RosterError::NoHeader => HandlerErr::new("import_failed", e.to_string()),
        RosterError::Account(_) | RosterError::Db(_) => HandlerErr::new("db_insert_failed", e.to_string()),
    }
}

fn handle_import_students(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let parsed = roster::parse_students(open_csv(req)?).map_err(import_err)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let summary = roster::apply_students(&tx, &parsed, &db::now_rfc3339()).map_err(import_err)?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(
        inserted = summary.inserted,
        updated = summary.updated,
        skipped = summary.skipped.len(),
        "student roster imported"
    );
    to_json(summary)
}

fn handle_import_users(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let parsed = roster::parse_users(open_csv(req)?).map_err(import_err)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let summary = roster::apply_users(&tx, &parsed).map_err(import_err)?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(
        inserted = summary.inserted,
        updated = summary.updated,
        "user logins imported"
    );
    to_json(summary)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "roster.importStudents" => handle_import_students(state, req),
        "roster.importUsers" => handle_import_users(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
