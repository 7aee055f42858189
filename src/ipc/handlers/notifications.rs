use crate::db;
use crate::ipc::helpers::{
    db_err, get_opt_str, get_required_str, require_db, require_session, require_staff, respond,
    to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notifications::{self, NewNotification, ALL_RECIPIENTS, KINDS};
use crate::session::Role;
use serde_json::json;

fn handle_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let rows = notifications::list_visible(conn, cookie.role, &cookie.email)
        .map_err(db_err("db_query_failed"))?;
    let unread = rows.iter().filter(|n| !n.read).count();
    Ok(json!({ "notifications": to_json(rows)?, "unreadCount": unread }))
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let title = get_required_str(&req.params, "title")?;
    let message = get_required_str(&req.params, "message")?;
    let kind = get_opt_str(&req.params, "type").unwrap_or_else(|| "info".to_string());
    if !KINDS.contains(&kind.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "type must be one of {}",
            KINDS.join(", ")
        )));
    }
    let recipient_role = get_opt_str(&req.params, "recipientRole");
    let recipient_id = get_opt_str(&req.params, "recipientId");
    if let Some(r) = recipient_role.as_deref() {
        if r != ALL_RECIPIENTS && Role::parse(r).is_none() {
            return Err(HandlerErr::bad_params(format!("unknown recipientRole: {}", r)));
        }
    }
    if recipient_role.is_none() && recipient_id.is_none() {
        return Err(HandlerErr::bad_params("recipientRole or recipientId is required"));
    }
    let student_id = get_opt_str(&req.params, "studentId");

    let id = notifications::insert(
        conn,
        &NewNotification {
            title: &title,
            message: &message,
            kind: &kind,
            recipient_role: recipient_role.as_deref(),
            recipient_id: recipient_id.as_deref(),
            student_id: student_id.as_deref(),
        },
        &db::now_rfc3339(),
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "notificationId": id }))
}

fn handle_mark_read(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let id = get_required_str(&req.params, "notificationId")?;
    let updated = notifications::mark_read(conn, &id, cookie.role, &cookie.email)
        .map_err(db_err("db_update_failed"))?;
    if !updated {
        return Err(HandlerErr::not_found("notification not found"));
    }
    Ok(json!({ "read": true }))
}

fn handle_mark_all_read(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let n = notifications::mark_all_read(conn, cookie.role, &cookie.email)
        .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "updated": n }))
}

fn handle_clear_read(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let cleared = notifications::clear_read(&tx, cookie.role, &cookie.email)
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;
    to_json(cleared)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => handle_list(state),
        "notifications.create" => handle_create(state, req),
        "notifications.markRead" => handle_mark_read(state, req),
        "notifications.markAllRead" => handle_mark_all_read(state),
        "notifications.clearRead" => handle_clear_read(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
